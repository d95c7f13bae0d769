use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;
use crate::coordination::{CoordError, Coordinator, LockKind};
use crate::settings::EngineConfig;
use crate::state::{run_blocking, RecordStore, StateError};

#[derive(Error, Debug)]
enum ScanError {
    #[error(transparent)]
    Coordination(#[from] CoordError),

    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityOutcome {
    AlreadyCompleted,
    /// Another worker is verifying; wait for its lock to go away.
    HeldByOther,
    Completed { max_id: u64, gaps: u64 },
    /// The record store failed mid-scan. The lock was released so the scan can be retried.
    Failed,
}

/// One-shot scan of the persisted ID space that seeds the retry queue with every ID
/// below the highest found profile that has no record at all.
pub struct IntegrityVerifier {
    coordinator: Coordinator,
    records: Arc<dyn RecordStore>,
    worker_id: String,
    lock_ttl: Duration,
}

impl IntegrityVerifier {
    pub fn new(
        coordinator: Coordinator,
        records: Arc<dyn RecordStore>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            records,
            worker_id: worker_id.into(),
            lock_ttl: Duration::from_secs(Config::INTEGRITY_LOCK_TTL_SECS),
        }
    }

    /// Run the scan if nobody has completed it and nobody else holds the lock.
    ///
    /// Only coordination errors are returned; a record-store failure is reported as
    /// [`IntegrityOutcome::Failed`].
    #[tracing::instrument(skip(self, config), fields(worker = %self.worker_id))]
    pub async fn run(&self, config: &EngineConfig) -> Result<IntegrityOutcome, CoordError> {
        if self.coordinator.integrity_completed().await? {
            return Ok(IntegrityOutcome::AlreadyCompleted);
        }
        if !self
            .coordinator
            .try_lock(LockKind::Integrity, &self.worker_id, self.lock_ttl)
            .await?
        {
            return Ok(IntegrityOutcome::HeldByOther);
        }
        // Another verifier may have finished between the flag check and the lock.
        if self.coordinator.integrity_completed().await? {
            self.coordinator
                .unlock(LockKind::Integrity, &self.worker_id)
                .await?;
            return Ok(IntegrityOutcome::AlreadyCompleted);
        }

        tracing::info!("Elected integrity verifier");
        let result = self.scan(config).await;
        let released = self
            .coordinator
            .unlock(LockKind::Integrity, &self.worker_id)
            .await;

        match result {
            Ok((max_id, gaps)) => {
                released?;
                tracing::info!(max_id, gaps, "Integrity check complete");
                Ok(IntegrityOutcome::Completed { max_id, gaps })
            }
            Err(ScanError::State(e)) => {
                released?;
                tracing::error!("Integrity check aborted by record store error: {}", e);
                Ok(IntegrityOutcome::Failed)
            }
            Err(ScanError::Coordination(e)) => Err(e),
        }
    }

    async fn scan(&self, config: &EngineConfig) -> Result<(u64, u64), ScanError> {
        self.coordinator.reset_volatile().await?;
        if run_blocking(&self.records, |records| records.ensure_indexes()).await? {
            tracing::info!("Record indexes rebuilt");
        }

        let max_id = run_blocking(&self.records, |records| records.max_found_id())
            .await?
            .unwrap_or(0);
        self.coordinator.set_cursor(max_id).await?;
        tracing::info!(max_id, "Cursor initialised, scanning for gaps");

        let step = config.integrity_batch_size.max(1);
        let mut total_gaps = 0u64;
        let mut start = 1u64;
        while start <= max_id {
            let end = start.saturating_add(step - 1).min(max_id);
            let present =
                run_blocking(&self.records, move |records| records.ids_in_range(start, end))
                    .await?;
            let gaps = compute_gaps(start, end, &present);
            if !gaps.is_empty() {
                self.coordinator.push_retry(&gaps).await?;
                total_gaps += gaps.len() as u64;
                tracing::debug!(start, end, gaps = gaps.len(), "Queued gaps");
            }

            self.coordinator
                .refresh_lock(LockKind::Integrity, self.lock_ttl)
                .await?;
            self.coordinator.refresh_run_status(&self.worker_id).await?;

            start = match end.checked_add(1) {
                Some(next) => next,
                None => break,
            };
        }

        self.coordinator.mark_integrity_completed().await?;
        Ok((max_id, total_gaps))
    }
}

/// IDs in `[start, end]` missing from `present`. `present` must be sorted ascending.
pub fn compute_gaps(start: u64, end: u64, present: &[u64]) -> Vec<u64> {
    let mut gaps = Vec::new();
    let mut existing = present.iter().copied().peekable();
    for id in start..=end {
        while existing.next_if(|&p| p < id).is_some() {}
        if existing.next_if_eq(&id).is_none() {
            gaps.push(id);
        }
    }
    gaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryStore;
    use crate::models::{PersistedRecord, Profile};
    use crate::models::RunStatus;
    use crate::state::RedbRecordStore;
    use chrono::Utc;
    use tempfile::TempDir;

    fn found(id: u64) -> PersistedRecord {
        PersistedRecord::found(
            Profile {
                id,
                nickname: format!("user{}", id),
                registered_at: String::new(),
                rating: None,
                review_count: 0,
                lot_count: 0,
                is_banned: false,
                is_support: false,
                scraped_at: Utc::now(),
            },
            "seed",
        )
    }

    fn setup(ids: &[u64]) -> (TempDir, Coordinator, Arc<dyn RecordStore>) {
        let dir = TempDir::new().unwrap();
        let records = RedbRecordStore::new(dir.path()).unwrap();
        let batch: Vec<PersistedRecord> = ids.iter().map(|id| found(*id)).collect();
        records.upsert_batch(&batch).unwrap();
        let coord = Coordinator::new(Arc::new(MemoryStore::new()));
        (dir, coord, Arc::new(records))
    }

    #[test]
    fn test_compute_gaps() {
        assert_eq!(compute_gaps(1, 7, &[1, 2, 4, 5, 7]), vec![3, 6]);
        assert_eq!(compute_gaps(1, 3, &[]), vec![1, 2, 3]);
        assert_eq!(compute_gaps(5, 6, &[5, 6]), Vec::<u64>::new());
        assert_eq!(compute_gaps(3, 5, &[1, 4, 9]), vec![3, 5]);
    }

    #[tokio::test]
    async fn test_verifier_queues_exactly_the_gaps() {
        let (_dir, coord, records) = setup(&[1, 2, 4, 5, 7]);
        let verifier = IntegrityVerifier::new(coord.clone(), records, "w1");
        let config = EngineConfig {
            integrity_batch_size: 3,
            ..EngineConfig::default()
        };

        let outcome = verifier.run(&config).await.unwrap();
        assert_eq!(outcome, IntegrityOutcome::Completed { max_id: 7, gaps: 2 });
        assert_eq!(coord.pop_retry(10).await.unwrap(), vec![3, 6]);
        assert_eq!(coord.cursor().await.unwrap(), 7);
        assert!(coord.integrity_completed().await.unwrap());
        assert!(!coord.lock_held(LockKind::Integrity).await.unwrap());
    }

    #[tokio::test]
    async fn test_tombstones_are_not_gaps_but_do_not_raise_max() {
        let (_dir, coord, records) = setup(&[1, 3]);
        records
            .upsert_batch(&[
                PersistedRecord::tombstone(2, "seed"),
                PersistedRecord::tombstone(9, "seed"),
            ])
            .unwrap();
        let verifier = IntegrityVerifier::new(coord.clone(), records, "w1");

        let outcome = verifier.run(&EngineConfig::default()).await.unwrap();
        assert_eq!(outcome, IntegrityOutcome::Completed { max_id: 3, gaps: 0 });
        assert_eq!(coord.retry_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_skips_when_completed_or_locked() {
        let (_dir, coord, records) = setup(&[2]);
        let verifier = IntegrityVerifier::new(coord.clone(), records, "w1");

        coord
            .try_lock(LockKind::Integrity, "w2", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            verifier.run(&EngineConfig::default()).await.unwrap(),
            IntegrityOutcome::HeldByOther
        );

        coord.unlock(LockKind::Integrity, "w2").await.unwrap();
        coord.mark_integrity_completed().await.unwrap();
        assert_eq!(
            verifier.run(&EngineConfig::default()).await.unwrap(),
            IntegrityOutcome::AlreadyCompleted
        );
        assert_eq!(coord.retry_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resets_stale_breaker_state() {
        let (_dir, coord, records) = setup(&[1]);
        coord.set_run_status("w1", RunStatus::Running).await.unwrap();
        coord.incr_not_found().await.unwrap();
        coord.set_pause_until(i64::MAX).await.unwrap();
        let verifier = IntegrityVerifier::new(coord.clone(), records, "w1");

        verifier.run(&EngineConfig::default()).await.unwrap();
        assert_eq!(coord.consecutive_not_found().await.unwrap(), 0);
        assert_eq!(coord.pause_until().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_store_completes_with_zero_cursor() {
        let (_dir, coord, records) = setup(&[]);
        let verifier = IntegrityVerifier::new(coord.clone(), records, "w1");
        assert_eq!(
            verifier.run(&EngineConfig::default()).await.unwrap(),
            IntegrityOutcome::Completed { max_id: 0, gaps: 0 }
        );
        assert_eq!(coord.cursor().await.unwrap(), 0);
    }
}
