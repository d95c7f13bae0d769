use std::sync::Arc;
use std::time::Duration;

use super::keys;
use super::{CoordError, CoordinationStore};
use crate::config::Config;
use crate::models::RunStatus;

/// The mutual-exclusion locks of the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Guards advancing the shared cursor.
    Allocation,
    /// Elects the single integrity verifier.
    Integrity,
    /// Names the one process whose record store the fleet writes to.
    RecordStore,
}

impl LockKind {
    fn key(self) -> &'static str {
        match self {
            LockKind::Allocation => keys::ALLOCATION_LOCK,
            LockKind::Integrity => keys::INTEGRITY_LOCK,
            LockKind::RecordStore => keys::RECORD_STORE_OWNER,
        }
    }
}

/// Fleet pause as seen at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseState {
    Clear,
    /// Paused until this epoch millisecond.
    Paused { until_ms: i64 },
    /// A pause key is present but already in the past.
    Expired { until_ms: i64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateStats {
    pub found: u64,
    pub support: u64,
    pub banned: u64,
}

/// Typed view of the shared coordination state.
///
/// Cheap to clone; every clone talks to the same store.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn CoordinationStore>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    async fn get_u64(&self, key: &str) -> Result<Option<u64>, CoordError> {
        match self.store.get(key).await? {
            Some(raw) => parse_u64(key, &raw).map(Some),
            None => Ok(None),
        }
    }

    async fn get_i64(&self, key: &str) -> Result<Option<i64>, CoordError> {
        match self.store.get(key).await? {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| CoordError::Corrupt {
                    key: key.to_string(),
                    value: raw,
                }),
            None => Ok(None),
        }
    }

    // ---- cursor ----

    /// Highest ID ever handed out by the allocator; zero before the first allocation.
    pub async fn cursor(&self) -> Result<u64, CoordError> {
        Ok(self.get_u64(keys::NEXT_ID).await?.unwrap_or(0))
    }

    /// Atomically move the cursor forward by `by`, returning the new value.
    pub async fn advance_cursor(&self, by: u64) -> Result<u64, CoordError> {
        let next = self.store.incr_by(keys::NEXT_ID, by as i64).await?;
        u64::try_from(next).map_err(|_| CoordError::Corrupt {
            key: keys::NEXT_ID.to_string(),
            value: next.to_string(),
        })
    }

    pub async fn set_cursor(&self, value: u64) -> Result<(), CoordError> {
        self.store
            .set(keys::NEXT_ID, &value.to_string(), None)
            .await
    }

    // ---- retry queue ----

    pub async fn push_retry(&self, ids: &[u64]) -> Result<u64, CoordError> {
        let values: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        self.store.push_back(keys::RETRY_QUEUE, &values).await
    }

    /// Pop up to `count` IDs. Unparsable entries are dropped with a warning.
    pub async fn pop_retry(&self, count: usize) -> Result<Vec<u64>, CoordError> {
        let raw = self.store.pop_front(keys::RETRY_QUEUE, count).await?;
        Ok(raw
            .into_iter()
            .filter_map(|value| match value.trim().parse::<u64>() {
                Ok(id) => Some(id),
                Err(_) => {
                    tracing::warn!(value = %value, "Dropping unparsable retry queue entry");
                    None
                }
            })
            .collect())
    }

    pub async fn retry_len(&self) -> Result<u64, CoordError> {
        self.store.list_len(keys::RETRY_QUEUE).await
    }

    // ---- locks ----

    pub async fn try_lock(
        &self,
        kind: LockKind,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, CoordError> {
        self.store.set_nx(kind.key(), owner, ttl).await
    }

    /// Release only if `owner` still holds the lock.
    pub async fn unlock(&self, kind: LockKind, owner: &str) -> Result<bool, CoordError> {
        self.store.compare_and_delete(kind.key(), owner).await
    }

    pub async fn lock_owner(&self, kind: LockKind) -> Result<Option<String>, CoordError> {
        self.store.get(kind.key()).await
    }

    pub async fn lock_held(&self, kind: LockKind) -> Result<bool, CoordError> {
        self.store.exists(kind.key()).await
    }

    pub async fn refresh_lock(&self, kind: LockKind, ttl: Duration) -> Result<bool, CoordError> {
        self.store.expire(kind.key(), ttl).await
    }

    // ---- not-found run ----

    pub async fn incr_not_found(&self) -> Result<u64, CoordError> {
        let count = self.store.incr_by(keys::CONSECUTIVE_NOT_FOUND, 1).await?;
        Ok(count.max(0) as u64)
    }

    pub async fn consecutive_not_found(&self) -> Result<u64, CoordError> {
        Ok(self
            .get_u64(keys::CONSECUTIVE_NOT_FOUND)
            .await?
            .unwrap_or(0))
    }

    pub async fn set_run_start(&self, id: u64) -> Result<(), CoordError> {
        self.store
            .set(keys::NOT_FOUND_RUN_START, &id.to_string(), None)
            .await
    }

    pub async fn run_start(&self) -> Result<Option<u64>, CoordError> {
        self.get_u64(keys::NOT_FOUND_RUN_START).await
    }

    pub async fn clear_not_found_run(&self) -> Result<(), CoordError> {
        self.store
            .del(&[keys::CONSECUTIVE_NOT_FOUND, keys::NOT_FOUND_RUN_START])
            .await?;
        Ok(())
    }

    pub async fn set_last_not_found(&self, id: u64) -> Result<(), CoordError> {
        self.store
            .set(keys::LAST_NOT_FOUND_ID, &id.to_string(), None)
            .await
    }

    pub async fn last_not_found(&self) -> Result<Option<u64>, CoordError> {
        self.get_u64(keys::LAST_NOT_FOUND_ID).await
    }

    // ---- fleet pause ----

    pub async fn pause_until(&self) -> Result<Option<i64>, CoordError> {
        self.get_i64(keys::PAUSE_UNTIL).await
    }

    pub async fn set_pause_until(&self, until_ms: i64) -> Result<(), CoordError> {
        self.store
            .set(keys::PAUSE_UNTIL, &until_ms.to_string(), None)
            .await
    }

    /// Returns true only for the caller whose delete removed the key.
    pub async fn clear_pause(&self) -> Result<bool, CoordError> {
        Ok(self.store.del(&[keys::PAUSE_UNTIL]).await? == 1)
    }

    pub async fn pause_state(&self, now_ms: i64) -> Result<PauseState, CoordError> {
        Ok(match self.pause_until().await? {
            None => PauseState::Clear,
            Some(until_ms) if until_ms > now_ms => PauseState::Paused { until_ms },
            Some(until_ms) => PauseState::Expired { until_ms },
        })
    }

    // ---- run status ----

    pub async fn set_run_status(&self, worker_id: &str, status: RunStatus) -> Result<(), CoordError> {
        self.store
            .set(
                &keys::run_status(worker_id),
                status.as_str(),
                Some(Duration::from_secs(Config::RUN_STATUS_TTL_SECS)),
            )
            .await
    }

    /// Set `running` only if the worker has no run-status key yet.
    pub async fn register_run_status(&self, worker_id: &str) -> Result<bool, CoordError> {
        self.store
            .set_nx(
                &keys::run_status(worker_id),
                RunStatus::Running.as_str(),
                Duration::from_secs(Config::RUN_STATUS_TTL_SECS),
            )
            .await
    }

    /// `None` when the key is missing or expired.
    pub async fn run_status(&self, worker_id: &str) -> Result<Option<RunStatus>, CoordError> {
        let key = keys::run_status(worker_id);
        match self.store.get(&key).await? {
            Some(raw) => RunStatus::parse(&raw)
                .map(Some)
                .ok_or(CoordError::Corrupt { key, value: raw }),
            None => Ok(None),
        }
    }

    pub async fn refresh_run_status(&self, worker_id: &str) -> Result<bool, CoordError> {
        self.store
            .expire(
                &keys::run_status(worker_id),
                Duration::from_secs(Config::RUN_STATUS_TTL_SECS),
            )
            .await
    }

    pub async fn remove_run_status(&self, worker_id: &str) -> Result<bool, CoordError> {
        let key = keys::run_status(worker_id);
        Ok(self.store.del(&[key.as_str()]).await? == 1)
    }

    /// IDs of every worker whose run-status key is still present.
    pub async fn live_workers(&self) -> Result<Vec<String>, CoordError> {
        let keys = self.store.keys_with_prefix(keys::RUN_STATUS_PREFIX).await?;
        let mut workers: Vec<String> = keys
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(keys::RUN_STATUS_PREFIX)
                    .map(str::to_string)
            })
            .collect();
        workers.sort();
        Ok(workers)
    }

    // ---- integrity ----

    pub async fn integrity_completed(&self) -> Result<bool, CoordError> {
        self.store.exists(keys::INTEGRITY_COMPLETED).await
    }

    pub async fn mark_integrity_completed(&self) -> Result<(), CoordError> {
        self.store.set(keys::INTEGRITY_COMPLETED, "1", None).await
    }

    pub async fn clear_integrity_completed(&self) -> Result<(), CoordError> {
        self.store.del(&[keys::INTEGRITY_COMPLETED]).await?;
        Ok(())
    }

    /// Drop breaker and allocator state a previous fleet may have left behind.
    pub async fn reset_volatile(&self) -> Result<(), CoordError> {
        self.store.del(keys::VOLATILE).await?;
        Ok(())
    }

    // ---- aggregate stats ----

    pub async fn record_stats(&self, delta: AggregateStats) -> Result<(), CoordError> {
        for (key, value) in [
            (keys::STATS_FOUND, delta.found),
            (keys::STATS_SUPPORT, delta.support),
            (keys::STATS_BANNED, delta.banned),
        ] {
            if value > 0 {
                self.store.incr_by(key, value as i64).await?;
            }
        }
        Ok(())
    }

    pub async fn aggregate_stats(&self) -> Result<AggregateStats, CoordError> {
        Ok(AggregateStats {
            found: self.get_u64(keys::STATS_FOUND).await?.unwrap_or(0),
            support: self.get_u64(keys::STATS_SUPPORT).await?.unwrap_or(0),
            banned: self.get_u64(keys::STATS_BANNED).await?.unwrap_or(0),
        })
    }

    /// Push entries onto the head of the recent ring, newest last in `entries`, then
    /// trim the ring to `limit`.
    pub async fn push_recent(&self, entries: &[String], limit: usize) -> Result<(), CoordError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.store.push_front(keys::RECENT_PROFILES, entries).await?;
        self.store.trim(keys::RECENT_PROFILES, limit).await
    }

    /// Newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<String>, CoordError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store.range(keys::RECENT_PROFILES, 0, limit - 1).await
    }

    // ---- shared configuration ----

    pub async fn config_blob(&self) -> Result<Option<String>, CoordError> {
        self.store.get(keys::ENGINE_CONFIG).await
    }

    pub async fn set_config_blob(&self, raw: &str) -> Result<(), CoordError> {
        self.store.set(keys::ENGINE_CONFIG, raw, None).await
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64, CoordError> {
    raw.trim().parse::<u64>().map_err(|_| CoordError::Corrupt {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryStore;

    fn coordinator() -> Coordinator {
        Coordinator::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_cursor_starts_at_zero_and_advances() {
        let coord = coordinator();
        assert_eq!(coord.cursor().await.unwrap(), 0);
        assert_eq!(coord.advance_cursor(20).await.unwrap(), 20);
        coord.set_cursor(5).await.unwrap();
        assert_eq!(coord.advance_cursor(3).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_retry_queue_skips_garbage() {
        let coord = coordinator();
        coord.push_retry(&[4, 9]).await.unwrap();
        coord
            .store()
            .push_back(keys::RETRY_QUEUE, &["oops".to_string(), "11".to_string()])
            .await
            .unwrap();
        assert_eq!(coord.retry_len().await.unwrap(), 4);
        assert_eq!(coord.pop_retry(10).await.unwrap(), vec![4, 9, 11]);
    }

    #[tokio::test]
    async fn test_locks_are_owner_checked() {
        let coord = coordinator();
        let ttl = Duration::from_secs(5);
        assert!(coord.try_lock(LockKind::Allocation, "w1", ttl).await.unwrap());
        assert!(!coord.try_lock(LockKind::Allocation, "w2", ttl).await.unwrap());
        assert!(!coord.lock_held(LockKind::Integrity).await.unwrap());

        assert!(!coord.unlock(LockKind::Allocation, "w2").await.unwrap());
        assert!(coord.unlock(LockKind::Allocation, "w1").await.unwrap());
        assert!(!coord.lock_held(LockKind::Allocation).await.unwrap());
    }

    #[tokio::test]
    async fn test_pause_state_transitions() {
        let coord = coordinator();
        assert_eq!(coord.pause_state(1_000).await.unwrap(), PauseState::Clear);

        coord.set_pause_until(5_000).await.unwrap();
        assert_eq!(
            coord.pause_state(1_000).await.unwrap(),
            PauseState::Paused { until_ms: 5_000 }
        );
        assert_eq!(
            coord.pause_state(6_000).await.unwrap(),
            PauseState::Expired { until_ms: 5_000 }
        );

        assert!(coord.clear_pause().await.unwrap());
        assert!(!coord.clear_pause().await.unwrap());
    }

    #[tokio::test]
    async fn test_run_status_and_live_workers() {
        let coord = coordinator();
        coord.set_run_status("b", RunStatus::Running).await.unwrap();
        coord.set_run_status("a", RunStatus::StopRequested).await.unwrap();

        assert_eq!(coord.run_status("a").await.unwrap(), Some(RunStatus::StopRequested));
        assert_eq!(coord.run_status("zzz").await.unwrap(), None);
        assert_eq!(coord.live_workers().await.unwrap(), vec!["a", "b"]);

        assert!(coord.remove_run_status("a").await.unwrap());
        assert_eq!(coord.live_workers().await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_reset_volatile_keeps_cursor() {
        let coord = coordinator();
        coord.set_cursor(42).await.unwrap();
        coord.incr_not_found().await.unwrap();
        coord.set_run_start(40).await.unwrap();
        coord.set_pause_until(99).await.unwrap();

        coord.reset_volatile().await.unwrap();
        assert_eq!(coord.cursor().await.unwrap(), 42);
        assert_eq!(coord.consecutive_not_found().await.unwrap(), 0);
        assert_eq!(coord.run_start().await.unwrap(), None);
        assert_eq!(coord.pause_until().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stats_and_recent_ring() {
        let coord = coordinator();
        coord
            .record_stats(AggregateStats {
                found: 3,
                support: 1,
                banned: 0,
            })
            .await
            .unwrap();
        coord
            .record_stats(AggregateStats {
                found: 2,
                support: 0,
                banned: 1,
            })
            .await
            .unwrap();
        assert_eq!(
            coord.aggregate_stats().await.unwrap(),
            AggregateStats {
                found: 5,
                support: 1,
                banned: 1,
            }
        );

        let entries: Vec<String> = (1..=5).map(|i| i.to_string()).collect();
        coord.push_recent(&entries, 3).await.unwrap();
        assert_eq!(coord.recent(10).await.unwrap(), vec!["5", "4", "3"]);
    }
}
