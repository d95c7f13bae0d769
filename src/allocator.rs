use std::time::Duration;

use crate::backoff::ExponentialBackoff;
use crate::config::Config;
use crate::coordination::{CoordError, Coordinator, LockKind};
use crate::models::WorkItem;

/// Hands out batches of IDs to one worker.
///
/// Retry-queue IDs always go first. Only when the queue is empty does the allocator take
/// the allocation lock and advance the shared cursor, so fresh ranges handed to different
/// workers never overlap.
pub struct Allocator {
    coordinator: Coordinator,
    worker_id: String,
    backoff: ExponentialBackoff,
    lock_ttl: Duration,
}

impl Allocator {
    pub fn new(coordinator: Coordinator, worker_id: impl Into<String>) -> Self {
        Self {
            coordinator,
            worker_id: worker_id.into(),
            backoff: ExponentialBackoff::for_lock_contention(),
            lock_ttl: Duration::from_secs(Config::ALLOCATION_LOCK_TTL_SECS),
        }
    }

    /// Next batch of at most `batch_size` IDs. Either every ID comes from the retry queue
    /// or they form one contiguous fresh range. A store error yields no partial batch.
    #[tracing::instrument(skip(self), fields(worker = %self.worker_id))]
    pub async fn allocate_batch(&self, batch_size: u64) -> Result<Vec<WorkItem>, CoordError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let retried = self.coordinator.pop_retry(batch_size as usize).await?;
        if !retried.is_empty() {
            tracing::debug!(count = retried.len(), "Allocated from retry queue");
            return Ok(retried.into_iter().map(WorkItem::retry).collect());
        }

        self.acquire_lock().await?;
        let advanced = self.coordinator.advance_cursor(batch_size).await;
        // Release before surfacing any cursor error; the TTL covers a failed release.
        if let Err(e) = self
            .coordinator
            .unlock(LockKind::Allocation, &self.worker_id)
            .await
        {
            tracing::warn!("Failed to release allocation lock: {}", e);
        }

        let end = advanced?;
        let start = end.saturating_sub(batch_size) + 1;
        tracing::debug!(start, end, "Allocated fresh range");
        Ok((start..=end).map(WorkItem::fresh).collect())
    }

    async fn acquire_lock(&self) -> Result<(), CoordError> {
        let mut attempt = 0u32;
        loop {
            if self
                .coordinator
                .try_lock(LockKind::Allocation, &self.worker_id, self.lock_ttl)
                .await?
            {
                return Ok(());
            }
            let delay = self.backoff.delay(attempt);
            tracing::trace!(attempt, ?delay, "Allocation lock busy");
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryStore;
    use crate::models::Provenance;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn coordinator() -> Coordinator {
        Coordinator::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_fresh_range_is_contiguous() {
        let coord = coordinator();
        let allocator = Allocator::new(coord.clone(), "w1");

        let first = allocator.allocate_batch(3).await.unwrap();
        assert_eq!(first, vec![WorkItem::fresh(1), WorkItem::fresh(2), WorkItem::fresh(3)]);
        let second = allocator.allocate_batch(2).await.unwrap();
        assert_eq!(second, vec![WorkItem::fresh(4), WorkItem::fresh(5)]);
        assert_eq!(coord.cursor().await.unwrap(), 5);
        assert!(!coord.lock_held(LockKind::Allocation).await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_queue_takes_priority() {
        let coord = coordinator();
        coord.push_retry(&[40, 41, 42]).await.unwrap();
        let allocator = Allocator::new(coord.clone(), "w1");

        let batch = allocator.allocate_batch(2).await.unwrap();
        assert_eq!(batch, vec![WorkItem::retry(40), WorkItem::retry(41)]);
        let batch = allocator.allocate_batch(2).await.unwrap();
        assert_eq!(batch, vec![WorkItem::retry(42)]);
        assert!(batch.iter().all(|item| item.provenance == Provenance::Retry));

        // Cursor untouched until the queue drains.
        assert_eq!(coord.cursor().await.unwrap(), 0);
        assert_eq!(allocator.allocate_batch(2).await.unwrap()[0], WorkItem::fresh(1));
    }

    #[tokio::test]
    async fn test_waits_out_a_held_lock() {
        let coord = coordinator();
        coord
            .try_lock(LockKind::Allocation, "other", Duration::from_millis(150))
            .await
            .unwrap();
        let allocator = Allocator::new(coord.clone(), "w1");

        let batch = allocator.allocate_batch(1).await.unwrap();
        assert_eq!(batch, vec![WorkItem::fresh(1)]);
    }

    #[tokio::test]
    async fn test_concurrent_workers_get_disjoint_ranges() {
        let coord = coordinator();
        let mut handles = Vec::new();
        for worker in 0..8 {
            let allocator = Allocator::new(coord.clone(), format!("w{}", worker));
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..5 {
                    ids.extend(allocator.allocate_batch(7).await.unwrap());
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for item in handle.await.unwrap() {
                assert!(seen.insert(item.id), "id {} allocated twice", item.id);
            }
        }
        assert_eq!(seen.len(), 8 * 5 * 7);
        assert_eq!(coord.cursor().await.unwrap(), 8 * 5 * 7);
    }
}
