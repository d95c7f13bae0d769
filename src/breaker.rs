use chrono::Utc;
use std::time::Duration;

use crate::coordination::{CoordError, Coordinator, PauseState};
use crate::models::{Provenance, WorkItem};
use crate::settings::EngineConfig;

/// Decision for one not-found outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundVerdict {
    /// Below the limit: persist a tombstone and carry on.
    Record,
    /// This outcome hit the limit. The fleet is paused and the cursor was rewound to
    /// `rewind_to` when the run start was known. Abandon the rest of the batch.
    Tripped { rewind_to: Option<u64> },
    /// Someone else already tripped the breaker for this run. Abandon the batch and
    /// requeue all of it: the cursor may have moved past these IDs since the rewind.
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseCheck {
    Clear,
    Paused { remaining: Duration },
    /// The pause just ended; this worker cleared the key.
    Resumed,
}

/// Fleet-wide consecutive not-found counter.
///
/// One worker alone cannot tell that the ID space beyond some point is empty because
/// workers interleave sub-ranges, so the run length lives in the shared store.
pub struct CircuitBreaker {
    coordinator: Coordinator,
    worker_id: String,
}

impl CircuitBreaker {
    pub fn new(coordinator: Coordinator, worker_id: impl Into<String>) -> Self {
        Self {
            coordinator,
            worker_id: worker_id.into(),
        }
    }

    pub async fn on_not_found(
        &self,
        id: u64,
        config: &EngineConfig,
    ) -> Result<NotFoundVerdict, CoordError> {
        let count = self.coordinator.incr_not_found().await?;
        if count == 1 {
            self.coordinator.set_run_start(id).await?;
        }
        self.coordinator.set_last_not_found(id).await?;

        let limit = config.consecutive_not_found_limit;
        if count < limit {
            return Ok(NotFoundVerdict::Record);
        }
        if count > limit {
            return Ok(NotFoundVerdict::Halted);
        }

        let pause = config.pause_duration();
        let until_ms = Utc::now().timestamp_millis() + pause.as_millis() as i64;
        self.coordinator.set_pause_until(until_ms).await?;
        tracing::warn!(
            worker = %self.worker_id,
            id,
            limit,
            "Consecutive not-found limit reached, pausing fleet for {} minutes",
            pause.as_secs() / 60
        );

        let rewind_to = match self.coordinator.run_start().await? {
            Some(start) => {
                let rewind_to = start.saturating_sub(1);
                self.coordinator.set_cursor(rewind_to).await?;
                tracing::info!(worker = %self.worker_id, "Cursor rewound to {}", rewind_to);
                Some(rewind_to)
            }
            None => None,
        };
        Ok(NotFoundVerdict::Tripped { rewind_to })
    }

    /// A found profile ends the run.
    pub async fn on_found(&self) -> Result<(), CoordError> {
        self.coordinator.clear_not_found_run().await
    }

    /// Called before every allocation.
    pub async fn check_pause(&self) -> Result<PauseCheck, CoordError> {
        let now_ms = Utc::now().timestamp_millis();
        match self.coordinator.pause_state(now_ms).await? {
            PauseState::Clear => Ok(PauseCheck::Clear),
            PauseState::Paused { until_ms } => Ok(PauseCheck::Paused {
                remaining: Duration::from_millis((until_ms - now_ms).max(0) as u64),
            }),
            PauseState::Expired { .. } => {
                if self.coordinator.clear_pause().await? {
                    // Only the worker that removed the pause resets the stale run.
                    self.coordinator.clear_not_found_run().await?;
                    tracing::info!(worker = %self.worker_id, "Fleet pause elapsed, resuming");
                    Ok(PauseCheck::Resumed)
                } else {
                    Ok(PauseCheck::Clear)
                }
            }
        }
    }
}

/// Whether an abandoned item must go back on the retry queue. Fresh IDs past the rewind
/// point are handed out again by the cursor; everything else would be lost.
pub fn should_requeue(item: &WorkItem, rewind_to: Option<u64>) -> bool {
    match (item.provenance, rewind_to) {
        (Provenance::Retry, _) => true,
        (Provenance::Fresh, Some(rewind_to)) => item.id <= rewind_to,
        (Provenance::Fresh, None) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryStore;
    use std::sync::Arc;

    fn setup() -> (Coordinator, CircuitBreaker) {
        let coord = Coordinator::new(Arc::new(MemoryStore::new()));
        let breaker = CircuitBreaker::new(coord.clone(), "w1");
        (coord, breaker)
    }

    fn config(limit: u64) -> EngineConfig {
        EngineConfig {
            consecutive_not_found_limit: limit,
            pause_duration_ms: 60_000,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_first_not_found_records_run_start() {
        let (coord, breaker) = setup();
        let verdict = breaker.on_not_found(11, &config(3)).await.unwrap();
        assert_eq!(verdict, NotFoundVerdict::Record);
        assert_eq!(coord.run_start().await.unwrap(), Some(11));
        assert_eq!(coord.last_not_found().await.unwrap(), Some(11));

        breaker.on_not_found(12, &config(3)).await.unwrap();
        assert_eq!(coord.run_start().await.unwrap(), Some(11));
        assert_eq!(coord.last_not_found().await.unwrap(), Some(12));
    }

    #[tokio::test]
    async fn test_found_resets_run() {
        let (coord, breaker) = setup();
        breaker.on_not_found(5, &config(3)).await.unwrap();
        breaker.on_found().await.unwrap();
        assert_eq!(coord.consecutive_not_found().await.unwrap(), 0);
        assert_eq!(coord.run_start().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_trip_pauses_and_rewinds() {
        let (coord, breaker) = setup();
        coord.set_cursor(200).await.unwrap();
        let config = config(3);

        assert_eq!(breaker.on_not_found(101, &config).await.unwrap(), NotFoundVerdict::Record);
        assert_eq!(breaker.on_not_found(102, &config).await.unwrap(), NotFoundVerdict::Record);
        let verdict = breaker.on_not_found(103, &config).await.unwrap();
        assert_eq!(verdict, NotFoundVerdict::Tripped { rewind_to: Some(100) });

        assert_eq!(coord.cursor().await.unwrap(), 100);
        assert!(matches!(breaker.check_pause().await.unwrap(), PauseCheck::Paused { .. }));

        // A concurrent worker past the limit does not trip again.
        assert_eq!(breaker.on_not_found(150, &config).await.unwrap(), NotFoundVerdict::Halted);
        assert_eq!(coord.cursor().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_expired_pause_is_cleared_once() {
        let (coord, breaker) = setup();
        coord.incr_not_found().await.unwrap();
        coord.set_run_start(7).await.unwrap();
        coord
            .set_pause_until(Utc::now().timestamp_millis() - 1_000)
            .await
            .unwrap();

        let other = CircuitBreaker::new(coord.clone(), "w2");
        assert_eq!(breaker.check_pause().await.unwrap(), PauseCheck::Resumed);
        assert_eq!(other.check_pause().await.unwrap(), PauseCheck::Clear);
        assert_eq!(coord.consecutive_not_found().await.unwrap(), 0);
        assert_eq!(coord.run_start().await.unwrap(), None);
    }

    #[test]
    fn test_requeue_rule() {
        assert!(should_requeue(&WorkItem::retry(500), Some(100)));
        assert!(should_requeue(&WorkItem::fresh(90), Some(100)));
        assert!(should_requeue(&WorkItem::fresh(100), Some(100)));
        assert!(!should_requeue(&WorkItem::fresh(101), Some(100)));
        assert!(should_requeue(&WorkItem::fresh(101), None));
    }
}
