//! Operator-facing control and status surface.
//!
//! `start` and `stop` only touch a worker's run-status key; the worker itself notices the
//! change on its next loop iteration. `stats` gathers the fleet-wide numbers a dashboard
//! would show.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::coordination::{CoordError, Coordinator, LockKind, PauseState};
use crate::models::RunStatus;
use crate::settings::EngineConfig;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Worker {0} is already running")]
    AlreadyRunning(String),

    #[error("Invalid worker id {0:?}")]
    InvalidWorkerId(String),

    #[error("Coordination store failure: {0}")]
    Coordination(#[from] CoordError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    pub action: ControlAction,
    pub worker_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub is_running: bool,
    pub worker_id: String,
}

/// Point-in-time view of the whole fleet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetStats {
    pub found: u64,
    pub support: u64,
    pub banned: u64,
    pub target_goal: u64,
    pub progress_pct: f64,
    pub cursor: u64,
    pub retry_queue: u64,
    pub consecutive_not_found: u64,
    pub last_not_found_id: Option<u64>,
    pub paused_until_ms: Option<i64>,
    pub integrity_completed: bool,
    pub integrity_running: bool,
    pub live_workers: Vec<String>,
    pub recent: Vec<serde_json::Value>,
}

#[derive(Clone)]
pub struct ControlSurface {
    coordinator: Coordinator,
    stop_grace: Duration,
}

impl ControlSurface {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            stop_grace: Duration::from_secs(Config::STOP_GRACE_SECS),
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Register a worker as running. Fails if its run-status key already exists.
    pub async fn start(&self, worker_id: &str) -> Result<WorkerStatus, ControlError> {
        validate_worker_id(worker_id)?;
        if !self.coordinator.register_run_status(worker_id).await? {
            return Err(ControlError::AlreadyRunning(worker_id.to_string()));
        }
        tracing::info!(worker = worker_id, "Worker registered");
        Ok(WorkerStatus {
            is_running: true,
            worker_id: worker_id.to_string(),
        })
    }

    /// Signal a worker to stop and schedule a forced delete of its run-status key.
    ///
    /// The returned task finishes once the key is gone. Callers that exit right away
    /// should await it.
    pub async fn stop(&self, worker_id: &str) -> Result<JoinHandle<()>, ControlError> {
        validate_worker_id(worker_id)?;
        self.coordinator
            .set_run_status(worker_id, RunStatus::StopRequested)
            .await?;
        tracing::info!(worker = worker_id, "Stop requested");

        let coordinator = self.coordinator.clone();
        let grace = self.stop_grace;
        let worker_id = worker_id.to_string();
        Ok(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            match coordinator.remove_run_status(&worker_id).await {
                Ok(true) => tracing::info!(worker = %worker_id, "Forced run-status removal"),
                Ok(false) => {}
                Err(e) => tracing::warn!(worker = %worker_id, "Forced removal failed: {}", e),
            }
        }))
    }

    pub async fn status(&self, worker_id: &str) -> Result<WorkerStatus, ControlError> {
        let is_running = self.coordinator.run_status(worker_id).await?.is_some();
        Ok(WorkerStatus {
            is_running,
            worker_id: worker_id.to_string(),
        })
    }

    /// Apply a control request and acknowledge immediately. A stop's forced removal runs
    /// in the background.
    pub async fn handle(&self, request: ControlRequest) -> Result<WorkerStatus, ControlError> {
        match request.action {
            ControlAction::Start => self.start(&request.worker_id).await,
            ControlAction::Stop => {
                let _forced_removal = self.stop(&request.worker_id).await?;
                self.status(&request.worker_id).await
            }
        }
    }

    pub async fn stats(&self, config: &EngineConfig) -> Result<FleetStats, ControlError> {
        let aggregate = self.coordinator.aggregate_stats().await?;
        let progress_pct = if config.target_goal > 0 {
            aggregate.found as f64 * 100.0 / config.target_goal as f64
        } else {
            0.0
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        let paused_until_ms = match self.coordinator.pause_state(now_ms).await? {
            PauseState::Paused { until_ms } => Some(until_ms),
            PauseState::Clear | PauseState::Expired { .. } => None,
        };

        let recent = self
            .coordinator
            .recent(config.recent_profiles_limit)
            .await?
            .into_iter()
            .filter_map(|raw| match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::debug!("Skipping unreadable recent entry: {}", e);
                    None
                }
            })
            .collect();

        Ok(FleetStats {
            found: aggregate.found,
            support: aggregate.support,
            banned: aggregate.banned,
            target_goal: config.target_goal,
            progress_pct,
            cursor: self.coordinator.cursor().await?,
            retry_queue: self.coordinator.retry_len().await?,
            consecutive_not_found: self.coordinator.consecutive_not_found().await?,
            last_not_found_id: self.coordinator.last_not_found().await?,
            paused_until_ms,
            integrity_completed: self.coordinator.integrity_completed().await?,
            integrity_running: self.coordinator.lock_held(LockKind::Integrity).await?,
            live_workers: self.coordinator.live_workers().await?,
            recent,
        })
    }
}

fn validate_worker_id(worker_id: &str) -> Result<(), ControlError> {
    let valid = !worker_id.is_empty()
        && worker_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ControlError::InvalidWorkerId(worker_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{AggregateStats, MemoryStore};
    use std::sync::Arc;

    fn surface() -> (ControlSurface, Coordinator) {
        let coordinator = Coordinator::new(Arc::new(MemoryStore::new()));
        let surface =
            ControlSurface::new(coordinator.clone()).with_stop_grace(Duration::from_millis(20));
        (surface, coordinator)
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (surface, _) = surface();
        let status = surface.start("w1").await.unwrap();
        assert!(status.is_running);
        assert!(matches!(
            surface.start("w1").await,
            Err(ControlError::AlreadyRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_worker_id() {
        let (surface, _) = surface();
        assert!(matches!(
            surface.start("").await,
            Err(ControlError::InvalidWorkerId(_))
        ));
        assert!(matches!(
            surface.start("a b").await,
            Err(ControlError::InvalidWorkerId(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_signals_then_force_removes() {
        let (surface, coordinator) = surface();
        surface.start("w1").await.unwrap();

        let forced = surface.stop("w1").await.unwrap();
        assert_eq!(
            coordinator.run_status("w1").await.unwrap(),
            Some(RunStatus::StopRequested)
        );
        assert!(surface.status("w1").await.unwrap().is_running);

        forced.await.unwrap();
        assert!(!surface.status("w1").await.unwrap().is_running);
    }

    #[tokio::test]
    async fn test_handle_request_from_json() {
        let (surface, _) = surface();
        let request: ControlRequest =
            serde_json::from_str(r#"{"action": "start", "workerId": "w7"}"#).unwrap();
        let status = surface.handle(request).await.unwrap();
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            serde_json::json!({"isRunning": true, "workerId": "w7"})
        );
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let (surface, coordinator) = surface();
        coordinator
            .record_stats(AggregateStats {
                found: 50,
                support: 1,
                banned: 2,
            })
            .await
            .unwrap();
        coordinator.advance_cursor(120).await.unwrap();
        coordinator.push_retry(&[4, 9]).await.unwrap();
        coordinator.set_last_not_found(119).await.unwrap();
        coordinator
            .push_recent(&[r#"{"id": 3}"#.to_string(), "garbage".to_string()], 10)
            .await
            .unwrap();
        surface.start("w1").await.unwrap();

        let config = EngineConfig {
            target_goal: 200,
            ..EngineConfig::default()
        };
        let stats = surface.stats(&config).await.unwrap();
        assert_eq!(stats.found, 50);
        assert_eq!(stats.progress_pct, 25.0);
        assert_eq!(stats.cursor, 120);
        assert_eq!(stats.retry_queue, 2);
        assert_eq!(stats.last_not_found_id, Some(119));
        assert_eq!(stats.paused_until_ms, None);
        assert!(!stats.integrity_completed);
        assert_eq!(stats.live_workers, vec!["w1"]);
        assert_eq!(stats.recent, vec![serde_json::json!({"id": 3})]);
    }
}
