use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::allocator::Allocator;
use crate::breaker::{should_requeue, CircuitBreaker, NotFoundVerdict, PauseCheck};
use crate::classifier::Classifier;
use crate::config::Config;
use crate::controller::{Adjustment, ConcurrencyController};
use crate::coordination::{CoordError, Coordinator, LockKind};
use crate::integrity::{IntegrityOutcome, IntegrityVerifier};
use crate::metrics::{MetricsSnapshot, WorkerMetrics};
use crate::models::{PersistedRecord, RunStatus, ScrapeOutcome, WorkItem};
use crate::persister::{BatchPersister, FlushOutcome};
use crate::settings::{ConfigError, ConfigSource, EngineConfig};
use crate::state::RecordStore;

/// Conditions that end a worker. Per-item failures never get here.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Coordination store failure: {0}")]
    Coordination(#[from] CoordError),

    #[error("Configuration failure: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Initializing,
    IntegrityCheck,
    MainLoop,
    Stopping,
    Terminated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub metrics: MetricsSnapshot,
    pub final_limit: usize,
    pub final_delay_ms: u64,
}

/// Shared handles every worker of a process is built from.
#[derive(Clone)]
pub struct WorkerDeps {
    pub coordinator: Coordinator,
    pub records: Arc<dyn RecordStore>,
    pub classifier: Arc<dyn Classifier>,
    pub config_source: Arc<dyn ConfigSource>,
    pub base_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchEnd {
    Completed,
    /// The circuit breaker cut the batch short.
    Abandoned,
    Stopped,
}

/// One worker: allocate, classify, feed the breaker, controller and persister, repeat
/// until its run-status key says otherwise.
pub struct Worker {
    id: String,
    coordinator: Coordinator,
    classifier: Arc<dyn Classifier>,
    config_source: Arc<dyn ConfigSource>,
    allocator: Allocator,
    breaker: CircuitBreaker,
    verifier: IntegrityVerifier,
    persister: BatchPersister,
    metrics: WorkerMetrics,
    phase: WorkerPhase,
}

impl Worker {
    pub fn new(id: impl Into<String>, deps: WorkerDeps) -> Self {
        let id = id.into();
        Self {
            allocator: Allocator::new(deps.coordinator.clone(), id.clone()),
            breaker: CircuitBreaker::new(deps.coordinator.clone(), id.clone()),
            verifier: IntegrityVerifier::new(
                deps.coordinator.clone(),
                deps.records.clone(),
                id.clone(),
            ),
            persister: BatchPersister::new(
                deps.records,
                deps.coordinator.clone(),
                id.clone(),
                deps.base_url,
            ),
            coordinator: deps.coordinator,
            classifier: deps.classifier,
            config_source: deps.config_source,
            metrics: WorkerMetrics::new(),
            phase: WorkerPhase::Initializing,
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until the run-status key says `stopping` or disappears.
    #[tracing::instrument(skip(self), fields(worker = %self.id))]
    pub async fn run(mut self) -> Result<WorkerSummary, WorkerError> {
        tracing::info!("Worker started");
        let mut controller = match self.config_source.load().await {
            Ok(config) => ConcurrencyController::new(&config),
            Err(e) => {
                self.abort_cleanup().await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.register().await {
            self.abort_cleanup().await;
            return Err(e.into());
        }

        match self.main_loop(&mut controller).await {
            Ok(()) => {
                self.shutdown().await?;
                let summary = self.summary(&controller);
                tracing::info!(
                    processed = summary.metrics.processed,
                    found = summary.metrics.found,
                    "Worker stopped"
                );
                Ok(summary)
            }
            Err(e) => {
                tracing::error!(phase = ?self.phase, "Worker failed: {}", e);
                self.abort_cleanup().await;
                Err(e)
            }
        }
    }

    /// Mark ourselves running, unless a stop already arrived before we got here.
    async fn register(&self) -> Result<(), CoordError> {
        match self.coordinator.run_status(&self.id).await? {
            Some(RunStatus::StopRequested) => {
                tracing::info!("Stop requested before start");
            }
            Some(RunStatus::Running) | None => {
                self.coordinator
                    .set_run_status(&self.id, RunStatus::Running)
                    .await?;
            }
        }
        Ok(())
    }

    async fn main_loop(&mut self, controller: &mut ConcurrencyController) -> Result<(), WorkerError> {
        self.phase = WorkerPhase::MainLoop;
        loop {
            let config = self.config_source.load().await?;
            controller.apply_config(&config);

            if !self.still_running().await? {
                tracing::info!("Stop requested");
                return Ok(());
            }
            self.coordinator.refresh_run_status(&self.id).await?;

            if self.coordinator.lock_held(LockKind::Integrity).await? {
                tracing::debug!("Integrity check in progress elsewhere, waiting");
                tokio::time::sleep(config.integrity_poll()).await;
                continue;
            }

            if !self.coordinator.integrity_completed().await? {
                self.phase = WorkerPhase::IntegrityCheck;
                let outcome = self.verifier.run(&config).await?;
                self.phase = WorkerPhase::MainLoop;
                match outcome {
                    IntegrityOutcome::HeldByOther | IntegrityOutcome::Failed => {
                        tokio::time::sleep(config.integrity_poll()).await;
                        continue;
                    }
                    IntegrityOutcome::AlreadyCompleted | IntegrityOutcome::Completed { .. } => {}
                }
            }

            match self.breaker.check_pause().await? {
                PauseCheck::Paused { remaining } => {
                    tracing::debug!(?remaining, "Fleet paused");
                    tokio::time::sleep(remaining.min(config.pause_poll())).await;
                    continue;
                }
                PauseCheck::Resumed | PauseCheck::Clear => {}
            }

            let batch = self.allocator.allocate_batch(config.batch_size).await?;
            if batch.is_empty() {
                tokio::time::sleep(config.idle_poll()).await;
                continue;
            }

            let end = self.process_batch(&batch, &config, controller).await?;
            self.metrics.batches.inc();
            if self.metrics.batches.get() % Config::PROGRESS_INTERVAL_BATCHES == 0 {
                self.log_progress(&config, controller).await?;
            }
            if end == BatchEnd::Stopped {
                tracing::info!("Stop requested mid-batch");
                return Ok(());
            }
        }
    }

    async fn still_running(&self) -> Result<bool, CoordError> {
        Ok(matches!(
            self.coordinator.run_status(&self.id).await?,
            Some(RunStatus::Running)
        ))
    }

    async fn process_batch(
        &mut self,
        batch: &[WorkItem],
        config: &EngineConfig,
        controller: &mut ConcurrencyController,
    ) -> Result<BatchEnd, WorkerError> {
        let mut had_error = false;
        let mut next = 0usize;

        while next < batch.len() {
            if !self.still_running().await? {
                let rest: Vec<u64> = batch[next..].iter().map(|item| item.id).collect();
                self.requeue(&rest).await?;
                tracing::info!(returned = rest.len(), "Returned unprocessed IDs to the retry queue");
                self.flush(config).await?;
                return Ok(BatchEnd::Stopped);
            }
            // A throttled batch can outlast the key's TTL.
            self.coordinator.refresh_run_status(&self.id).await?;

            let end = (next + controller.limit().max(1)).min(batch.len());
            let sub_batch = &batch[next..end];
            tokio::time::sleep(controller.delay()).await;

            tracing::debug!(
                processed = end,
                total = batch.len(),
                limit = controller.limit(),
                delay_ms = controller.delay_ms(),
                stable = controller.is_stable(),
                "Processing sub-batch"
            );

            let started = Instant::now();
            let classifier = &self.classifier;
            let outcomes =
                join_all(sub_batch.iter().map(|item| classifier.classify(item.id))).await;
            self.metrics.record_sub_batch(started.elapsed());

            let mut retry = Vec::new();
            for (offset, (item, outcome)) in sub_batch.iter().zip(outcomes).enumerate() {
                self.metrics.record_outcome(&outcome);
                controller.record(&outcome);
                had_error |= outcome.is_error();

                match outcome {
                    ScrapeOutcome::Found(profile) => {
                        self.breaker.on_found().await?;
                        self.persister
                            .accumulate(PersistedRecord::found(profile, &self.id));
                    }
                    ScrapeOutcome::NotFound => {
                        let verdict = self.breaker.on_not_found(item.id, config).await?;
                        let rewind_to = match verdict {
                            NotFoundVerdict::Record => {
                                self.persister
                                    .accumulate(PersistedRecord::tombstone(item.id, &self.id));
                                continue;
                            }
                            NotFoundVerdict::Tripped { rewind_to } => rewind_to,
                            NotFoundVerdict::Halted => None,
                        };

                        let abandoned = &batch[next + offset..];
                        retry.extend(
                            abandoned
                                .iter()
                                .filter(|item| should_requeue(item, rewind_to))
                                .map(|item| item.id),
                        );
                        tracing::info!(
                            abandoned = abandoned.len(),
                            requeued = retry.len(),
                            "Abandoning batch after not-found run"
                        );
                        self.requeue(&retry).await?;
                        self.flush(config).await?;
                        controller.end_batch(true);
                        return Ok(BatchEnd::Abandoned);
                    }
                    transient => {
                        tracing::debug!(id = item.id, "Requeueing after {}", transient);
                        retry.push(item.id);
                    }
                }
            }

            self.requeue(&retry).await?;
            if self.persister.len() >= config.write_batch_size {
                self.flush(config).await?;
            }
            next = end;
        }

        self.flush(config).await?;
        match controller.end_batch(had_error) {
            Adjustment::Grew => tracing::info!(
                limit = controller.limit(),
                delay_ms = controller.delay_ms(),
                "Raised concurrency"
            ),
            Adjustment::Promoted { success_rate_pct } => tracing::info!(
                success_rate_pct,
                "Stable at {} requests / {}ms",
                controller.limit(),
                controller.delay_ms()
            ),
            Adjustment::None => {}
        }
        Ok(BatchEnd::Completed)
    }

    async fn requeue(&self, ids: &[u64]) -> Result<(), CoordError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.coordinator.push_retry(ids).await?;
        self.metrics.requeued.add(ids.len() as u64);
        Ok(())
    }

    async fn flush(&mut self, config: &EngineConfig) -> Result<FlushOutcome, CoordError> {
        let outcome = self.persister.flush(config.recent_profiles_limit).await?;
        if matches!(outcome, FlushOutcome::Written { .. }) {
            self.metrics.flushes.inc();
        }
        Ok(outcome)
    }

    async fn log_progress(
        &self,
        config: &EngineConfig,
        controller: &ConcurrencyController,
    ) -> Result<(), CoordError> {
        let fleet = self.coordinator.aggregate_stats().await?;
        let progress_pct = if config.target_goal > 0 {
            fleet.found as f64 * 100.0 / config.target_goal as f64
        } else {
            0.0
        };
        let local = self.metrics.snapshot();
        tracing::info!(
            processed = local.processed,
            found = local.found,
            not_found = local.not_found,
            rate_limited = local.rate_limited,
            requeued = local.requeued,
            latency_ms = local.sub_batch_latency_ms.round() as u64,
            limit = controller.limit(),
            delay_ms = controller.delay_ms(),
            "Progress: {} profiles fleet-wide ({:.2}% of target)",
            fleet.found,
            progress_pct
        );
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), WorkerError> {
        self.phase = WorkerPhase::Stopping;
        let config = match self.config_source.load().await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Shutdown is using default configuration: {}", e);
                EngineConfig::default()
            }
        };

        if !self.persister.is_empty() {
            tracing::info!(buffered = self.persister.len(), "Saving final buffer");
        }
        if let FlushOutcome::Retained { buffered } = self.flush(&config).await? {
            tracing::error!(buffered, "Final flush failed, buffered records were not saved");
        }

        self.coordinator.remove_run_status(&self.id).await?;
        if self.coordinator.live_workers().await?.is_empty() {
            self.coordinator.clear_integrity_completed().await?;
            tracing::info!("Last worker out, integrity check will run on next start");
        }
        self.phase = WorkerPhase::Terminated;
        Ok(())
    }

    /// Best effort after a fatal error: save what we can and drop our run-status key.
    async fn abort_cleanup(&mut self) {
        self.phase = WorkerPhase::Stopping;
        if let Err(e) = self.persister.flush(EngineConfig::default().recent_profiles_limit).await {
            tracing::warn!("Final flush failed during cleanup: {}", e);
        }
        if let Err(e) = self.coordinator.remove_run_status(&self.id).await {
            tracing::warn!("Could not remove run-status key: {}", e);
        }
        self.phase = WorkerPhase::Terminated;
    }

    fn summary(&self, controller: &ConcurrencyController) -> WorkerSummary {
        WorkerSummary {
            worker_id: self.id.clone(),
            metrics: self.metrics.snapshot(),
            final_limit: controller.limit(),
            final_delay_ms: controller.delay_ms(),
        }
    }
}
