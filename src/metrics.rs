use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::models::ScrapeOutcome;

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// EWMA with configurable alpha (0=smooth, 1=responsive).
#[derive(Debug, Clone)]
pub struct Ewma {
    value: Option<f64>,
    alpha: f64,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self {
            value: None,
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    pub fn update(&mut self, sample: f64) {
        self.value = Some(match self.value {
            None => sample,
            Some(current) => self.alpha * sample + (1.0 - self.alpha) * current,
        });
    }

    pub fn get(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

/// Counters for one worker, logged with progress and returned in its summary.
#[derive(Debug)]
pub struct WorkerMetrics {
    pub processed: Counter,
    pub found: Counter,
    pub not_found: Counter,
    pub rate_limited: Counter,
    pub errors: Counter,
    pub requeued: Counter,
    pub flushes: Counter,
    pub batches: Counter,
    sub_batch_latency_ms: Mutex<Ewma>,
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            processed: Counter::new(),
            found: Counter::new(),
            not_found: Counter::new(),
            rate_limited: Counter::new(),
            errors: Counter::new(),
            requeued: Counter::new(),
            flushes: Counter::new(),
            batches: Counter::new(),
            sub_batch_latency_ms: Mutex::new(Ewma::new(0.3)),
        }
    }

    pub fn record_outcome(&self, outcome: &ScrapeOutcome) {
        self.processed.inc();
        match outcome {
            ScrapeOutcome::Found(_) => self.found.inc(),
            ScrapeOutcome::NotFound => self.not_found.inc(),
            ScrapeOutcome::RateLimited => self.rate_limited.inc(),
            ScrapeOutcome::ServerError { .. }
            | ScrapeOutcome::Timeout
            | ScrapeOutcome::Fatal { .. } => self.errors.inc(),
        }
    }

    pub fn record_sub_batch(&self, elapsed: Duration) {
        self.sub_batch_latency_ms
            .lock()
            .update(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn sub_batch_latency_ms(&self) -> f64 {
        self.sub_batch_latency_ms.lock().get()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed.get(),
            found: self.found.get(),
            not_found: self.not_found.get(),
            rate_limited: self.rate_limited.get(),
            errors: self.errors.get(),
            requeued: self.requeued.get(),
            flushes: self.flushes.get(),
            batches: self.batches.get(),
            sub_batch_latency_ms: self.sub_batch_latency_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub found: u64,
    pub not_found: u64,
    pub rate_limited: u64,
    pub errors: u64,
    pub requeued: u64,
    pub flushes: u64,
    pub batches: u64,
    pub sub_batch_latency_ms: f64,
}
