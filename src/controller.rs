use std::collections::VecDeque;
use std::time::Duration;

use crate::models::ScrapeOutcome;
use crate::settings::EngineConfig;

/// What the controller did at the end of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    None,
    /// Window success rate reached the threshold; growth stops.
    Promoted { success_rate_pct: u32 },
    Grew,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Bounds {
    concurrency_min: usize,
    concurrency_max: usize,
    delay_min_ms: u64,
    delay_max_ms: u64,
    delay_step_ms: u64,
    delay_compensation_ms: u64,
    streak_to_increase: u32,
    window: usize,
    threshold_pct: f64,
}

impl From<&EngineConfig> for Bounds {
    fn from(config: &EngineConfig) -> Self {
        Self {
            concurrency_min: config.concurrency_min,
            concurrency_max: config.concurrency_max,
            delay_min_ms: config.delay_min_ms,
            delay_max_ms: config.delay_max_ms,
            delay_step_ms: config.delay_step_ms,
            delay_compensation_ms: config.delay_compensation_ms,
            streak_to_increase: config.success_streak_to_increase.max(1),
            window: config.analysis_window.max(1),
            threshold_pct: config.success_threshold,
        }
    }
}

/// Per-worker additive-increase / immediate-decrease loop over concurrency and delay.
///
/// Starts in ramp-up at the minimum limit and minimum delay. Clean batches slowly raise the
/// limit; any rate-limit response rolls it back at once and leaves stable mode.
#[derive(Debug, Clone)]
pub struct ConcurrencyController {
    bounds: Bounds,
    limit: usize,
    delay_ms: u64,
    success_streak: u32,
    stable: bool,
    window: VecDeque<bool>,
}

impl ConcurrencyController {
    pub fn new(config: &EngineConfig) -> Self {
        let bounds = Bounds::from(config);
        Self {
            bounds,
            limit: bounds.concurrency_min,
            delay_ms: bounds.delay_min_ms,
            success_streak: 0,
            stable: false,
            window: VecDeque::with_capacity(bounds.window),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    pub fn is_stable(&self) -> bool {
        self.stable
    }

    pub fn success_streak(&self) -> u32 {
        self.success_streak
    }

    /// Success rate over the window in percent, `None` while the window is empty.
    pub fn success_rate(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let successes = self.window.iter().filter(|ok| **ok).count();
        Some(successes as f64 * 100.0 / self.window.len() as f64)
    }

    /// Pick up retuned bounds from a freshly loaded configuration.
    pub fn apply_config(&mut self, config: &EngineConfig) {
        let bounds = Bounds::from(config);
        if bounds == self.bounds {
            return;
        }
        self.bounds = bounds;
        self.limit = self.limit.clamp(bounds.concurrency_min, bounds.concurrency_max);
        self.delay_ms = self.delay_ms.clamp(bounds.delay_min_ms, bounds.delay_max_ms);
        while self.window.len() > bounds.window {
            self.window.pop_front();
        }
        tracing::debug!(limit = self.limit, delay_ms = self.delay_ms, "Controller bounds updated");
    }

    /// Feed one outcome into the window. A rate-limit outcome rolls back immediately and
    /// the call returns true.
    pub fn record(&mut self, outcome: &ScrapeOutcome) -> bool {
        let rate_limited = matches!(outcome, ScrapeOutcome::RateLimited);
        self.window.push_back(!rate_limited);
        while self.window.len() > self.bounds.window {
            self.window.pop_front();
        }
        if rate_limited {
            self.rollback();
        }
        rate_limited
    }

    pub fn rollback(&mut self) {
        let (old_limit, old_delay) = (self.limit, self.delay_ms);
        self.limit = self
            .limit
            .saturating_sub(1)
            .max(self.bounds.concurrency_min);
        self.delay_ms = (self.delay_ms + self.bounds.delay_step_ms).min(self.bounds.delay_max_ms);
        self.success_streak = 0;
        self.stable = false;
        tracing::info!(
            limit = self.limit,
            delay_ms = self.delay_ms,
            "Rate limited, rolled back from limit {} / {}ms",
            old_limit,
            old_delay
        );
    }

    /// Close out a batch. `had_error` is true when any outcome in it was not `Found`.
    pub fn end_batch(&mut self, had_error: bool) -> Adjustment {
        if had_error {
            self.success_streak = 0;
            return Adjustment::None;
        }
        if self.stable {
            return Adjustment::None;
        }
        self.success_streak += 1;

        if self.window.len() >= self.bounds.window {
            if let Some(rate) = self.success_rate() {
                if rate >= self.bounds.threshold_pct {
                    self.stable = true;
                    tracing::info!(
                        limit = self.limit,
                        delay_ms = self.delay_ms,
                        "Entering stable mode at {:.1}% success",
                        rate
                    );
                    return Adjustment::Promoted {
                        success_rate_pct: rate.round() as u32,
                    };
                }
            }
        }

        if self.success_streak >= self.bounds.streak_to_increase {
            self.limit = (self.limit + 1).min(self.bounds.concurrency_max);
            self.delay_ms =
                (self.delay_ms + self.bounds.delay_compensation_ms).min(self.bounds.delay_max_ms);
            self.success_streak = 0;
            tracing::debug!(limit = self.limit, delay_ms = self.delay_ms, "Ramped up");
            return Adjustment::Grew;
        }
        Adjustment::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Profile;
    use chrono::Utc;

    fn found() -> ScrapeOutcome {
        ScrapeOutcome::Found(Profile {
            id: 1,
            nickname: "x".into(),
            registered_at: String::new(),
            rating: None,
            review_count: 0,
            lot_count: 0,
            is_banned: false,
            is_support: false,
            scraped_at: Utc::now(),
        })
    }

    fn config() -> EngineConfig {
        EngineConfig {
            concurrency_min: 1,
            concurrency_max: 4,
            delay_min_ms: 500,
            delay_max_ms: 700,
            delay_step_ms: 100,
            delay_compensation_ms: 10,
            success_streak_to_increase: 2,
            analysis_window: 5,
            success_threshold: 100.0,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_starts_at_minimum() {
        let controller = ConcurrencyController::new(&config());
        assert_eq!(controller.limit(), 1);
        assert_eq!(controller.delay_ms(), 500);
        assert!(!controller.is_stable());
        assert_eq!(controller.success_rate(), None);
    }

    #[test]
    fn test_growth_after_streak() {
        let mut controller = ConcurrencyController::new(&config());
        controller.record(&found());
        assert_eq!(controller.end_batch(false), Adjustment::None);
        controller.record(&found());
        assert_eq!(controller.end_batch(false), Adjustment::Grew);
        assert_eq!(controller.limit(), 2);
        assert_eq!(controller.delay_ms(), 510);
        assert_eq!(controller.success_streak(), 0);
    }

    #[test]
    fn test_error_batch_resets_streak() {
        let mut controller = ConcurrencyController::new(&config());
        controller.end_batch(false);
        assert_eq!(controller.success_streak(), 1);
        controller.record(&ScrapeOutcome::NotFound);
        assert_eq!(controller.end_batch(true), Adjustment::None);
        assert_eq!(controller.success_streak(), 0);
        assert_eq!(controller.limit(), 1);
    }

    #[test]
    fn test_rate_limit_rolls_back_immediately() {
        let mut controller = ConcurrencyController::new(&config());
        for _ in 0..6 {
            controller.end_batch(false);
        }
        assert_eq!(controller.limit(), 4);
        let delay_before = controller.delay_ms();

        assert!(controller.record(&ScrapeOutcome::RateLimited));
        assert_eq!(controller.limit(), 3);
        assert_eq!(controller.delay_ms(), (delay_before + 100).min(700));
        assert_eq!(controller.success_streak(), 0);
    }

    #[test]
    fn test_rollback_respects_bounds() {
        let mut controller = ConcurrencyController::new(&config());
        for _ in 0..5 {
            controller.record(&ScrapeOutcome::RateLimited);
        }
        assert_eq!(controller.limit(), 1);
        assert_eq!(controller.delay_ms(), 700);
    }

    #[test]
    fn test_not_found_counts_as_success_in_window() {
        let mut controller = ConcurrencyController::new(&config());
        assert!(!controller.record(&ScrapeOutcome::NotFound));
        assert!(!controller.record(&ScrapeOutcome::Timeout));
        assert_eq!(controller.success_rate(), Some(100.0));
        controller.record(&ScrapeOutcome::RateLimited);
        assert!((controller.success_rate().unwrap() - 66.666).abs() < 0.01);
    }

    #[test]
    fn test_promotion_needs_full_window() {
        let mut controller = ConcurrencyController::new(&EngineConfig {
            success_streak_to_increase: 100,
            ..config()
        });
        for _ in 0..4 {
            controller.record(&found());
        }
        assert_eq!(controller.end_batch(false), Adjustment::None);
        assert!(!controller.is_stable());

        controller.record(&found());
        assert_eq!(
            controller.end_batch(false),
            Adjustment::Promoted {
                success_rate_pct: 100
            }
        );
        assert!(controller.is_stable());

        // Stable mode freezes growth.
        let limit = controller.limit();
        for _ in 0..10 {
            controller.record(&found());
            controller.end_batch(false);
        }
        assert_eq!(controller.limit(), limit);
    }

    #[test]
    fn test_rollback_leaves_stable_mode() {
        let mut controller = ConcurrencyController::new(&EngineConfig {
            success_threshold: 0.0,
            ..config()
        });
        for _ in 0..5 {
            controller.record(&found());
        }
        controller.end_batch(false);
        assert!(controller.is_stable());

        controller.record(&ScrapeOutcome::RateLimited);
        assert!(!controller.is_stable());
    }

    #[test]
    fn test_window_is_bounded() {
        let mut controller = ConcurrencyController::new(&config());
        for _ in 0..3 {
            controller.record(&ScrapeOutcome::RateLimited);
        }
        for _ in 0..5 {
            controller.record(&found());
        }
        assert_eq!(controller.success_rate(), Some(100.0));
    }

    #[test]
    fn test_apply_config_reclamps() {
        let mut controller = ConcurrencyController::new(&config());
        for _ in 0..6 {
            controller.end_batch(false);
        }
        assert_eq!(controller.limit(), 4);

        controller.apply_config(&EngineConfig {
            concurrency_max: 2,
            delay_min_ms: 600,
            analysis_window: 2,
            ..config()
        });
        assert_eq!(controller.limit(), 2);
        assert_eq!(controller.delay_ms(), 600);
    }
}
