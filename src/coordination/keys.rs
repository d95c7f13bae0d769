//! Key names in the shared store. Every process of a fleet must agree on these.

pub const NEXT_ID: &str = "scraper:next_id";
pub const RETRY_QUEUE: &str = "scraper:retry_queue";
pub const ALLOCATION_LOCK: &str = "scraper:allocation_lock";

pub const CONSECUTIVE_NOT_FOUND: &str = "scraper:consecutive_not_found";
pub const NOT_FOUND_RUN_START: &str = "scraper:not_found_run_start";
pub const LAST_NOT_FOUND_ID: &str = "scraper:last_not_found_id";
pub const PAUSE_UNTIL: &str = "scraper:pause_until";

pub const INTEGRITY_LOCK: &str = "scraper:integrity_lock";
pub const INTEGRITY_COMPLETED: &str = "scraper:integrity_completed";

pub const RECORD_STORE_OWNER: &str = "scraper:record_store_owner";

pub const RUN_STATUS_PREFIX: &str = "scraper:status:";

pub const STATS_FOUND: &str = "scraper:stats:found";
pub const STATS_SUPPORT: &str = "scraper:stats:support";
pub const STATS_BANNED: &str = "scraper:stats:banned";
pub const RECENT_PROFILES: &str = "scraper:recent_profiles";

pub const ENGINE_CONFIG: &str = "scraper:engine_config";

/// Stale state a crashed fleet may leave behind; cleared by the integrity verifier.
pub const VOLATILE: &[&str] = &[
    CONSECUTIVE_NOT_FOUND,
    NOT_FOUND_RUN_START,
    LAST_NOT_FOUND_ID,
    PAUSE_UNTIL,
    ALLOCATION_LOCK,
];

pub fn run_status(worker_id: &str) -> String {
    format!("{}{}", RUN_STATUS_PREFIX, worker_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_key() {
        assert_eq!(run_status("worker-1"), "scraper:status:worker-1");
        assert!(run_status("a").starts_with(RUN_STATUS_PREFIX));
    }

    #[test]
    fn test_volatile_keys_exclude_durable_state() {
        assert!(!VOLATILE.contains(&NEXT_ID));
        assert!(!VOLATILE.contains(&RETRY_QUEUE));
        assert!(!VOLATILE.contains(&INTEGRITY_LOCK));
        assert!(!VOLATILE.contains(&RECORD_STORE_OWNER));
    }
}
