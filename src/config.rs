// Global configuration constants - single source of truth

pub struct Config;

impl Config {
    // Coordination locks
    pub const ALLOCATION_LOCK_TTL_SECS: u64 = 10;
    pub const INTEGRITY_LOCK_TTL_SECS: u64 = 300; // 5 minutes, refreshed per scanned range
    pub const RECORD_STORE_LEASE_TTL_SECS: u64 = 60; // renewed every third of the TTL
    pub const LOCK_RETRY_BASE_MS: u64 = 100;
    pub const LOCK_RETRY_MAX_MS: u64 = 1_000;

    // Worker liveness
    pub const RUN_STATUS_TTL_SECS: u64 = 180;
    pub const STOP_GRACE_SECS: u64 = 5;

    // HTTP/Network config
    pub const REQUEST_TIMEOUT_SECS: u64 = 30;
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;
    pub const MAX_CONTENT_SIZE: usize = 2 * 1024 * 1024; // 2MB, profile pages are small
    pub const POOL_IDLE_PER_HOST: usize = 16;
    pub const POOL_IDLE_TIMEOUT_SECS: u64 = 30;
    pub const DEFAULT_USER_AGENT: &'static str =
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/58.0.3029.110 Safari/537.3";
    pub const DEFAULT_BASE_URL: &'static str = "https://funpay.com/users/";

    // Progress reporting
    pub const PROGRESS_INTERVAL_BATCHES: u64 = 10;
}
