//! Process wiring: runtime options, dependency building, store ownership, signal handling.

pub mod builder;
pub mod config;
pub mod lease;
pub mod shutdown;

pub use builder::{build_worker_deps, connect_coordinator, BuildError};
pub use config::{build_config_source, replica_ids, RuntimeOptions};
pub use lease::{claim_record_store, RecordStoreLease};
pub use shutdown::setup_shutdown_handler;
