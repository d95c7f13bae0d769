pub mod allocator;
pub mod backoff;
pub mod breaker;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod control;
pub mod controller;
pub mod coordination;
pub mod integrity;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod network;
pub mod orchestration;
pub mod parser;
pub mod persister;
pub mod settings;
pub mod state;
pub mod worker;

// Re-export main types for library usage
pub use classifier::{Classifier, ProfileClassifier};
pub use control::{ControlAction, ControlRequest, ControlSurface, FleetStats, WorkerStatus};
pub use coordination::{CoordError, CoordinationStore, Coordinator, MemoryStore, RedisStore};
pub use models::{PersistedRecord, Profile, RunStatus, ScrapeOutcome, WorkItem};
pub use settings::{ConfigSource, EngineConfig};
pub use state::{RecordStore, RedbRecordStore};
pub use worker::{Worker, WorkerDeps, WorkerError, WorkerSummary};
