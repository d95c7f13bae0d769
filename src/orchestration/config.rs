//! Runtime options and config-source selection.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cli::GlobalArgs;
use crate::coordination::Coordinator;
use crate::settings::{ConfigSource, FileConfigSource, StoreConfigSource};

/// Everything needed to wire a process, independent of how it was parsed.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub store_url: String,
    pub data_dir: PathBuf,
    pub base_url: String,
    pub timeout_secs: u64,
    pub user_agent: String,
    pub config_file: Option<PathBuf>,
}

impl From<&GlobalArgs> for RuntimeOptions {
    fn from(args: &GlobalArgs) -> Self {
        Self {
            store_url: args.store_url.clone(),
            data_dir: args.data_dir.clone(),
            base_url: args.base_url.clone(),
            timeout_secs: args.timeout,
            user_agent: args.user_agent.clone(),
            config_file: args.config_file.clone(),
        }
    }
}

/// A local file wins over the fleet-wide blob.
pub fn build_config_source(
    config_file: Option<&PathBuf>,
    coordinator: &Coordinator,
) -> Arc<dyn ConfigSource> {
    match config_file {
        Some(path) => {
            tracing::info!("Reading tunables from {}", path.display());
            Arc::new(FileConfigSource::new(path))
        }
        None => Arc::new(StoreConfigSource::new(coordinator.clone())),
    }
}

/// `base` for a single worker, `base-1..=base-n` for replicas.
pub fn replica_ids(base: &str, replicas: usize) -> Vec<String> {
    if replicas <= 1 {
        return vec![base.to_string()];
    }
    (1..=replicas).map(|n| format!("{}-{}", base, n)).collect()
}
