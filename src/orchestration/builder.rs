//! Wires the process-wide worker dependencies.

use std::sync::Arc;
use thiserror::Error;

use crate::classifier::ProfileClassifier;
use crate::coordination::{self, CoordError, Coordinator};
use crate::network::{FetchError, HttpClient};
use crate::state::{RedbRecordStore, StateError};
use crate::worker::WorkerDeps;

use super::config::{build_config_source, RuntimeOptions};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Coordination store unavailable: {0}")]
    Coordination(#[from] CoordError),

    #[error("Record store failed to open: {0}")]
    State(#[from] StateError),

    #[error("HTTP client setup failed: {0}")]
    Http(#[from] FetchError),

    #[error("Invalid base URL: {0}")]
    BaseUrl(#[from] url::ParseError),

    #[error("Record store is owned by {holder}; run extra workers there with --replicas")]
    RecordStoreOwned { holder: String },
}

pub async fn connect_coordinator(store_url: &str) -> Result<Coordinator, BuildError> {
    let store = coordination::connect(store_url).await?;
    Ok(Coordinator::new(store))
}

/// Builds everything a worker needs: store client, record store, classifier, config source.
#[tracing::instrument(skip(options), fields(store = %options.store_url))]
pub async fn build_worker_deps(options: &RuntimeOptions) -> Result<WorkerDeps, BuildError> {
    let coordinator = connect_coordinator(&options.store_url).await?;
    let records = Arc::new(RedbRecordStore::new(&options.data_dir)?);

    let http = HttpClient::new(options.user_agent.clone(), options.timeout_secs)?;
    let classifier = Arc::new(ProfileClassifier::new(http, &options.base_url)?);
    let config_source = build_config_source(options.config_file.as_ref(), &coordinator);

    tracing::info!(
        data_dir = %options.data_dir.display(),
        base_url = %options.base_url,
        "Runtime ready"
    );

    Ok(WorkerDeps {
        coordinator,
        records,
        classifier,
        config_source,
        base_url: options.base_url.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> RuntimeOptions {
        RuntimeOptions {
            store_url: "memory://".to_string(),
            data_dir: dir.path().to_path_buf(),
            base_url: "https://example.test/users/".to_string(),
            timeout_secs: 5,
            user_agent: "TestBot/1.0".to_string(),
            config_file: None,
        }
    }

    #[tokio::test]
    async fn test_builds_in_memory_runtime() {
        let dir = TempDir::new().unwrap();
        let deps = build_worker_deps(&options(&dir)).await.unwrap();
        assert_eq!(deps.coordinator.cursor().await.unwrap(), 0);
        assert!(dir.path().join("profiles.redb").exists());
    }

    #[tokio::test]
    async fn test_rejects_relative_base_url() {
        let dir = TempDir::new().unwrap();
        let mut opts = options(&dir);
        opts.base_url = "users/".to_string();
        assert!(matches!(
            build_worker_deps(&opts).await,
            Err(BuildError::BaseUrl(_))
        ));
    }
}
