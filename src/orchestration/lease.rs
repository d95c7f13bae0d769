//! Fleet-wide ownership of the record store.
//!
//! The record store is a local redb file, so exactly one process may run workers for a
//! fleet. Replicas of that process share the file; a second `start` anywhere else against
//! the same coordination store is refused instead of writing to a store nobody else reads.

use rand::Rng;
use std::path::Path;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::coordination::{Coordinator, LockKind};

use super::builder::BuildError;

pub struct RecordStoreLease {
    coordinator: Coordinator,
    owner: String,
    renewer: JoinHandle<()>,
}

impl RecordStoreLease {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Stop renewing and drop the lease if we still hold it.
    pub async fn release(self) {
        self.renewer.abort();
        match self
            .coordinator
            .unlock(LockKind::RecordStore, &self.owner)
            .await
        {
            Ok(true) => tracing::debug!("Released record store lease"),
            Ok(false) => tracing::warn!("Record store lease was already gone"),
            Err(e) => tracing::warn!("Could not release record store lease: {}", e),
        }
    }
}

pub async fn claim_record_store(
    coordinator: &Coordinator,
    data_dir: &Path,
) -> Result<RecordStoreLease, BuildError> {
    claim_with_ttl(
        coordinator,
        data_dir,
        Duration::from_secs(Config::RECORD_STORE_LEASE_TTL_SECS),
    )
    .await
}

async fn claim_with_ttl(
    coordinator: &Coordinator,
    data_dir: &Path,
    ttl: Duration,
) -> Result<RecordStoreLease, BuildError> {
    let owner = format!(
        "pid{}-{:08x}:{}",
        std::process::id(),
        rand::thread_rng().gen::<u32>(),
        data_dir.display()
    );

    if !coordinator
        .try_lock(LockKind::RecordStore, &owner, ttl)
        .await?
    {
        let holder = coordinator
            .lock_owner(LockKind::RecordStore)
            .await?
            .unwrap_or_else(|| "unknown".to_string());
        return Err(BuildError::RecordStoreOwned { holder });
    }
    tracing::info!(%owner, "Claimed record store lease");

    let renewer = tokio::spawn(renew(coordinator.clone(), owner.clone(), ttl));
    Ok(RecordStoreLease {
        coordinator: coordinator.clone(),
        owner,
        renewer,
    })
}

async fn renew(coordinator: Coordinator, owner: String, ttl: Duration) {
    let period = (ttl / 3).max(Duration::from_millis(10));
    loop {
        tokio::time::sleep(period).await;
        match coordinator.lock_owner(LockKind::RecordStore).await {
            Ok(Some(holder)) if holder == owner => {
                if let Err(e) = coordinator.refresh_lock(LockKind::RecordStore, ttl).await {
                    tracing::warn!("Record store lease renewal failed: {}", e);
                }
            }
            Ok(Some(holder)) => {
                tracing::error!(%holder, "Record store lease taken by another process");
                return;
            }
            Ok(None) => {
                // Expired while the store was unreachable; take it back if nobody else did.
                match coordinator.try_lock(LockKind::RecordStore, &owner, ttl).await {
                    Ok(true) => tracing::warn!("Record store lease lapsed and was reclaimed"),
                    Ok(false) => {}
                    Err(e) => tracing::warn!("Record store lease renewal failed: {}", e),
                }
            }
            Err(e) => tracing::warn!("Record store lease renewal failed: {}", e),
        }
    }
}
