//! Graceful shutdown handler.

use crate::coordination::Coordinator;
use crate::models::RunStatus;

/// First Ctrl+C asks every local worker to stop. Second Ctrl+C exits immediately.
pub fn setup_shutdown_handler(
    coordinator: Coordinator,
    worker_ids: Vec<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::info!("Received Ctrl+C, stopping workers after their current sub-batch");
        tracing::info!("Press Ctrl+C again to force quit");

        for worker_id in &worker_ids {
            if let Err(e) = coordinator
                .set_run_status(worker_id, RunStatus::StopRequested)
                .await
            {
                tracing::error!(worker = %worker_id, "Failed to signal stop: {}", e);
            }
        }

        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Force quit requested, exiting immediately");
            std::process::exit(1);
        }
    })
}
