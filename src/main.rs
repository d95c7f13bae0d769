use fleet_scraper::cli::{Cli, Commands, GlobalArgs};
use fleet_scraper::control::{ControlError, ControlSurface};
use fleet_scraper::coordination::CoordError;
use fleet_scraper::logging::{init_logging, LoggingError};
use fleet_scraper::orchestration::{
    build_config_source, build_worker_deps, claim_record_store, connect_coordinator,
    replica_ids, setup_shutdown_handler, BuildError, RuntimeOptions,
};
use fleet_scraper::worker::WorkerDeps;
use fleet_scraper::settings::{ConfigError, EngineConfig};
use fleet_scraper::state::{RecordStore, RedbRecordStore, StateError};
use fleet_scraper::worker::Worker;
use futures_util::future::join_all;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MainError {
    #[error("Logging setup failed: {0}")]
    Logging(#[from] LoggingError),

    #[error("{0}")]
    Build(#[from] BuildError),

    #[error("{0}")]
    Control(#[from] ControlError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Record store error: {0}")]
    State(#[from] StateError),

    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{failed} of {total} workers failed")]
    Workers { failed: usize, total: usize },
}

async fn run_start_command(
    global: &GlobalArgs,
    worker_id: String,
    replicas: usize,
) -> Result<(), MainError> {
    let options = RuntimeOptions::from(global);
    let deps = build_worker_deps(&options).await?;
    let lease = claim_record_store(&deps.coordinator, &options.data_dir).await?;
    println!("Record store lease held as {}", lease.owner());

    let result = run_workers(&options, deps, worker_id, replicas).await;
    lease.release().await;
    result
}

async fn run_workers(
    options: &RuntimeOptions,
    deps: WorkerDeps,
    worker_id: String,
    replicas: usize,
) -> Result<(), MainError> {
    let control = ControlSurface::new(deps.coordinator.clone());

    let ids = replica_ids(&worker_id, replicas);
    for id in &ids {
        control.start(id).await?;
    }
    println!(
        "Starting {} worker(s) against {} (store: {})",
        ids.len(),
        options.base_url,
        options.store_url
    );

    let _signals = setup_shutdown_handler(deps.coordinator.clone(), ids.clone());

    let handles: Vec<_> = ids
        .iter()
        .map(|id| tokio::spawn(Worker::new(id.clone(), deps.clone()).run()))
        .collect();

    let total = handles.len();
    let mut failed = 0;
    for (id, joined) in ids.iter().zip(join_all(handles).await) {
        match joined {
            Ok(Ok(summary)) => println!(
                "{}: processed {}, found {}, not found {}, requeued {} (final limit {}, delay {}ms)",
                summary.worker_id,
                summary.metrics.processed,
                summary.metrics.found,
                summary.metrics.not_found,
                summary.metrics.requeued,
                summary.final_limit,
                summary.final_delay_ms
            ),
            Ok(Err(e)) => {
                eprintln!("{}: {}", id, e);
                failed += 1;
            }
            Err(e) => {
                eprintln!("{}: worker task panicked: {}", id, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(MainError::Workers { failed, total });
    }
    Ok(())
}

async fn run_stop_command(global: &GlobalArgs, worker_id: &str) -> Result<(), MainError> {
    let coordinator = connect_coordinator(&global.store_url).await?;
    let control = ControlSurface::new(coordinator);
    let forced_removal = control.stop(worker_id).await?;
    println!("Stop command sent to worker {}", worker_id);

    if forced_removal.await.is_err() {
        eprintln!("Forced run-status removal did not complete");
    }
    Ok(())
}

async fn run_status_command(global: &GlobalArgs, worker_id: &str) -> Result<(), MainError> {
    let coordinator = connect_coordinator(&global.store_url).await?;
    let status = ControlSurface::new(coordinator).status(worker_id).await?;
    println!("{}", serde_json::to_string(&status)?);
    Ok(())
}

async fn run_stats_command(global: &GlobalArgs) -> Result<(), MainError> {
    let coordinator = connect_coordinator(&global.store_url).await?;
    let config = build_config_source(global.config_file.as_ref(), &coordinator)
        .load()
        .await?;
    let stats = ControlSurface::new(coordinator).stats(&config).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn run_lookup_command(data_dir: &Path, query: &str) -> Result<(), MainError> {
    let records = RedbRecordStore::new(data_dir)?;

    if let Ok(id) = query.parse::<u64>() {
        match records.get(id)? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => println!("No record for ID {}", id),
        }
        return Ok(());
    }

    let matches = records.find_by_nickname(query)?;
    if matches.is_empty() {
        println!("No profile with nickname {:?}", query);
    }
    for record in matches {
        println!("{}", serde_json::to_string_pretty(&record)?);
    }
    Ok(())
}

async fn run_push_config_command(global: &GlobalArgs, path: &Path) -> Result<(), MainError> {
    let raw = std::fs::read_to_string(path)?;
    let config = EngineConfig::from_json(&raw)?;

    let coordinator = connect_coordinator(&global.store_url).await?;
    coordinator
        .set_config_blob(&serde_json::to_string(&config)?)
        .await?;
    println!("Published configuration from {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), MainError> {
    let cli = Cli::parse_args();
    let _log_guards = init_logging(cli.global.log_dir.as_deref())?;

    match cli.command {
        Commands::Start {
            worker_id,
            replicas,
        } => run_start_command(&cli.global, worker_id, replicas).await,
        Commands::Stop { worker_id } => run_stop_command(&cli.global, &worker_id).await,
        Commands::Status { worker_id } => run_status_command(&cli.global, &worker_id).await,
        Commands::Stats => run_stats_command(&cli.global).await,
        Commands::Lookup { query } => run_lookup_command(&cli.global.data_dir, &query),
        Commands::PushConfig { path } => run_push_config_command(&cli.global, &path).await,
    }
}
