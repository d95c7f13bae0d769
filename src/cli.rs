use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

/// Command-line entry point for running and operating a scraper fleet.
/// Exit codes: 0=success, 2=invalid arguments, 1=runtime failure
#[derive(Parser, Debug)]
#[command(name = "fleet_scraper")]
#[command(about = "Fleet-coordinated, self-throttling profile scraper")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Infrastructure options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    #[arg(
        long,
        global = true,
        default_value = "redis://127.0.0.1:6379",
        env = "SCRAPER_STORE_URL",
        help = "Coordination store URL (redis://... or memory:// for a single process)"
    )]
    pub store_url: String,

    #[arg(
        long,
        global = true,
        default_value = "./data",
        help = "Directory holding the profile record store"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long,
        global = true,
        default_value = Config::DEFAULT_BASE_URL,
        help = "Profile URL prefix; the numeric ID and a slash are appended"
    )]
    pub base_url: String,

    #[arg(
        long,
        global = true,
        default_value_t = Config::REQUEST_TIMEOUT_SECS,
        help = "Request timeout in seconds"
    )]
    pub timeout: u64,

    #[arg(
        long,
        global = true,
        default_value = Config::DEFAULT_USER_AGENT,
        help = "User agent string for requests"
    )]
    pub user_agent: String,

    #[arg(long, global = true, help = "Also write text and JSON logs to this directory")]
    pub log_dir: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        help = "Read tunables from this JSON file instead of the coordination store"
    )]
    pub config_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register and run workers in the foreground until stopped or Ctrl+C.
    Start {
        #[arg(short, long, help = "Worker ID (replicas get -1, -2, ... suffixes)")]
        worker_id: String,

        #[arg(short, long, default_value_t = 1, help = "Number of local worker replicas")]
        replicas: usize,
    },

    /// Ask a worker to stop; its run-status key is force-removed after a grace period.
    Stop {
        #[arg(short, long, help = "Worker ID to stop")]
        worker_id: String,
    },

    /// Print whether a worker is running.
    Status {
        #[arg(short, long, help = "Worker ID to query")]
        worker_id: String,
    },

    /// Print fleet-wide counters, progress and queue depth as JSON.
    Stats,

    /// Look up stored profiles by numeric ID or nickname.
    Lookup {
        #[arg(help = "Profile ID or nickname")]
        query: String,
    },

    /// Validate a JSON tunables file and publish it to the whole fleet.
    PushConfig {
        #[arg(help = "Path to the JSON configuration file")]
        path: PathBuf,
    },
}

impl Cli {
    /// On error, clap prints help and exits with code 2 (usage error).
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
