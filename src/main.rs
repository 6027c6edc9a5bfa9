//! cloud-init-rs - A safe Rust implementation of cloud-init
//!
//! Focused on:
//! - Fast boot times
//! - Memory safety (no unsafe code)
//! - Exactly-once configuration across stages and reboots

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cloud_init_rs::datasources::cache;
use cloud_init_rs::state::{CloudPaths, InstanceState};
use cloud_init_rs::{BootContext, Stage, run_stages};

#[derive(Parser)]
#[command(name = "cloud-init-rs")]
#[command(author, version, about = "Safe Rust implementation of cloud-init", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// State directory
    #[arg(long, env = "CLOUD_INIT_BASE_DIR", default_value = "/var/lib/cloud")]
    base_dir: PathBuf,

    /// Configuration directory holding cloud.cfg and cloud.cfg.d
    #[arg(long, env = "CLOUD_INIT_CONFIG_DIR", default_value = "/etc/cloud")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the system (runs all stages)
    Init,
    /// Run local stage (filesystem-only datasources)
    Local,
    /// Run network stage (after network is up)
    Network,
    /// Run config stage (apply configuration)
    Config,
    /// Run final stage (user scripts, etc.)
    Final,
    /// Query instance metadata
    Query {
        /// Key to query (e.g., instance-id, local-hostname)
        key: String,
    },
    /// Clean cloud-init artifacts
    Clean {
        /// Remove logs as well
        #[arg(long)]
        logs: bool,
    },
    /// Show status of cloud-init
    Status,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

const ALL_STAGES: [Stage; 4] = [Stage::Local, Stage::Network, Stage::Config, Stage::Final];

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let paths = CloudPaths::with_dirs(&cli.base_dir, &cli.config_dir);

    let stages: &[Stage] = match cli.command {
        Some(Commands::Init) | None => &ALL_STAGES,
        Some(Commands::Local) => &[Stage::Local],
        Some(Commands::Network) => &[Stage::Network],
        Some(Commands::Config) => &[Stage::Config],
        Some(Commands::Final) => &[Stage::Final],
        Some(Commands::Query { key }) => return query(&paths, &key).await,
        Some(Commands::Clean { logs }) => {
            info!("Cleaning cloud-init artifacts (logs: {})", logs);
            InstanceState::with_paths(paths)
                .clean(logs)
                .await
                .context("cleaning state")?;
            return Ok(ExitCode::SUCCESS);
        }
        Some(Commands::Status) => {
            let status = InstanceState::with_paths(paths)
                .read_status()
                .await
                .context("reading status")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(ExitCode::SUCCESS);
        }
    };

    let ctx = BootContext::load(paths)
        .await
        .context("loading system configuration")?;
    let code = run_stages(ctx, stages).await?;
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX)))
}

/// Print one value from the cached instance
async fn query(paths: &CloudPaths, key: &str) -> anyhow::Result<ExitCode> {
    let Some(record) = cache::load(paths).await.context("reading datasource cache")? else {
        eprintln!("No cached datasource; run the local or network stage first");
        return Ok(ExitCode::FAILURE);
    };

    let value = match key {
        "instance-id" | "instance_id" => Some(record.instance_id.clone()),
        "datasource" => Some(record.datasource.to_string()),
        "userdata" | "user-data" => Some(String::from_utf8_lossy(&record.user_data).into_owned()),
        _ => record.metadata.get(key).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
    };

    match value {
        Some(value) => {
            println!("{value}");
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("Undefined key: {key}");
            Ok(ExitCode::FAILURE)
        }
    }
}
