//! Glance Simplestreams Sync - Standalone Binary
//!
//! Run from cron (or the `sync-images` action) on the charm unit.
//!
//! ## Usage
//!
//! ```bash
//! # One sync pass with the charm-rendered configuration
//! glance-simplestreams-sync
//!
//! # Log to the terminal with debug output
//! glance-simplestreams-sync --log-file - --verbose
//!
//! # Show the proxy environment handed to sstream-mirror-glance
//! glance-simplestreams-sync --log-file - proxy-env
//! ```
//!
//! Exit status: 0 when the run finished (whatever its outcome), 1 on
//! configuration or setup failure, 2 when another sync is already running.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use sstream_sync::catalog::{CatalogSource, KeystoneClient};
use sstream_sync::config::{SyncConfig, DEFAULT_CONF_DIR};
use sstream_sync::error::{ConfigError, SyncError};
use sstream_sync::juju::{JujuTools, ProxySource, StatusReporter, WorkloadStatus};
use sstream_sync::lock::{LockAttempt, RunLock, DEFAULT_LOCK_FILE};
use sstream_sync::logging::{init_logging, LogTarget, DEFAULT_LOG_FILE};
use sstream_sync::mirror::ProcessRunner;
use sstream_sync::proxy::get_sstream_mirror_proxy_env;
use sstream_sync::sync::SyncAgent;

const EXIT_ALREADY_RUNNING: u8 = 2;

/// Glance Simplestreams Sync - mirror cloud images into Glance
#[derive(Parser, Debug)]
#[command(name = "glance-simplestreams-sync", version, about)]
struct Args {
    /// Directory holding identity.yaml and mirrors.yaml
    #[arg(long, default_value = DEFAULT_CONF_DIR, env = "GSS_CONFIG_DIR")]
    config_dir: PathBuf,

    /// Run lock / pid file
    #[arg(long, default_value = DEFAULT_LOCK_FILE, env = "GSS_LOCK_FILE")]
    lock_file: PathBuf,

    /// Log file, or `-` for stderr
    #[arg(long, default_value = DEFAULT_LOG_FILE, env = "GSS_LOG_FILE")]
    log_file: String,

    /// Unit to report status for when identity.yaml cannot be read
    #[arg(long, env = "JUJU_UNIT_NAME")]
    unit_name: Option<String>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(long, short, default_value = "false")]
    verbose: bool,

    /// Emit JSON log lines
    #[arg(long, default_value = "false")]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Commands {
    /// Run one image sync (default)
    Sync,
    /// Print the proxy environment for sstream-mirror-glance and exit
    ProxyEnv,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&LogTarget::parse(&args.log_file), args.verbose, args.json) {
        eprintln!("{:#}", e);
        return ExitCode::FAILURE;
    }

    let result = match args.command.unwrap_or(Commands::Sync) {
        Commands::Sync => run_sync(&args).await,
        Commands::ProxyEnv => print_proxy_env(&args).await.map(|()| ExitCode::SUCCESS),
    };

    result.unwrap_or_else(|e| {
        error!(error = %format!("{:#}", e), "glance-simplestreams-sync failed");
        ExitCode::FAILURE
    })
}

/// One locked sync pass
async fn run_sync(args: &Args) -> Result<ExitCode> {
    info!("glance-simplestreams-sync started.");

    let _lock = match RunLock::acquire(&args.lock_file)
        .with_context(|| format!("Failed to open lock file: {:?}", args.lock_file))?
    {
        LockAttempt::Acquired(lock) => lock,
        LockAttempt::AlreadyRunning => return Ok(ExitCode::from(EXIT_ALREADY_RUNNING)),
    };

    let config = load_config(args)?;
    let unit = JujuTools::new(config.identity.unit_name.clone());

    let installed_ca = config.install_ca_bundle()?;
    let keystone = match KeystoneClient::new(
        &config.identity,
        installed_ca.as_ref().map(|(pem, _)| pem.as_slice()),
    ) {
        Ok(client) => client,
        Err(e @ SyncError::Config(_)) => {
            unit.status_set(WorkloadStatus::Blocked, &e.to_string());
            return Err(e).context("Cannot talk to the identity service");
        }
        Err(e) => return Err(e).context("Failed to create identity client"),
    };
    info!(auth_url = %keystone.auth_url(), "Using identity service");

    let work_dir = env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(env::temp_dir);

    let runner = ProcessRunner;
    let outcome = SyncAgent::new(&config, &keystone, &unit, &runner)
        .with_work_dir(work_dir)
        .with_cacert_path(installed_ca.map(|(_, path)| path))
        .run()
        .await;

    info!(outcome = %serde_json::to_string(&outcome).unwrap_or_default(), "sync done.");
    Ok(ExitCode::SUCCESS)
}

/// Load both config files; malformed files also block the unit
fn load_config(args: &Args) -> Result<SyncConfig> {
    match SyncConfig::load(&args.config_dir) {
        Ok(config) => Ok(config),
        Err(e @ ConfigError::Parse { .. }) => {
            let message = format!("{}. Check juju config values for errors.", e);
            if let Some(unit_name) = &args.unit_name {
                JujuTools::new(unit_name.clone()).status_set(WorkloadStatus::Blocked, &message);
            }
            Err(e).context("Invalid configuration")
        }
        Err(e) => Err(e).context("Configuration not available"),
    }
}

/// Print `KEY=value` lines, sorted by key
async fn print_proxy_env(args: &Args) -> Result<()> {
    let config = load_config(args)?;
    let unit = JujuTools::new(config.identity.unit_name.clone());

    let ca = config.identity.ca_bundle()?;
    let keystone = KeystoneClient::new(&config.identity, ca.as_deref())?;
    let snapshot = keystone.snapshot().await?;

    let env = get_sstream_mirror_proxy_env(
        &snapshot.catalog,
        &config.mirrors.region,
        unit.proxy_settings()?,
        config.mirrors.ignore_proxy_for_object_store,
    )?;

    for (key, value) in &env {
        println!("{}={}", key, value);
    }
    Ok(())
}
