//! Lumen license control
//!
//! Operator tool for inspecting and changing the license state of a Lumen
//! installation. It drives the same engine the product embeds, against the
//! same cache file.
//!
//! Usage:
//!   lumen-licensectl --config license.json status
//!   lumen-licensectl --config license.json activate ABCD-1234-EFGH
//!   lumen-licensectl --config license.json watch

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lumen_license::{
    Caller, DeviceFingerprint, DeviceInfo, Ed25519Verifier, FailureClass, HttpAuthority,
    LicenseCache, LicenseConfig, LicenseEngine, LicenseError, LicenseState, RevalidationScheduler,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lumen-licensectl")]
#[command(about = "Inspect and manage the Lumen license on this machine")]
struct Args {
    /// Path to the license configuration file (JSON)
    #[arg(short, long, default_value = "license.json")]
    config: PathBuf,

    /// Override the license cache location
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Print the cached license state without contacting the authority
    Status,
    /// Activate a license key on this device
    Activate {
        /// License key, e.g. ABCD-1234-EFGH
        key: String,
    },
    /// Re-verify the license with the authority now
    Check,
    /// Keep re-verifying in the background until interrupted
    Watch,
    /// Print this device's id and host details
    Device,
}

#[derive(Serialize)]
struct StatusReport<'a> {
    summary: &'static str,
    #[serde(flatten)]
    state: &'a LicenseState,
}

impl<'a> StatusReport<'a> {
    fn new(state: &'a LicenseState) -> Self {
        Self {
            summary: summary(state),
            state,
        }
    }
}

#[derive(Serialize)]
struct DeviceReport {
    device_id: String,
    #[serde(flatten)]
    info: DeviceInfo,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let class = e.downcast_ref::<LicenseError>().map(LicenseError::class);
            match class {
                Some(class) => eprintln!("error [{class:?}]: {e:#}"),
                None => eprintln!("error: {e:#}"),
            }
            ExitCode::from(exit_code(class))
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn run(args: Args) -> Result<()> {
    if args.command == Command::Device {
        let fingerprint = DeviceFingerprint::generate();
        return print_json(&DeviceReport {
            device_id: fingerprint.into(),
            info: DeviceInfo::collect(),
        });
    }

    let config = load_config(&args.config, args.cache)?;
    let engine = build_engine(&config)?;

    match args.command {
        Command::Status => print_json(&StatusReport::new(&engine.get_status().await)),
        Command::Activate { key } => {
            let state = engine
                .activate_license_key(Caller::Privileged, &key)
                .await
                .context("activation failed")?;
            info!("Activated {} on {}", key, engine.device_id());
            print_json(&StatusReport::new(&state))
        }
        Command::Check => match engine.check_license(Caller::Privileged).await {
            Ok(state) => print_json(&StatusReport::new(&state)),
            Err(e) if e.is_retryable() => {
                warn!("Authority unreachable; showing offline state");
                print_json(&StatusReport::new(&engine.get_status().await))?;
                Err(e).context("license check incomplete")
            }
            Err(e) => Err(e).context("license check failed"),
        },
        Command::Watch => watch(engine, &config).await,
        Command::Device => Ok(()),
    }
}

fn load_config(path: &Path, cache_override: Option<PathBuf>) -> Result<LicenseConfig> {
    let mut config = LicenseConfig::from_file(path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    if let Some(cache) = cache_override {
        config.cache_path = Some(cache);
    }
    Ok(config)
}

fn build_engine(config: &LicenseConfig) -> Result<LicenseEngine> {
    let cache_path = config.cache_path();
    let cache = LicenseCache::open(&cache_path)
        .with_context(|| format!("opening license cache {}", cache_path.display()))?;
    let authority = HttpAuthority::from_config(config)?;
    let verifier = Ed25519Verifier::from_hex(&config.public_key_hex)?;

    let engine = LicenseEngine::new(
        config,
        DeviceFingerprint::generate(),
        Arc::new(authority),
        Arc::new(verifier),
        Arc::new(cache),
    )?;
    Ok(engine)
}

async fn watch(engine: LicenseEngine, config: &LicenseConfig) -> Result<()> {
    let status = engine.get_status().await;
    println!("License status: {}", status.status);
    println!(
        "Re-verifying every {:?} (offline retry {:?}); Ctrl-C to stop",
        config.revalidation_interval(),
        config.offline_retry_interval()
    );

    let handle = RevalidationScheduler::from_config(engine.clone(), config);
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    let ticks = handle.ticks();
    handle.shutdown().await;
    let status = engine.get_status().await;
    println!("Stopped after {ticks} checks; license status: {}", status.status);
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(class: Option<FailureClass>) -> u8 {
    match class {
        Some(FailureClass::Validation) => 2,
        Some(FailureClass::Network) => 3,
        Some(FailureClass::Rejection) => 4,
        Some(FailureClass::Business) => 5,
        Some(FailureClass::Internal) | None => 1,
    }
}

fn summary(state: &LicenseState) -> &'static str {
    if state.requires_reconnect() {
        "reconnect to the licensing authority to continue"
    } else if state.is_entitled() {
        "licensed"
    } else {
        "not licensed"
    }
}
