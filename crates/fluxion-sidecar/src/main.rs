// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! FluxION Sidecar - Entry point for the sidecar binary
//!
//! Installs, switches and supervises versions of the managed proxy binary.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use fluxion_sidecar::{
    LaunchSettings, Orchestrator, ProcessSupervisor, ReleaseClient, RunState, SidecarConfig,
    VersionStore, load_config,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

const LOG_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "fluxion-sidecar")]
#[command(author, version, about = "FluxION proxy sidecar manager")]
struct Cli {
    /// Config file, created with defaults when missing
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the latest release and compare it with the active version
    Check,

    /// List releases from the catalog
    Releases {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 10)]
        per_page: u32,
    },

    /// Download, install and activate a release (latest by default)
    Install {
        /// Release tag, e.g. v6.1.2
        #[arg(long)]
        tag: Option<String>,
    },

    /// List installed versions
    List,

    /// Make an installed version the active one
    Activate { version: String },

    /// Remove an installed version
    Delete { version: String },

    /// Remove old versions, keeping the active one
    Cleanup {
        /// Newest versions to keep (defaults to `keep_latest` from the config)
        #[arg(long)]
        keep: Option<usize>,
    },

    /// Show the store and the active version
    Status,

    /// Supervise the active version until interrupted
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fluxion_sidecar=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => dirs::config_dir()
            .context("No platform config directory, pass --config")?
            .join("fluxion")
            .join("sidecar.json"),
    };
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    let orchestrator = build_orchestrator(&config)?;
    orchestrator.refresh().await;

    match cli.command {
        Commands::Check => check(&orchestrator).await,
        Commands::Releases { page, per_page } => releases(&orchestrator, page, per_page).await,
        Commands::Install { tag } => install(&orchestrator, tag).await,
        Commands::List => {
            list(&orchestrator);
            Ok(())
        }
        Commands::Activate { version } => {
            let ok = orchestrator.activate(&version).await;
            outcome(&orchestrator, ok)?;
            println!("Active version: {version}");
            Ok(())
        }
        Commands::Delete { version } => {
            let ok = orchestrator.delete(&version).await;
            outcome(&orchestrator, ok)?;
            println!("Deleted {version}");
            Ok(())
        }
        Commands::Cleanup { keep } => {
            let report = orchestrator.cleanup(keep.unwrap_or(config.keep_latest)).await;
            for version in &report.removed {
                println!("Removed {version}");
            }
            for version in &report.failed {
                println!("Could not remove {version}");
            }
            Ok(())
        }
        Commands::Status => {
            status(&orchestrator);
            Ok(())
        }
        Commands::Run => run(&config, &orchestrator).await,
    }
}

fn build_orchestrator(config: &SidecarConfig) -> anyhow::Result<Orchestrator> {
    let mut client = ReleaseClient::new(config.release_source.clone())?
        .with_token(config.github_token.clone());
    if let Some(ref api_base_url) = config.api_base_url {
        client = client.with_api_base_url(api_base_url);
    }

    let base_dir = config.resolved_base_dir()?;
    info!(base_dir = %base_dir.display(), source = ?config.release_source, "Opening version store");
    let store = Arc::new(VersionStore::new(base_dir, config.binary_name.clone()));

    Ok(Orchestrator::new(client, store))
}

/// Turn a failed orchestrator call into an error carrying its message
fn outcome(orchestrator: &Orchestrator, ok: bool) -> anyhow::Result<()> {
    if ok {
        return Ok(());
    }
    let message = orchestrator
        .state()
        .last_error
        .unwrap_or_else(|| "operation did not complete".to_string());
    bail!(message)
}

async fn check(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    let found = orchestrator.check_for_update().await.is_some();
    outcome(orchestrator, found)?;

    let state = orchestrator.state();
    let latest = state.latest_release.as_ref().map_or("-", |r| r.tag_name.as_str());
    println!("Latest release:  {latest}");
    println!(
        "Active version:  {}",
        state.current_version.as_deref().unwrap_or("none")
    );
    if state.update_available() {
        println!("Update available");
    } else {
        println!("Up to date");
    }
    Ok(())
}

async fn releases(orchestrator: &Orchestrator, page: u32, per_page: u32) -> anyhow::Result<()> {
    let releases = orchestrator.list_releases(page, per_page).await;
    if let Some(err) = orchestrator.state().last_error {
        bail!(err);
    }

    for release in releases {
        let asset = orchestrator
            .client()
            .select_asset(&release)
            .map_or("no suitable asset", |a| a.name.as_str());
        let marker = if release.prerelease { " (pre-release)" } else { "" };
        println!(
            "{:<16} {:<22} {asset}{marker}",
            release.tag_name,
            release.published_at.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn install(orchestrator: &Orchestrator, tag: Option<String>) -> anyhow::Result<()> {
    let release = match tag {
        Some(tag) => orchestrator
            .client()
            .fetch_by_tag(&tag)
            .await
            .with_context(|| format!("Release {tag} not found"))?,
        None => {
            let found = orchestrator.check_for_update().await;
            outcome(orchestrator, found.is_some())?;
            found.context("No release found")?
        }
    };

    let mut updates = orchestrator.subscribe();
    let reporter = tokio::spawn(async move {
        let mut last_decile = None;
        while updates.changed().await.is_ok() {
            let Some(progress) = updates.borrow_and_update().progress else {
                continue;
            };
            let Some(decile) = progress
                .bytes_written
                .saturating_mul(10)
                .checked_div(progress.total_bytes)
            else {
                continue;
            };
            if last_decile != Some(decile) {
                last_decile = Some(decile);
                eprintln!(
                    "Downloaded {:>3.0}% ({} of {} bytes)",
                    progress.fraction_completed() * 100.0,
                    progress.bytes_written,
                    progress.total_bytes
                );
            }
        }
    });

    let ok = orchestrator.install(&release).await;
    reporter.abort();
    outcome(orchestrator, ok)?;

    println!("Installed and activated {}", release.tag_name);
    Ok(())
}

fn list(orchestrator: &Orchestrator) {
    let state = orchestrator.state();
    if state.installed.is_empty() {
        println!("No versions installed");
        return;
    }

    for installed in &state.installed {
        let marker = if state.current_version.as_deref() == Some(installed.version.as_str()) {
            '*'
        } else {
            ' '
        };
        let when = installed
            .installed_at
            .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
        println!("{marker} {:<16} {when}", installed.version);
    }
}

fn status(orchestrator: &Orchestrator) {
    let state = orchestrator.state();
    let store = orchestrator.store();
    println!("Store:           {}", store.base_dir().display());
    println!("Source:          {}", orchestrator.client().source().releases_page_url());
    println!("Platform:        {}", orchestrator.client().platform());
    println!(
        "Active version:  {}",
        state.current_version.as_deref().unwrap_or("none")
    );
    match store.current_binary_path() {
        Some(path) => println!("Active binary:   {}", path.display()),
        None => println!("Active binary:   none"),
    }
    println!("Installed:       {}", state.installed.len());
}

async fn run(config: &SidecarConfig, orchestrator: &Orchestrator) -> anyhow::Result<()> {
    let store = orchestrator.store();
    if store.current_binary_path().is_none() {
        info!("No active version, installing the latest release");
        orchestrator.install_latest().await;
    }
    let binary = store
        .current_binary_path()
        .context("No active version installed")?;

    let launch = LaunchSettings {
        port: config.port,
        config_path: config.config_path.clone(),
    };
    let supervisor = ProcessSupervisor::new(config.log_capacity);

    let started = supervisor
        .start(&binary, launch.port, launch.config_path.as_deref())
        .await;
    let mut seen = print_logs(&supervisor, 0);
    if let RunState::Failed { reason } = started {
        bail!("Managed binary failed to start: {reason}");
    }

    let mut states = supervisor.subscribe();
    let mut sigterm = signal(SignalKind::terminate())?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut log_interval = tokio::time::interval(LOG_POLL_INTERVAL);
    let mut check_interval = tokio::time::interval(Duration::from_secs(config.check_interval_secs));
    // The first tick fires immediately, the startup check already happened
    check_interval.tick().await;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupt received");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break;
            }
            _ = log_interval.tick() => {
                seen = print_logs(&supervisor, seen);
            }
            _ = check_interval.tick(), if config.auto_update => {
                if !orchestrator.install_latest().await {
                    continue;
                }
                orchestrator.cleanup(config.keep_latest).await;
                if config.restart_on_update
                    && let Some(binary) = store.current_binary_path()
                {
                    supervisor
                        .restart(&binary, launch.port, launch.config_path.as_deref())
                        .await;
                }
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                if matches!(state, RunState::Stopped | RunState::Failed { .. }) {
                    print_logs(&supervisor, seen);
                    bail!("Managed binary is {state}");
                }
            }
        }
    }

    if let Some(tier) = supervisor.stop().await {
        info!(tier = ?tier, "Managed binary stopped");
    } else {
        warn!("Managed binary was not running at shutdown");
    }
    print_logs(&supervisor, seen);
    Ok(())
}

fn print_logs(supervisor: &ProcessSupervisor, seen: u64) -> u64 {
    let (lines, seen) = supervisor.logs_since(seen);
    for line in lines {
        println!("{line}");
    }
    seen
}
