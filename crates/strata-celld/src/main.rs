//! Strata cellular daemon
//!
//! Brings the modem data link up and keeps it there.
//!
//! - Loads the cellular configuration from TOML and watches it for changes
//! - Runs the connectivity manager on its worker thread
//! - Restarts the manager after a modem firmware update
//! - Dumps the published status records as JSON on a fixed interval
//! - In `--simulate` mode, drives an in-process modem with a drifting signal

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{bounded, select, tick};
use rand::Rng;
use tracing_subscriber::EnvFilter;

use strata_cellular::modem::sim::SimulatedModem;
use strata_cellular::{CellularConfig, CellularRuntime, ExitReason, StatusBoard, TargetState};

/// Strata cellular connectivity daemon.
#[derive(Parser, Debug)]
#[command(name = "strata-celld", about = "Strata cellular connectivity daemon")]
struct Cli {
    /// Cellular configuration file (TOML). Defaults apply when absent.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the configured target state (off, sim_only, full, modem_only).
    #[arg(long)]
    target: Option<TargetState>,

    /// Run against the simulated modem.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// IMSI reported by the simulated SIM.
    #[arg(long)]
    imsi: Option<String>,

    /// Status dump interval in seconds (0 disables).
    #[arg(long, default_value_t = 30)]
    status_interval: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if !cli.simulate {
        anyhow::bail!("no hardware modem driver in this build, run with --simulate");
    }

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(target) = cli.target {
        config.target_state = target;
    }
    tracing::info!(
        target = %config.target_state,
        slots = config.sim_slots.len(),
        simulate = cli.simulate,
        "strata-celld starting"
    );

    let modem = SimulatedModem::new();
    if let Some(imsi) = &cli.imsi {
        modem.set_imsi(imsi);
    }
    let board = Arc::new(StatusBoard::new(config));

    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("Error setting signal handler")?;

    let mut runtime = CellularRuntime::spawn(modem.clone(), board.clone())?;
    let mut config_mtime = cli.config.as_deref().and_then(modified);

    let ticker = tick(Duration::from_secs(1));
    let status_every = cli.status_interval;
    let mut elapsed: u64 = 0;

    loop {
        select! {
            recv(stop_rx) -> _ => {
                tracing::info!("shutdown requested");
                runtime.shutdown();
                break;
            }
            recv(ticker) -> _ => {
                elapsed += 1;
                drift_signal(&modem);

                if let Some(path) = cli.config.as_deref() {
                    let mtime = modified(path);
                    if mtime != config_mtime {
                        config_mtime = mtime;
                        reload_config(&runtime, path, cli.target);
                    }
                }

                if status_every > 0 && elapsed % status_every == 0 {
                    match serde_json::to_string(&board.snapshot()) {
                        Ok(json) => println!("{json}"),
                        Err(e) => tracing::warn!(error = %e, "status serialization failed"),
                    }
                }

                if runtime.is_finished() {
                    match runtime.wait() {
                        ExitReason::Restart(cause) => {
                            tracing::info!(?cause, "restarting connectivity manager");
                            runtime = CellularRuntime::spawn(modem.clone(), board.clone())?;
                        }
                        ExitReason::Shutdown => break,
                    }
                }
            }
        }
    }

    tracing::info!("strata-celld stopped");
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CellularConfig> {
    let Some(path) = path else {
        return Ok(CellularConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    CellularConfig::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn reload_config(runtime: &CellularRuntime, path: &Path, target: Option<TargetState>) {
    match load_config(Some(path)) {
        Ok(mut config) => {
            if let Some(target) = target {
                config.target_state = target;
            }
            tracing::info!(path = %path.display(), "configuration changed");
            runtime.update_config(config);
        }
        Err(e) => tracing::warn!(error = %e, "ignoring invalid configuration"),
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Fresh RSSI sample for the simulated modem, in the usable range.
fn drift_signal(modem: &SimulatedModem) {
    let mut rng = rand::rng();
    modem.set_signal(rng.random_range(8..=28));
}
