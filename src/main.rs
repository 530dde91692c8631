//! `acoustics-daq`: control API and experiment loop for one acoustics rig.

use acoustics_daq::config::{AppConfig, DeploymentMode};
use acoustics_daq::experiment::Controller;
use acoustics_daq::gateway::{HttpGateway, InstrumentGateway};
use acoustics_daq::instrument::{mux, PulserSetup};
use acoustics_daq::scheduler::{Scheduler, SchedulerTiming};
use acoustics_daq::sequencer::PulseSequencer;
use acoustics_daq::server::{self, Backend};
use acoustics_daq::storage::SqliteStore;
use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Time granted to an in-flight cycle after Ctrl-C.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(40);

#[derive(Parser, Debug)]
#[command(name = "acoustics-daq", version, about)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config/acoustics.toml")]
    config: PathBuf,

    /// Override `server.bind`
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Send the one-time pulser configuration before serving
    #[arg(long)]
    setup_pulser: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level)),
        )
        .init();

    info!(
        name = %config.application.name,
        mode = ?config.application.mode,
        data_dir = %config.storage.data_dir.display(),
        "Starting"
    );

    let gateway: Arc<dyn InstrumentGateway> = Arc::new(HttpGateway::new(&config.gateway));
    if cli.setup_pulser {
        for command in PulserSetup::default().commands() {
            gateway
                .pulser(&command)
                .await
                .with_context(|| format!("pulser setup command {}", command))?;
        }
        info!("Pulser configured");
    }

    let sequencer = Arc::new(
        PulseSequencer::new(gateway.clone())
            .with_energize_command(config.gateway.pulse_repetition.clone())
            .with_switch_settle(config.timing.switch_settle()),
    );
    let store = Arc::new(SqliteStore::new(&config.storage.data_dir));
    let bind = config.server.bind;

    match config.application.mode {
        DeploymentMode::Single => {
            let controller = Arc::new(
                Controller::new(sequencer, store)
                    .with_policy(config.recovery_policy())
                    .with_data_dir(&config.storage.data_dir),
            );
            let served = server::serve(Backend::Single(controller.clone()), bind, shutdown_signal()).await;
            controller.shutdown(SHUTDOWN_TIMEOUT).await;
            served?;
        }
        DeploymentMode::Multi => {
            if config.jigs.is_empty() {
                warn!("Multi mode without any [[jigs]] configured");
            }
            if let Err(e) = gateway.mux(mux::CLEAR).await {
                warn!(error = %e, "Could not clear multiplexer latches");
            }
            let scheduler = Scheduler::spawn(
                &config.jigs,
                sequencer,
                store,
                SchedulerTiming::from_config(&config),
                config.recovery_policy(),
            );
            let served = server::serve(Backend::Multi(scheduler.clone()), bind, shutdown_signal()).await;
            scheduler.shutdown(SHUTDOWN_TIMEOUT).await;
            served?;
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received, stopping"),
        Err(e) => {
            error!(error = %e, "Cannot listen for Ctrl-C; stop the process externally");
            std::future::pending::<()>().await;
        }
    }
}
