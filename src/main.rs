use clap::Parser;
use log::{error, info, warn};
use nefit_bridge::config::{self, Config};
use nefit_bridge::connection::ConnectionManager;
use nefit_bridge::device::SimulatedThermostat;
use nefit_bridge::error::Result;
use nefit_bridge::events::{ConnectionStatus, ENDPOINT_WEB, EventBus, StateSnapshot};
use nefit_bridge::logging::{self, LogFormat, LogLevel};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Parser, Debug)]
#[command(
    name = "nefit-bridge",
    version,
    about = "Bridge a Nefit Easy thermostat onto an in-process event bus"
)]
struct Cli {
    /// .env file loaded before reading the environment
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Overrides NEFITHK_LOG_LEVEL (debug, info, warn, error)
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Overrides NEFITHK_LOG_FORMAT (json, console)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Make the simulated device refuse the first N connection attempts
    #[arg(long, default_value_t = 0)]
    fail_connects: u32,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load .env file before anything else
    let dotenv = config::load_dotenv(&cli.env_file);

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("nefit-bridge: configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    if let Err(e) = logging::init(config.logging.level, config.logging.format) {
        eprintln!("nefit-bridge: {e}");
        return ExitCode::FAILURE;
    }
    match dotenv {
        Ok(0) => {}
        Ok(n) => info!("Loaded {} variables from {}", n, cli.env_file.display()),
        Err(e) => warn!("Could not read {}: {}", cli.env_file.display(), e),
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config, cli.fail_connects)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            warn!("Shutdown did not complete cleanly");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Nefit bridge failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, fail_connects: u32) -> Result<bool> {
    info!("Starting Nefit bridge");
    info!("Configuration loaded:");
    info!("  Serial: {}", config.nefit.serial);
    info!(
        "  Keepalive: {}",
        humantime::format_duration(config.connection.keepalive_interval)
    );
    info!(
        "  Reconnect backoff: {} .. {}",
        humantime::format_duration(config.connection.initial_backoff),
        humantime::format_duration(config.connection.max_backoff)
    );
    info!("  Queue capacity: {}", config.bus.queue_capacity);

    let bus = EventBus::with_config(config.bus.clone());

    // No protocol client is linked in; the simulated device stands in for it.
    let device = Arc::new(SimulatedThermostat::new());
    if fail_connects > 0 {
        info!("Simulated device will refuse {} connection attempts", fail_connects);
        device.fail_next_connects(fail_connects);
    }

    let monitor = spawn_monitor(&bus)?;

    let mut manager = ConnectionManager::new(config.connection.clone(), device, &bus)?;
    manager.start()?;

    info!("Nefit bridge is running");
    info!("  - Press Ctrl+C to exit");

    wait_for_shutdown_signal().await;
    info!("Received shutdown signal");

    // Manager first so its final Disconnected status still reaches subscribers.
    let report = manager.shutdown().await;
    bus.close();
    if let Err(e) = monitor.await {
        warn!("Monitor task ended abnormally: {}", e);
    }

    info!("Nefit bridge stopped");
    Ok(report.clean)
}

/// Log every state and status event as the `web` component would see them.
fn spawn_monitor(bus: &EventBus) -> Result<JoinHandle<()>> {
    let endpoint = bus.create_endpoint(ENDPOINT_WEB)?;
    let mut states = endpoint.subscribe::<StateSnapshot>()?;
    let mut statuses = endpoint.subscribe::<ConnectionStatus>()?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                state = states.recv() => match state {
                    Some(state) => info!(
                        "[Monitor] {:.1}°C (target {:.1}°C, {}, heating {}, pressure {:.1} bar, hot water {})",
                        state.current_temperature,
                        state.target_temperature,
                        state.mode,
                        if state.heating_active { "on" } else { "off" },
                        state.pressure,
                        if state.hot_water_active { "on" } else { "off" },
                    ),
                    None => break,
                },
                status = statuses.recv() => match status {
                    Some(status) => match status.error {
                        Some(error) => info!(
                            "[Monitor] {} is {} ({}, attempt {})",
                            status.component, status.state, error, status.reconnects
                        ),
                        None => info!("[Monitor] {} is {}", status.component, status.state),
                    },
                    None => break,
                },
            }
        }
        info!("[Monitor] Event bus closed");
    }))
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to listen for SIGTERM: {}", e),
        }
    }

    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
