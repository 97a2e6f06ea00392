// Copyright (c) 2026 AlertR developers
// Licensed under the MIT License. See LICENSE file in the project root.

//! AlertR server - sensor alert decision engine
//!
//! Runs the sensor alert executer and manager updates headless until Ctrl+C
//! and logs everything published on the event bus.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use alertr::core::{EventBus, EventPayload};
use alertr::{Config, Engine, VERSION};

/// AlertR - sensor alert decision engine
#[derive(Parser, Debug)]
#[command(name = "alertr")]
#[command(author = "AlertR developers")]
#[command(version = VERSION)]
#[command(about = "Profile-aware sensor alert decision engine")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable trace-level logging
    #[arg(long)]
    trace: bool,

    /// Database file, overrides the configured path
    #[arg(long)]
    database: Option<PathBuf>,

    /// Switch to this profile on startup
    #[arg(long)]
    profile: Option<u32>,
}

fn log_level(args: &Args, config: &Config) -> Level {
    if args.trace {
        Level::TRACE
    } else if args.debug {
        Level::DEBUG
    } else {
        config.log_level.parse().unwrap_or(Level::INFO)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Configuration first, its log level applies when no flag is given
    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_create(&config_path)?;
    if let Some(database) = &args.database {
        config.database.path = database.clone();
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level(&args, &config))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(args.debug)
        .with_line_number(args.debug)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("AlertR v{} - sensor alert decision engine", VERSION);
    info!("Configuration loaded from {:?}", config_path);
    info!(
        "{} profiles, {} alert levels",
        config.profiles.len(),
        config.alert_levels.len()
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config, args.profile))
}

async fn run(config: Config, profile: Option<u32>) -> Result<()> {
    let mut engine = Engine::new(config).await?;

    let logger = tokio::spawn(log_events(engine.bus()));

    if let Some(profile) = profile {
        engine.change_profile(profile).await?;
    }
    engine.start().await?;

    info!("AlertR running, press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received, cleaning up...");
    engine.stop().await?;
    logger.abort();

    let state = engine.state().await;
    info!(
        "Triggered {} alert levels, dropped {} sensor alerts",
        state.total_triggered, state.total_dropped
    );
    info!("AlertR shutdown complete");

    Ok(())
}

async fn log_events(bus: Arc<EventBus>) {
    let mut rx = bus.subscribe_events();
    loop {
        match rx.recv().await {
            Ok(event) => match event.payload {
                EventPayload::Triggered(triggered) => info!(
                    alert_level = triggered.alert_level,
                    sensor_id = triggered.sensor_alert.sensor_id,
                    "Alert level '{}' triggered",
                    triggered.alert_level_name
                ),
                EventPayload::StateChange(change) => info!(
                    sensor_id = change.sensor_id,
                    "Sensor state {:?}, data {}",
                    change.state,
                    change.data
                ),
                EventPayload::Status { profile, sensors } => {
                    info!(?profile, sensors = sensors.len(), "Status update")
                }
                EventPayload::Profile { profile, name } => {
                    info!(profile, "Profile changed to '{}'", name)
                }
                EventPayload::Error { code, message } => warn!(code, "{}", message),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Event log lagged by {} events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
