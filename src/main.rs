//! ==============================================================================
//! main.rs - weather station entry point
//! ==============================================================================
//!
//! purpose:
//!     long-running daemon on a raspberry pi. every interval it samples the
//!     indoor ENV III unit (sht30 + qmp6988 on i2c) and the outdoor dht22
//!     (single-wire gpio), then pushes one json payload to the weather server.
//!
//! responsibilities:
//!     - load configuration and start logging
//!     - acquire the bus (the only fatal failure)
//!     - build sensors and the publisher, hand everything to the station
//!     - stop cleanly on ctrl-c / SIGTERM
//!
//! relationships:
//!     - uses: config.rs, hal.rs, sensors/*, publisher.rs, station.rs
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────┐
//!     │                   station (this process)                  │
//!     │                                                           │
//!     │   sensors/* ──► sampling ──► cache ──► publisher ──► http │
//!     │       │                                                   │
//!     │       ▼                                                   │
//!     │      hal ── MockHal (default build)                       │
//!     │          └─ PiHal (rppal, feature="hardware")             │
//!     └──────────────────────────────────────────────────────────┘
//!
//! ==============================================================================

mod cache;
mod config;
mod domain;
mod error;
mod gpio;
mod hal;
mod publisher;
mod sampling;
mod sensors;
mod station;
mod stats;

use anyhow::{Context, Result};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  Weather Station - ENV III + DHT22");
    println!("===========================================================");

    // step 1: load configuration
    let config = config::AppConfig::load_or_default();

    // step 2: logging (RUST_LOG wins over the configured level)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("weather_station={}", config.logging.level).into()),
        )
        .init();
    config.print_summary();

    // step 3: acquire the bus; nothing works without it
    let hal = hal::open(&config).context("failed to acquire sensor bus")?;
    tracing::info!("[STARTUP] ✓ Bus ready ({})", hal.name());

    // step 4: sensors and publisher
    let sensors = sensors::from_config(&config)?;
    if sensors.is_empty() {
        tracing::warn!("[STARTUP] No sensors enabled, every cycle will be skipped");
    }
    for configured in &sensors {
        tracing::info!("[STARTUP] ✓ {} ({})", configured.sensor.name(), configured.sensor.role());
    }

    let transport = publisher::ReqwestTransport::new(Duration::from_secs(config.server.timeout_seconds))
        .context("failed to build HTTP client")?;
    let publisher = publisher::Publisher::from_config(transport, &config.server);

    // step 5: run until asked to stop
    let mut station = station::Station::new(&config, hal, sensors, publisher);
    station.run(shutdown_signal()).await;

    tracing::info!("[RUNTIME] Stopped");
    Ok(())
}

/// resolves on ctrl-c, or SIGTERM where there is one
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("[RUNTIME] Ctrl-C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("[RUNTIME] SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
