//! Inklog
//!
//! Long-running supervisor that discovers Inkbird IDT-34c-B wireless
//! thermometers on the BlueZ D-Bus surface, drives each one through
//! connection, service resolution and vendor activation, and streams the
//! decoded readings into a compact per-sample log file.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use controller::bluez::BluezBus;
use controller::coordinator::Coordinator;
use controller::logger::ThermalLog;

use crate::core::config::Config;
use crate::core::constants::{LOG_INTERVAL, WATCHTIME};
use crate::core::events::AppEvent;

/// Core utilities used throughout the daemon.
mod core {
    /// Runtime configuration from the environment.
    pub mod config;
    /// Application-wide constants.
    pub mod constants;
    /// Event system for inter-component communication.
    pub mod events;
}

/// Typed interfaces between components.
mod api {
    /// Facade over the BLE host stack.
    pub mod bus;
}

/// Data models representing the daemon's domain.
mod model {
    /// Per-device supervision record.
    pub mod device;
    /// Temperature packet decoding.
    pub mod packet;
    /// Shared sample register with the redundancy filter.
    pub mod register;
    /// Device-to-channel slot allocation.
    pub mod slots;
}

/// Controllers driving the daemon's logic.
mod controller {
    /// BlueZ D-Bus implementation of the bus facade.
    pub mod bluez;
    /// Event routing and shared-state ownership.
    pub mod coordinator;
    /// Periodic sample emission and stall recovery.
    pub mod logger;
    /// The per-device state machine.
    pub mod supervisor;
}

/// Main entry point of the daemon.
///
/// Initializes logging, connects to the system bus, wires the periodic
/// tickers and signal handling into the coordinator channel, and runs the
/// coordinator until shutdown or loss of the bus.
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let config = Config::from_env();
    info!("writing samples to {}", config.log_path.display());

    let (tx, rx) = mpsc::unbounded_channel();

    let (bus, io_task) = BluezBus::connect().await?;
    let _signal_matches = bus.subscribe_signals(tx.clone()).await?;

    let log = ThermalLog::create(&config.log_path, config.stall_timeout)
        .with_context(|| format!("opening {}", config.log_path.display()))?;
    let coordinator = Coordinator::new(Arc::new(bus), tx.clone(), rx, log);

    spawn_ticker(tx.clone(), WATCHTIME, AppEvent::Sweep);
    spawn_ticker(tx.clone(), LOG_INTERVAL, AppEvent::LogTick);
    spawn_signal_listener(tx)?;

    tokio::select! {
        result = coordinator.run() => result,
        _ = io_task => bail!("D-Bus connection lost"),
    }
}

/// Delivers `event` into the coordinator channel every `period`. The
/// first tick fires immediately, which doubles as the initial discovery
/// sweep.
fn spawn_ticker(tx: mpsc::UnboundedSender<AppEvent>, period: Duration, event: AppEvent) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if tx.send(event.clone()).is_err() {
                break;
            }
        }
    });
}

/// SIGINT and SIGTERM both request a graceful shutdown.
fn spawn_signal_listener(tx: mpsc::UnboundedSender<AppEvent>) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = terminate.recv() => info!("SIGTERM received"),
        }
        if tx.send(AppEvent::Shutdown).is_err() {
            warn!("coordinator already stopped");
        }
    });
    Ok(())
}
