//! Per-device scheduling units.
//!
//! Pull devices get a dedicated poll task ticking every
//! `polling_interval_secs`; push devices get a consumer task draining the
//! channel their transport feeds. Each unit is an independent tokio task,
//! so a slow or failing device never delays another device's schedule.
//!
//! ```text
//! tick ──▶ read_once (≤ io_timeout) ──▶ manager.handle_sample ──▶ keep going?
//!   ▲                                                                │ yes
//!   └────────────────────────────────────────────────────────────────┘
//!                                   no: threshold reached, task exits
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::{Result, SensorError};
use crate::manager::ConnectionManager;
use crate::transport::Transport;

pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Buffered samples per push device before the transport waits.
pub const PUSH_BUFFER: usize = 64;

/// Spawn the poll loop for a pull device. The first read happens
/// immediately; later ones follow the interval.
pub fn spawn_poller(
    manager: Arc<ConnectionManager>,
    sensor_id: String,
    generation: u64,
    transport: SharedTransport,
    interval: Duration,
    io_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(sensor = %sensor_id, interval_secs = interval.as_secs(), "poller started");

        loop {
            ticker.tick().await;
            let sample = {
                let mut t = transport.lock().await;
                read_with_timeout(&sensor_id, &mut **t, io_timeout).await
            };
            if !manager.handle_sample(&sensor_id, generation, sample).await {
                break;
            }
        }
        debug!(sensor = %sensor_id, "poller stopped");
    })
}

/// Spawn the consumer for a push device's sample channel.
pub fn spawn_push_consumer(
    manager: Arc<ConnectionManager>,
    sensor_id: String,
    generation: u64,
    mut rx: mpsc::Receiver<Result<f64>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(sensor = %sensor_id, "subscription consumer started");
        while let Some(sample) = rx.recv().await {
            if !manager.handle_sample(&sensor_id, generation, sample).await {
                break;
            }
        }
        debug!(sensor = %sensor_id, "subscription consumer stopped");
    })
}

/// A hung adapter call becomes a `ReadTimeout` after `io_timeout`.
pub async fn read_with_timeout(
    sensor_id: &str,
    transport: &mut dyn Transport,
    io_timeout: Duration,
) -> Result<f64> {
    match tokio::time::timeout(io_timeout, transport.read_once()).await {
        Ok(r) => r,
        Err(_) => Err(SensorError::ReadTimeout {
            sensor_id: sensor_id.to_string(),
            timeout: io_timeout,
        }),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
