//! Simulated transports for benches without hardware (`SIMULATE_SENSORS=1`).
//!
//! Every device becomes a pull source whose raw value random-walks around
//! the middle of its parameter's target range.

use std::time::Duration;

use async_trait::async_trait;

use super::{Delivery, SampleSender, Transport, TransportFactory};
use crate::error::{Result, SensorError};
use crate::model::SensorDevice;
use crate::thresholds::default_range;

#[derive(Debug, Default, Clone)]
pub struct SimulatedTransports;

#[async_trait]
impl TransportFactory for SimulatedTransports {
    async fn open(&self, device: &SensorDevice, _io_timeout: Duration) -> Result<Box<dyn Transport>> {
        let (center, span) = default_range(&device.parameter)
            .map(|r| ((r.min + r.max) / 2.0, r.max - r.min))
            .unwrap_or((50.0, 20.0));
        Ok(Box::new(RandomWalk::new(&device.id, center, span)))
    }
}

pub struct RandomWalk {
    sensor_id: String,
    center: f64,
    /// Step size; a tenth of the target span per read at most.
    step: f64,
    value: f64,
    open: bool,
}

impl RandomWalk {
    pub fn new(sensor_id: &str, center: f64, span: f64) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            center,
            step: span / 10.0,
            value: center,
            open: true,
        }
    }

    fn next_value(&mut self) -> f64 {
        let pull = 0.1 * (self.center - self.value);
        let walk = (fastrand::f64() * 2.0 - 1.0) * self.step;
        self.value += pull + walk;
        self.value
    }
}

#[async_trait]
impl Transport for RandomWalk {
    fn delivery(&self) -> Delivery {
        Delivery::Pull
    }

    async fn read_once(&mut self) -> Result<f64> {
        if !self.open {
            return Err(SensorError::connection(&self.sensor_id, "simulator closed"));
        }
        Ok(self.next_value())
    }

    async fn subscribe(&mut self, _tx: SampleSender) -> Result<()> {
        Err(SensorError::UnsupportedOperation(
            "simulated devices are polled".into(),
        ))
    }

    async fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn walk_stays_near_center() {
        let mut t = RandomWalk::new("ph-1", 6.0, 1.0);
        for _ in 0..1000 {
            let v = t.read_once().await.unwrap();
            // |walk| <= 0.1 and reversion 10%: bounded by ±1.0 around center
            assert!((v - 6.0).abs() <= 1.0 + 1e-9, "drifted to {v}");
        }
        t.close().await;
        assert!(t.read_once().await.is_err());
    }
}
