//! Modbus TCP / RTU: one register per read, scaled to a float.

use async_trait::async_trait;
use tokio_modbus::client::{rtu, tcp, Context, Reader};
use tokio_modbus::Slave;
use tracing::debug;

use super::{Delivery, SampleSender, Transport};
use crate::error::{Result, SensorError};
use crate::model::{ModbusPoint, RegisterKind, RegisterType};

pub struct ModbusTransport {
    sensor_id: String,
    point: ModbusPoint,
    ctx: Option<Context>,
}

impl ModbusTransport {
    pub async fn connect_tcp(sensor_id: &str, host: &str, port: u16, point: ModbusPoint) -> Result<Self> {
        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| SensorError::connection(sensor_id, format!("resolve {host}:{port}: {e}")))?
            .next()
            .ok_or_else(|| SensorError::connection(sensor_id, format!("no address for {host}")))?;

        let ctx = tcp::connect_slave(addr, Slave(point.unit_id))
            .await
            .map_err(|e| SensorError::connection(sensor_id, format!("modbus tcp {addr}: {e}")))?;
        debug!(sensor = %sensor_id, %addr, unit = point.unit_id, "modbus tcp session open");

        Ok(Self {
            sensor_id: sensor_id.to_string(),
            point,
            ctx: Some(ctx),
        })
    }

    pub fn connect_rtu(sensor_id: &str, serial_port: &str, baud_rate: u32, point: ModbusPoint) -> Result<Self> {
        let builder = tokio_serial::new(serial_port, baud_rate);
        let stream = tokio_serial::SerialStream::open(&builder)
            .map_err(|e| SensorError::connection(sensor_id, format!("open {serial_port}: {e}")))?;
        let ctx = rtu::attach_slave(stream, Slave(point.unit_id));
        debug!(sensor = %sensor_id, port = %serial_port, baud_rate, "modbus rtu session open");

        Ok(Self {
            sensor_id: sensor_id.to_string(),
            point,
            ctx: Some(ctx),
        })
    }
}

/// Scale the first register word per the point's data type.
pub(crate) fn decode(words: &[u16], point: &ModbusPoint) -> Option<f64> {
    let word = *words.first()?;
    let raw = match point.data_type {
        RegisterType::U16 => f64::from(word),
        RegisterType::I16 => f64::from(word as i16),
    };
    Some(raw * point.scale)
}

#[async_trait]
impl Transport for ModbusTransport {
    fn delivery(&self) -> Delivery {
        Delivery::Pull
    }

    async fn read_once(&mut self) -> Result<f64> {
        let id = self.sensor_id.as_str();
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| SensorError::connection(id, "session closed"))?;

        let reg = self.point.register;
        let words = match self.point.register_kind {
            RegisterKind::Holding => ctx.read_holding_registers(reg, 1).await,
            RegisterKind::Input => ctx.read_input_registers(reg, 1).await,
        }
        .map_err(|e| SensorError::read(id, format!("register {reg}: {e}")))?
        .map_err(|code| SensorError::read(id, format!("register {reg}: exception {code:?}")))?;

        decode(&words, &self.point)
            .ok_or_else(|| SensorError::parse(id, format!("register {reg}: empty response")))
    }

    async fn subscribe(&mut self, _tx: SampleSender) -> Result<()> {
        Err(SensorError::UnsupportedOperation(
            "modbus devices are polled, not subscribed".into(),
        ))
    }

    async fn close(&mut self) {
        if self.ctx.take().is_some() {
            debug!(sensor = %self.sensor_id, "modbus session closed");
        }
    }
}
