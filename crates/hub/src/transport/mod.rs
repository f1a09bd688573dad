//! Protocol adapters behind one read/subscribe contract.
//!
//! Pull transports (Modbus, serial, HTTP) answer `read_once` and are driven
//! by the poll loop. Push transports (MQTT) deliver samples into a channel
//! after `subscribe`. The connection manager only sees [`Transport`] and
//! [`TransportFactory`], so deployments without serial or Modbus hardware
//! can swap in [`sim::SimulatedTransports`].

pub mod http;
pub mod modbus;
pub mod mqtt;
pub mod serial;
pub mod sim;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Result, SensorError};
use crate::model::{ConnectionParams, SensorDevice};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Pull,
    Push,
}

/// Raw samples (or read failures) from a push transport.
pub type SampleSender = mpsc::Sender<Result<f64>>;

#[async_trait]
pub trait Transport: Send {
    fn delivery(&self) -> Delivery;

    /// One raw, uncalibrated value. Pull transports only.
    async fn read_once(&mut self) -> Result<f64>;

    /// Start forwarding samples to `tx`. Push transports only.
    async fn subscribe(&mut self, tx: SampleSender) -> Result<()>;

    /// Release the underlying connection. Safe to call more than once.
    async fn close(&mut self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open and verify a connection for `device`, giving up after `io_timeout`.
    async fn open(&self, device: &SensorDevice, io_timeout: Duration) -> Result<Box<dyn Transport>>;
}

/// Real protocol adapters, chosen by connection parameter type.
#[derive(Debug, Default, Clone)]
pub struct DefaultTransports;

#[async_trait]
impl TransportFactory for DefaultTransports {
    async fn open(&self, device: &SensorDevice, io_timeout: Duration) -> Result<Box<dyn Transport>> {
        let id = device.id.as_str();
        match &device.connection {
            ConnectionParams::ModbusTcp { host, port, point } => {
                with_timeout(id, io_timeout, modbus::ModbusTransport::connect_tcp(id, host, *port, point.clone()))
                    .await
                    .map(|t| Box::new(t) as Box<dyn Transport>)
            }
            ConnectionParams::ModbusRtu {
                serial_port,
                baud_rate,
                point,
            } => modbus::ModbusTransport::connect_rtu(id, serial_port, *baud_rate, point.clone())
                .map(|t| Box::new(t) as Box<dyn Transport>),
            ConnectionParams::Mqtt { .. } => {
                mqtt::MqttTransport::connect(id, &device.connection, io_timeout)
                    .await
                    .map(|t| Box::new(t) as Box<dyn Transport>)
            }
            ConnectionParams::Serial { port, baud_rate } => {
                serial::SerialTransport::open(id, port, *baud_rate)
                    .map(|t| Box::new(t) as Box<dyn Transport>)
            }
            ConnectionParams::Http { .. } => {
                http::HttpTransport::new(id, &device.parameter, &device.connection, io_timeout)
                    .map(|t| Box::new(t) as Box<dyn Transport>)
            }
        }
    }
}

async fn with_timeout<T>(
    sensor_id: &str,
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(r) => r,
        Err(_) => Err(SensorError::connection(
            sensor_id,
            format!("connect timed out after {timeout:?}"),
        )),
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

/// Parse a push/line payload: a bare numeric literal, or a JSON document
/// that is a number or an object with a numeric `value` field.
pub(crate) fn parse_payload(payload: &[u8]) -> std::result::Result<f64, String> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| "payload is not valid utf-8".to_string())?
        .trim();
    if text.is_empty() {
        return Err("empty payload".into());
    }
    if let Ok(v) = text.parse::<f64>() {
        return finite(v);
    }
    let json: Value =
        serde_json::from_str(text).map_err(|e| format!("not a number or json: {e}"))?;
    match &json {
        Value::Number(_) => number(&json).ok_or_else(|| "number out of range".into()),
        Value::Object(_) => json
            .get("value")
            .and_then(number)
            .ok_or_else(|| "json object has no numeric 'value' field".into()),
        _ => Err(format!("unsupported json payload: {json}")),
    }
}

/// Walk a dotted path (`data.value`, `sensors.0.ec`) into a JSON document.
pub(crate) fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|seg| !seg.is_empty())
        .try_fold(doc, |cur, seg| match cur {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Numeric JSON value, accepting numeric strings such as `"6.02"`.
pub(crate) fn number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn finite(v: f64) -> std::result::Result<f64, String> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err(format!("non-finite value {v}"))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_bare_number() {
        assert_eq!(parse_payload(b" 6.1\n"), Ok(6.1));
        assert_eq!(parse_payload(b"-3"), Ok(-3.0));
    }

    #[test]
    fn parse_json_value_object() {
        assert_eq!(parse_payload(br#"{"value": 842, "ts": 1700000000}"#), Ok(842.0));
        assert_eq!(parse_payload(br#"{"value": "1.8"}"#), Ok(1.8));
    }

    #[test]
    fn parse_json_number() {
        assert_eq!(parse_payload(b"1e3"), Ok(1000.0));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_payload(b"").is_err());
        assert!(parse_payload(b"ERR").is_err());
        assert!(parse_payload(br#"{"temp": 21.5}"#).is_err());
        assert!(parse_payload(b"[1,2]").is_err());
        assert!(parse_payload(b"NaN").is_err());
        assert!(parse_payload(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn lookup_path_walks_objects_and_arrays() {
        let doc = json!({"data": {"value": 3.2, "probes": [{"ec": 1.1}, {"ec": 1.4}]}});
        assert_eq!(lookup_path(&doc, "data.value"), Some(&json!(3.2)));
        assert_eq!(lookup_path(&doc, "data.probes.1.ec"), Some(&json!(1.4)));
        assert_eq!(lookup_path(&doc, "data.missing"), None);
        assert_eq!(lookup_path(&doc, "data.value.deeper"), None);
    }

    #[test]
    fn number_accepts_numeric_strings_only() {
        assert_eq!(number(&json!(" 5.5 ")), Some(5.5));
        assert_eq!(number(&json!(true)), None);
        assert_eq!(number(&json!("high")), None);
    }
}
