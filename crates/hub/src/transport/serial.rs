//! UART transport: newline-delimited ASCII numbers.
//!
//! Probes stream lines at their own pace, usually faster than the poll
//! interval. Each read returns the newest complete line and discards the
//! older ones, so a reading is never minutes behind its timestamp.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_serial::SerialPortBuilderExt;
use tracing::debug;

use super::{parse_payload, Delivery, SampleSender, Transport};
use crate::error::{Result, SensorError};

type LineSource = Box<dyn AsyncRead + Send + Unpin>;

/// Longest line accepted before the partial input is thrown away.
const MAX_LINE: usize = 128;

pub struct SerialTransport {
    sensor_id: String,
    reader: Option<BufReader<LineSource>>,
    /// Bytes of a line not yet terminated. Kept across reads so a read
    /// cancelled by the poll timeout loses nothing.
    partial: Vec<u8>,
}

impl SerialTransport {
    pub fn open(sensor_id: &str, port: &str, baud_rate: u32) -> Result<Self> {
        let stream = tokio_serial::new(port, baud_rate)
            .open_native_async()
            .map_err(|e| SensorError::connection(sensor_id, format!("open {port} @ {baud_rate}: {e}")))?;
        debug!(sensor = %sensor_id, %port, baud_rate, "serial port open");
        Ok(Self::from_reader(sensor_id, Box::new(stream)))
    }

    /// Wrap any byte source; the tests feed an in-memory duplex here.
    pub(crate) fn from_reader(sensor_id: &str, source: LineSource) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            reader: Some(BufReader::new(source)),
            partial: Vec::new(),
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn delivery(&self) -> Delivery {
        Delivery::Pull
    }

    async fn read_once(&mut self) -> Result<f64> {
        let id = self.sensor_id.as_str();
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| SensorError::connection(id, "port closed"))?;

        let mut latest = None;
        loop {
            take_lines(reader, &mut self.partial, &mut latest);
            if self.partial.len() > MAX_LINE {
                self.partial.clear();
                return Err(SensorError::parse(id, format!("line longer than {MAX_LINE} bytes")));
            }

            if latest.is_some() {
                // More already waiting on the port is taken without blocking.
                match tokio::time::timeout(Duration::ZERO, reader.fill_buf()).await {
                    Ok(Ok(buf)) if !buf.is_empty() => continue,
                    _ => break,
                }
            }

            let filled = reader.fill_buf().await.map_err(|e| SensorError::read(id, e))?.len();
            if filled == 0 {
                // End of stream: an unterminated last line still counts.
                if self.partial.is_empty() {
                    return Err(SensorError::read(id, "end of stream"));
                }
                latest = Some(std::mem::take(&mut self.partial));
                break;
            }
        }

        let line = latest.unwrap_or_default();
        parse_payload(&line).map_err(|reason| {
            SensorError::parse(id, format!("{reason}: {:?}", String::from_utf8_lossy(&line).trim_end()))
        })
    }

    async fn subscribe(&mut self, _tx: SampleSender) -> Result<()> {
        Err(SensorError::UnsupportedOperation(
            "serial devices are polled, not subscribed".into(),
        ))
    }

    async fn close(&mut self) {
        if self.reader.take().is_some() {
            debug!(sensor = %self.sensor_id, "serial port closed");
        }
    }
}

/// Move every complete line out of the reader's buffer without touching
/// the port. The newest one ends up in `latest`; a trailing fragment stays
/// in `partial`.
fn take_lines(reader: &mut BufReader<LineSource>, partial: &mut Vec<u8>, latest: &mut Option<Vec<u8>>) {
    loop {
        let buf = reader.buffer();
        if buf.is_empty() {
            return;
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(end) => {
                partial.extend_from_slice(&buf[..end]);
                reader.consume(end + 1);
                *latest = Some(std::mem::take(partial));
            }
            None => {
                let n = buf.len();
                partial.extend_from_slice(buf);
                reader.consume(n);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn newest_buffered_line_wins() {
        let (mut device, host) = tokio::io::duplex(256);
        device.write_all(b"20.0\n21.0\n22.0\n").await.unwrap();

        let mut t = SerialTransport::from_reader("t-1", Box::new(host));
        assert_eq!(t.read_once().await.unwrap(), 22.0);

        device.write_all(b"22.5\n").await.unwrap();
        assert_eq!(t.read_once().await.unwrap(), 22.5);
    }

    #[tokio::test]
    async fn reads_follow_the_stream() {
        let (mut device, host) = tokio::io::duplex(256);
        let mut t = SerialTransport::from_reader("ph-1", Box::new(host));

        device.write_all(b"6.02\r\n").await.unwrap();
        assert_eq!(t.read_once().await.unwrap(), 6.02);
        device.write_all(b"ERR\n").await.unwrap();
        assert!(matches!(t.read_once().await, Err(SensorError::Parse { .. })));
        device.write_all(b"5.98\n6.01").await.unwrap();
        assert_eq!(t.read_once().await.unwrap(), 5.98);

        // The unterminated tail is the last value before the port goes away.
        drop(device);
        assert_eq!(t.read_once().await.unwrap(), 6.01);
        assert!(matches!(t.read_once().await, Err(SensorError::Read { .. })));
    }

    #[tokio::test]
    async fn partial_line_survives_a_timed_out_read() {
        let (mut device, host) = tokio::io::duplex(256);
        let mut t = SerialTransport::from_reader("t-1", Box::new(host));

        device.write_all(b"23.").await.unwrap();
        let timed_out = tokio::time::timeout(Duration::from_millis(50), t.read_once()).await;
        assert!(timed_out.is_err());

        device.write_all(b"5\n").await.unwrap();
        assert_eq!(t.read_once().await.unwrap(), 23.5);
    }

    #[tokio::test]
    async fn runaway_line_is_discarded() {
        let (mut device, host) = tokio::io::duplex(1024);
        let mut t = SerialTransport::from_reader("t-1", Box::new(host));

        device.write_all(&[b'9'; MAX_LINE + 10]).await.unwrap();
        assert!(matches!(t.read_once().await, Err(SensorError::Parse { .. })));
        device.write_all(b"\n21.5\n").await.unwrap();
        // The discarded line's terminator leaves an empty line behind it.
        assert_eq!(t.read_once().await.unwrap(), 21.5);
    }

    #[tokio::test]
    async fn closed_port_is_a_connection_error() {
        let (_device, host) = tokio::io::duplex(16);
        let mut t = SerialTransport::from_reader("ph-1", Box::new(host));
        t.close().await;
        t.close().await;
        assert!(matches!(t.read_once().await, Err(SensorError::Connection { .. })));
    }

    #[test]
    fn missing_port_fails_to_open() {
        let err = SerialTransport::open("ph-1", "/dev/does-not-exist-canopy", 9600)
            .err()
            .unwrap();
        assert!(matches!(err, SensorError::Connection { .. }));
    }
}
