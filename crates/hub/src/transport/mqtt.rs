//! MQTT push transport: one broker client and one topic subscription per
//! device. Malformed payloads are logged and dropped, and both they and
//! broker errors are forwarded as failures so they count toward the
//! device's error threshold.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{parse_payload, Delivery, SampleSender, Transport};
use crate::error::{Result, SensorError};
use crate::model::ConnectionParams;

/// Pause before polling the event loop again after a broker error.
const RECONNECT_PAUSE: Duration = Duration::from_secs(2);

pub struct MqttTransport {
    sensor_id: String,
    topic: String,
    client: AsyncClient,
    eventloop: Option<EventLoop>,
    listener: Option<JoinHandle<()>>,
    closed: bool,
}

impl MqttTransport {
    /// Connect and wait for the broker to acknowledge the subscription.
    pub async fn connect(sensor_id: &str, params: &ConnectionParams, io_timeout: Duration) -> Result<Self> {
        let ConnectionParams::Mqtt {
            broker,
            port,
            topic,
            client_id,
            username,
            password,
        } = params
        else {
            return Err(SensorError::config(sensor_id, "not an mqtt connection"));
        };

        let client_id = client_id
            .clone()
            .unwrap_or_else(|| format!("canopy-hub-{sensor_id}"));
        let mut options = MqttOptions::new(client_id, broker.clone(), *port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(user) = username {
            options.set_credentials(user.clone(), password.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 20);
        client
            .subscribe(topic.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|e| SensorError::connection(sensor_id, format!("subscribe {topic}: {e}")))?;

        let acked = tokio::time::timeout(io_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::SubAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(e),
                }
            }
        })
        .await;

        match acked {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(SensorError::connection(sensor_id, format!("broker {broker}:{port}: {e}")))
            }
            Err(_) => {
                return Err(SensorError::connection(
                    sensor_id,
                    format!("no subscription ack from {broker}:{port} within {io_timeout:?}"),
                ))
            }
        }
        debug!(sensor = %sensor_id, %topic, "mqtt subscribed");

        Ok(Self {
            sensor_id: sensor_id.to_string(),
            topic: topic.clone(),
            client,
            eventloop: Some(eventloop),
            listener: None,
            closed: false,
        })
    }
}

/// Parse one published payload and hand it to the consumer. A malformed
/// payload is dropped but still forwarded as a parse failure. Returns
/// `false` once the consumer is gone.
async fn forward_payload(sensor_id: &str, topic: &str, payload: &[u8], tx: &SampleSender) -> bool {
    let sample = parse_payload(payload).map_err(|reason| {
        warn!(sensor = %sensor_id, %topic, %reason, "dropping malformed payload");
        SensorError::parse(sensor_id, reason)
    });
    tx.send(sample).await.is_ok()
}

async fn listen(
    sensor_id: String,
    topic: String,
    client: AsyncClient,
    mut eventloop: EventLoop,
    tx: SampleSender,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if !forward_payload(&sensor_id, &p.topic, &p.payload, &tx).await {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // Clean sessions drop subscriptions across reconnects.
                debug!(sensor = %sensor_id, %topic, "mqtt reconnected, resubscribing");
                if let Err(e) = client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                    warn!(sensor = %sensor_id, %topic, error = %e, "resubscribe failed");
                }
            }
            Ok(_) => {}
            Err(e) => {
                let err = SensorError::connection(&sensor_id, format!("mqtt: {e}"));
                if tx.send(Err(err)).await.is_err() {
                    break;
                }
                sleep(RECONNECT_PAUSE).await;
            }
        }
    }
    debug!(sensor = %sensor_id, "mqtt listener stopped");
}

#[async_trait]
impl Transport for MqttTransport {
    fn delivery(&self) -> Delivery {
        Delivery::Push
    }

    async fn read_once(&mut self) -> Result<f64> {
        Err(SensorError::UnsupportedOperation(
            "mqtt devices push readings; use subscribe".into(),
        ))
    }

    async fn subscribe(&mut self, tx: SampleSender) -> Result<()> {
        let eventloop = self.eventloop.take().ok_or_else(|| {
            SensorError::connection(&self.sensor_id, "already subscribed or closed")
        })?;
        self.listener = Some(tokio::spawn(listen(
            self.sensor_id.clone(),
            self.topic.clone(),
            self.client.clone(),
            eventloop,
            tx,
        )));
        Ok(())
    }

    async fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        if let Some(handle) = self.listener.take() {
            handle.abort();
        }
        self.eventloop = None;
        // Only queues the request; nothing is listening once the loop is gone.
        let _ = self.client.try_disconnect();
        debug!(sensor = %self.sensor_id, "mqtt client closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_broker_is_a_connection_error() {
        let params = ConnectionParams::Mqtt {
            broker: "127.0.0.1".into(),
            port: 1,
            topic: "sensors/co2-1/value".into(),
            client_id: None,
            username: None,
            password: None,
        };
        let err = MqttTransport::connect("co2-1", &params, Duration::from_secs(2))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SensorError::Connection { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn malformed_payloads_are_forwarded_as_parse_failures() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let topic = "sensors/co2-1/value";

        assert!(forward_payload("co2-1", topic, br#"{"value": 812}"#, &tx).await);
        assert_eq!(rx.recv().await.unwrap().unwrap(), 812.0);

        assert!(forward_payload("co2-1", topic, b"ERR", &tx).await);
        assert!(matches!(rx.recv().await.unwrap(), Err(SensorError::Parse { .. })));

        drop(rx);
        assert!(!forward_payload("co2-1", topic, b"812", &tx).await);
    }

    #[tokio::test]
    async fn wrong_params_are_rejected() {
        let params = ConnectionParams::Serial {
            port: "/dev/ttyUSB0".into(),
            baud_rate: 9600,
        };
        let err = MqttTransport::connect("x", &params, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SensorError::Configuration { .. }));
    }
}
