mod sim;

use anyhow::{bail, Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sim::{EnvironmentSim, Scenario};

/// Payload published to `sensors/<id>/value`; the hub's MQTT adapter reads
/// the `value` field.
#[derive(Debug, Serialize)]
struct ValueMsg {
    value: f64,
    ts: i64,
}

/// Parse `SENSORS`: comma-separated `id:parameter` pairs.
fn parse_sensor_list(list: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((id, parameter)) = entry.split_once(':') else {
            bail!("sensor entry {entry:?} is not id:parameter");
        };
        let (id, parameter) = (id.trim(), parameter.trim());
        if id.is_empty() || parameter.is_empty() {
            bail!("sensor entry {entry:?} has an empty id or parameter");
        }
        if out.iter().any(|(existing, _)| existing == id) {
            bail!("sensor id {id:?} listed twice");
        }
        out.push((id.to_string(), parameter.to_string()));
    }
    if out.is_empty() {
        bail!("no sensors configured");
    }
    Ok(out)
}

fn topic_for(sensor_id: &str) -> String {
    format!("sensors/{sensor_id}/value")
}

/// Two decimals is finer than any of the simulated probes resolve.
fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let node_id = env::var("NODE_ID").unwrap_or_else(|_| "node-a".to_string());
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30);
    let diurnal_period_s: f64 = env::var("DIURNAL_PERIOD_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(86_400.0);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let sensors_env = env::var("SENSORS")
        .unwrap_or_else(|_| "t-1:temperature,rh-1:humidity,co2-1:co2,par-1:ppfd".to_string());

    let sensors = parse_sensor_list(&sensors_env).context("invalid SENSORS")?;
    let parameters: Vec<&str> = sensors.iter().map(|(_, p)| p.as_str()).collect();
    let mut sim = EnvironmentSim::new(scenario, &parameters, diurnal_period_s)?;

    let mut mqttoptions = MqttOptions::new(format!("canopy-node-{node_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);

    // Publish-only, but the eventloop still has to run to keep the
    // connection alive.
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("node connected to mqtt"),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt error, retrying");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    info!(
        node = %node_id,
        %scenario,
        channels = sim.channel_count(),
        every_s = sample_every_s,
        "publishing simulated readings"
    );

    loop {
        let now = OffsetDateTime::now_utc();
        let t = now.unix_timestamp() as f64;
        for (i, (id, parameter)) in sensors.iter().enumerate() {
            let msg = ValueMsg {
                value: round2(sim.sample_at(i, t)),
                ts: now.unix_timestamp(),
            };
            let payload = serde_json::to_vec(&msg)?;
            match client.publish(topic_for(id), QoS::AtLeastOnce, false, payload).await {
                Ok(()) => info!(sensor = %id, %parameter, value = msg.value, "published"),
                Err(e) => warn!(sensor = %id, error = %e, "publish failed"),
            }
        }
        tokio::select! {
            _ = sleep(Duration::from_secs(sample_every_s)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, disconnecting");
                if let Err(e) = client.disconnect().await {
                    warn!(error = %e, "mqtt disconnect failed");
                }
                return Ok(());
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_msg_serializes_to_hub_payload() {
        let msg = ValueMsg {
            value: 23.41,
            ts: 1_700_000_000,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["value"], 23.41);
        assert_eq!(json["ts"], 1_700_000_000);
        // Should have exactly these two fields, no extras
        assert_eq!(json.as_object().unwrap().len(), 2);
    }

    #[test]
    fn sensor_list_parses_pairs() {
        let sensors = parse_sensor_list(" t-1:temperature , rh-1:humidity,").unwrap();
        assert_eq!(
            sensors,
            vec![
                ("t-1".to_string(), "temperature".to_string()),
                ("rh-1".to_string(), "humidity".to_string()),
            ]
        );
    }

    #[test]
    fn sensor_list_rejects_bad_entries() {
        assert!(parse_sensor_list("").is_err());
        assert!(parse_sensor_list("t-1").is_err());
        assert!(parse_sensor_list("t-1:").is_err());
        let err = parse_sensor_list("t-1:temperature,t-1:humidity").unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn topic_matches_hub_convention() {
        assert_eq!(topic_for("co2-1"), "sensors/co2-1/value");
    }

    #[test]
    fn round2_keeps_two_decimals() {
        assert_eq!(round2(23.4567), 23.46);
        assert_eq!(round2(-0.004), -0.0);
    }
}
