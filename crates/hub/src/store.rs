//! Persistence for readings, alerts and calibration records.
//!
//! The engine only talks to [`ReadingStore`]. [`SqliteStore`] is the
//! production backend; [`MemoryStore`] backs tests and `DB_URL=memory`.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::model::{CalibrationRecord, SensorAlert, SensorReading};

#[async_trait]
pub trait ReadingStore: Send + Sync {
    async fn save_reading(&self, reading: &SensorReading) -> Result<()>;

    /// Insert or replace by alert id.
    async fn save_alert(&self, alert: &SensorAlert) -> Result<()>;

    async fn save_calibration(&self, record: &CalibrationRecord) -> Result<()>;

    /// Readings for `sensor_id` with `start <= timestamp <= end`, oldest first.
    async fn readings_between(
        &self,
        sensor_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<SensorReading>>;

    async fn calibrations_for(&self, sensor_id: &str) -> Result<Vec<CalibrationRecord>>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Readings kept per sensor by [`MemoryStore::new`]; the oldest go first.
pub const MEMORY_READINGS_PER_SENSOR: usize = 10_000;

pub struct MemoryStore {
    readings: RwLock<HashMap<String, VecDeque<SensorReading>>>,
    per_sensor: usize,
    alerts: RwLock<HashMap<String, SensorAlert>>,
    calibrations: RwLock<Vec<CalibrationRecord>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_limit(MEMORY_READINGS_PER_SENSOR)
    }

    pub fn with_limit(per_sensor: usize) -> Self {
        Self {
            readings: RwLock::new(HashMap::new()),
            per_sensor: per_sensor.max(1),
            alerts: RwLock::new(HashMap::new()),
            calibrations: RwLock::new(Vec::new()),
        }
    }

    pub async fn alert(&self, id: &str) -> Option<SensorAlert> {
        self.alerts.read().await.get(id).cloned()
    }

    pub async fn reading_count(&self) -> usize {
        self.readings.read().await.values().map(VecDeque::len).sum()
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn save_reading(&self, reading: &SensorReading) -> Result<()> {
        let mut readings = self.readings.write().await;
        let kept = readings.entry(reading.sensor_id.clone()).or_default();
        if kept.len() >= self.per_sensor {
            kept.pop_front();
        }
        kept.push_back(reading.clone());
        Ok(())
    }

    async fn save_alert(&self, alert: &SensorAlert) -> Result<()> {
        self.alerts
            .write()
            .await
            .insert(alert.id.clone(), alert.clone());
        Ok(())
    }

    async fn save_calibration(&self, record: &CalibrationRecord) -> Result<()> {
        self.calibrations.write().await.push(record.clone());
        Ok(())
    }

    async fn readings_between(
        &self,
        sensor_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<SensorReading>> {
        let mut out: Vec<SensorReading> = self
            .readings
            .read()
            .await
            .get(sensor_id)
            .into_iter()
            .flatten()
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.timestamp);
        Ok(out)
    }

    async fn calibrations_for(&self, sensor_id: &str) -> Result<Vec<CalibrationRecord>> {
        Ok(self
            .calibrations
            .read()
            .await
            .iter()
            .filter(|c| c.sensor_id == sensor_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// db_url examples:
    /// - "sqlite:/var/lib/canopy/canopy.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let in_memory = db_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?;
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to ":memory:" is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn open_alerts(&self) -> Result<Vec<SensorAlert>> {
        let rows = sqlx::query(
            "SELECT body_json FROM alerts WHERE status != 'resolved' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .context("open_alerts failed")?;

        rows.iter()
            .map(|r| -> Result<SensorAlert> { from_json(&r.try_get::<String, _>("body_json")?) })
            .collect()
    }
}

#[async_trait]
impl ReadingStore for SqliteStore {
    async fn save_reading(&self, reading: &SensorReading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO readings (sensor_id, ts, quality, raw_value, values_json)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&reading.sensor_id)
        .bind(unix_millis(reading.timestamp))
        .bind(label(&reading.quality)?)
        .bind(reading.raw_value)
        .bind(serde_json::to_string(&reading.values)?)
        .execute(&self.pool)
        .await
        .context("save_reading failed")?;
        Ok(())
    }

    async fn save_alert(&self, alert: &SensorAlert) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alerts (alert_id, sensor_id, alert_type, severity, status, created_at, body_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(alert_id) DO UPDATE SET
              status=excluded.status,
              body_json=excluded.body_json
            "#,
        )
        .bind(&alert.id)
        .bind(&alert.sensor_id)
        .bind(label(&alert.alert_type)?)
        .bind(label(&alert.severity)?)
        .bind(label(&alert.status)?)
        .bind(unix_millis(alert.created_at))
        .bind(serde_json::to_string(alert)?)
        .execute(&self.pool)
        .await
        .context("save_alert failed")?;
        Ok(())
    }

    async fn save_calibration(&self, record: &CalibrationRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO calibrations (
              sensor_id, created_at, fitted_offset, fitted_slope,
              accuracy_percent, r2, passed, measurements_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.sensor_id)
        .bind(unix_millis(record.created_at))
        .bind(record.fitted_offset)
        .bind(record.fitted_slope)
        .bind(record.validation.accuracy_percent)
        .bind(record.validation.r2)
        .bind(record.validation.passed)
        .bind(serde_json::to_string(&record.reference_measurements)?)
        .execute(&self.pool)
        .await
        .context("save_calibration failed")?;
        Ok(())
    }

    async fn readings_between(
        &self,
        sensor_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<SensorReading>> {
        let rows = sqlx::query(
            r#"
            SELECT sensor_id, ts, quality, raw_value, values_json
            FROM readings
            WHERE sensor_id = ? AND ts >= ? AND ts <= ?
            ORDER BY ts
            "#,
        )
        .bind(sensor_id)
        .bind(unix_millis(start))
        .bind(unix_millis(end))
        .fetch_all(&self.pool)
        .await
        .context("readings_between failed")?;

        rows.iter().map(reading_from_row).collect()
    }

    async fn calibrations_for(&self, sensor_id: &str) -> Result<Vec<CalibrationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT sensor_id, created_at, fitted_offset, fitted_slope,
                   accuracy_percent, r2, passed, measurements_json
            FROM calibrations
            WHERE sensor_id = ?
            ORDER BY created_at
            "#,
        )
        .bind(sensor_id)
        .fetch_all(&self.pool)
        .await
        .context("calibrations_for failed")?;

        rows.iter()
            .map(|r| -> Result<CalibrationRecord> {
                Ok(CalibrationRecord {
                    sensor_id: r.try_get("sensor_id")?,
                    reference_measurements: from_json(&r.try_get::<String, _>("measurements_json")?)?,
                    fitted_offset: r.try_get("fitted_offset")?,
                    fitted_slope: r.try_get("fitted_slope")?,
                    validation: crate::model::CalibrationValidation {
                        accuracy_percent: r.try_get("accuracy_percent")?,
                        r2: r.try_get("r2")?,
                        passed: r.try_get("passed")?,
                    },
                    created_at: from_unix_millis(r.try_get("created_at")?)?,
                })
            })
            .collect()
    }
}

fn reading_from_row(r: &SqliteRow) -> Result<SensorReading> {
    Ok(SensorReading {
        sensor_id: r.try_get("sensor_id")?,
        timestamp: from_unix_millis(r.try_get("ts")?)?,
        values: from_json(&r.try_get::<String, _>("values_json")?)?,
        quality: from_label(&r.try_get::<String, _>("quality")?)?,
        raw_value: r.try_get("raw_value")?,
    })
}

fn unix_millis(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_unix_millis(ms: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .with_context(|| format!("timestamp out of range: {ms}"))
}

/// Serde name of a unit enum variant, e.g. `ReadingQuality::Good` → "good".
fn label<T: Serialize>(v: &T) -> Result<String> {
    match serde_json::to_value(v)? {
        serde_json::Value::String(s) => Ok(s),
        other => anyhow::bail!("expected a string label, got {other}"),
    }
}

fn from_label<T: DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .with_context(|| format!("unrecognized label: {s}"))
}

fn from_json<T: DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).context("corrupt json column")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AlertStatus, AlertType, CalibrationValidation, ReadingQuality, ReferenceMeasurement,
        Severity,
    };
    use std::collections::BTreeMap;
    use time::Duration;

    async fn sqlite() -> SqliteStore {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn reading(id: &str, at: OffsetDateTime, v: f64) -> SensorReading {
        SensorReading {
            sensor_id: id.into(),
            timestamp: at,
            values: BTreeMap::from([("ec".to_string(), v)]),
            quality: ReadingQuality::Questionable,
            raw_value: Some(v - 0.1),
        }
    }

    // Millisecond precision is what the sqlite backend keeps.
    fn now_ms() -> OffsetDateTime {
        from_unix_millis(unix_millis(OffsetDateTime::now_utc())).unwrap()
    }

    #[tokio::test]
    async fn sqlite_readings_are_filtered_by_sensor_and_window() {
        let store = sqlite().await;
        let t0 = now_ms();
        for i in 0..5 {
            store
                .save_reading(&reading("ec-1", t0 + Duration::minutes(i), 1.0 + i as f64))
                .await
                .unwrap();
        }
        store.save_reading(&reading("ec-2", t0, 9.0)).await.unwrap();

        let got = store
            .readings_between("ec-1", t0 + Duration::minutes(1), t0 + Duration::minutes(3))
            .await
            .unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0], reading("ec-1", t0 + Duration::minutes(1), 2.0));
        assert_eq!(got[2].values["ec"], 4.0);
    }

    #[tokio::test]
    async fn sqlite_alert_upsert_tracks_status() {
        let store = sqlite().await;
        let mut alert = SensorAlert::new("ph-1", AlertType::OutOfRange, Severity::High, "ph high");
        store.save_alert(&alert).await.unwrap();
        assert_eq!(store.open_alerts().await.unwrap().len(), 1);

        alert.status = AlertStatus::Resolved;
        store.save_alert(&alert).await.unwrap();
        assert!(store.open_alerts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sqlite_calibration_records_load_back() {
        let store = sqlite().await;
        let at = now_ms();
        let record = CalibrationRecord {
            sensor_id: "ec-1".into(),
            reference_measurements: vec![ReferenceMeasurement {
                reference: 1.41,
                measured: 1.38,
                timestamp: at,
            }],
            fitted_offset: 0.02,
            fitted_slope: 1.01,
            validation: CalibrationValidation {
                accuracy_percent: 99.1,
                r2: 0.998,
                passed: true,
            },
            created_at: at,
        };
        store.save_calibration(&record).await.unwrap();
        assert_eq!(store.calibrations_for("ec-1").await.unwrap(), vec![record]);
        assert!(store.calibrations_for("ec-9").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_orders_by_timestamp() {
        let store = MemoryStore::new();
        let t0 = OffsetDateTime::now_utc();
        store
            .save_reading(&reading("a", t0 + Duration::seconds(10), 2.0))
            .await
            .unwrap();
        store.save_reading(&reading("a", t0, 1.0)).await.unwrap();
        let got = store
            .readings_between("a", t0, t0 + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(got.iter().map(|r| r.values["ec"]).collect::<Vec<_>>(), vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn memory_store_drops_oldest_readings_per_sensor() {
        let store = MemoryStore::with_limit(3);
        let t0 = OffsetDateTime::now_utc();
        for i in 0..5 {
            store
                .save_reading(&reading("a", t0 + Duration::seconds(i), i as f64))
                .await
                .unwrap();
        }
        store.save_reading(&reading("b", t0, 9.0)).await.unwrap();

        assert_eq!(store.reading_count().await, 4);
        let got = store
            .readings_between("a", t0, t0 + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(got.iter().map(|r| r.values["ec"]).collect::<Vec<_>>(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn labels_use_serde_names() {
        assert_eq!(label(&ReadingQuality::Good).unwrap(), "good");
        assert_eq!(label(&AlertType::SensorError).unwrap(), "sensor_error");
        let q: ReadingQuality = from_label("bad").unwrap();
        assert_eq!(q, ReadingQuality::Bad);
    }
}
