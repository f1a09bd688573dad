//! Connection manager: device registry, per-device connections and the
//! reading pipeline that turns raw samples into stored, evaluated readings.
//!
//! Each registered device owns a slot behind its own async mutex, so a
//! device that is slow to open or read never blocks another one. Shared
//! caches (latest readings, alerts, groups, history) sit behind short-lived
//! `parking_lot` locks that are never held across an `.await`.
//!
//! ```text
//! transport ──sample──▶ handle_sample
//!                        ├─ ok:  calibrate → derive → quality → cache → store → thresholds
//!                        └─ err: error_count += 1 ── at threshold ──▶ disconnect + alert + retry
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregation::{self, AggregatedReading};
use crate::analytics::{self, AnalyticsReport, DeviceHistory};
use crate::calibration;
use crate::config::EngineConfig;
use crate::derived::{self, ClimateInputs};
use crate::error::{Result, SensorError};
use crate::model::{
    AlertStatus, CalibrationRecord, DeviceRegistration, ReadingQuality, ReferenceMeasurement,
    SensorAlert, SensorDevice, SensorGroup, SensorReading, SensorStatus,
};
use crate::quality::{self, PriorValue};
use crate::scheduler::{self, SharedTransport, PUSH_BUFFER};
use crate::state::{EngineEvent, EventKind, EventLog};
use crate::store::ReadingStore;
use crate::thresholds::{self, ThresholdTable};
use crate::transport::{Delivery, Transport, TransportFactory};

/// Resolved alerts kept in memory before the oldest are dropped.
const MAX_RESOLVED_ALERTS: usize = 500;

// ---------------------------------------------------------------------------
// Per-device slot
// ---------------------------------------------------------------------------

struct Link {
    generation: u64,
    transport: SharedTransport,
    task: JoinHandle<()>,
}

struct DeviceSlot {
    device: SensorDevice,
    link: Option<Link>,
    reconnect_attempts: u32,
    reconnect_pending: bool,
    last_error: Option<String>,
    prior: Option<PriorValue>,
}

impl DeviceSlot {
    fn new(device: SensorDevice) -> Self {
        Self {
            device,
            link: None,
            reconnect_attempts: 0,
            reconnect_pending: false,
            last_error: None,
            prior: None,
        }
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            device: self.device.clone(),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_pending: self.reconnect_pending,
            last_error: self.last_error.clone(),
        }
    }
}

/// A device plus the connection bookkeeping callers care about.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    #[serde(flatten)]
    pub device: SensorDevice,
    pub reconnect_attempts: u32,
    pub reconnect_pending: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub uptime_secs: u64,
    pub devices: usize,
    pub by_status: BTreeMap<String, usize>,
    pub groups: usize,
    pub open_alerts: usize,
    pub events: Vec<EngineEvent>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct ConnectionManager {
    settings: EngineConfig,
    thresholds: ThresholdTable,
    transports: Arc<dyn TransportFactory>,
    store: Arc<dyn ReadingStore>,
    devices: AsyncRwLock<HashMap<String, Arc<AsyncMutex<DeviceSlot>>>>,
    groups: RwLock<BTreeMap<String, SensorGroup>>,
    latest: RwLock<BTreeMap<String, SensorReading>>,
    alerts: Mutex<Vec<SensorAlert>>,
    history: Mutex<HashMap<String, DeviceHistory>>,
    retries: Mutex<HashMap<String, JoinHandle<()>>>,
    events: Mutex<EventLog>,
    generation: AtomicU64,
    shutting_down: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        settings: EngineConfig,
        thresholds: ThresholdTable,
        transports: Arc<dyn TransportFactory>,
        store: Arc<dyn ReadingStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            thresholds,
            transports,
            store,
            devices: AsyncRwLock::new(HashMap::new()),
            groups: RwLock::new(BTreeMap::new()),
            latest: RwLock::new(BTreeMap::new()),
            alerts: Mutex::new(Vec::new()),
            history: Mutex::new(HashMap::new()),
            retries: Mutex::new(HashMap::new()),
            events: Mutex::new(EventLog::new()),
            generation: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &EngineConfig {
        &self.settings
    }

    async fn slot(&self, sensor_id: &str) -> Result<Arc<AsyncMutex<DeviceSlot>>> {
        self.devices
            .read()
            .await
            .get(sensor_id)
            .cloned()
            .ok_or_else(|| SensorError::UnknownSensor(sensor_id.to_string()))
    }

    fn set_status(&self, slot: &mut DeviceSlot, status: SensorStatus) {
        let from = slot.device.status;
        if from == status {
            return;
        }
        slot.device.status = status;
        let id = slot.device.id.as_str();
        self.history
            .lock()
            .entry(id.to_string())
            .or_default()
            .record_status(OffsetDateTime::now_utc(), status);
        self.events
            .lock()
            .record(EventKind::Connection, Some(id), format!("{from} -> {status}"));
        debug!(sensor = %id, %from, to = %status, "status changed");
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    /// Validate and add a device. It starts disconnected; call [`connect`]
    /// to start reading.
    ///
    /// [`connect`]: Self::connect
    pub async fn register(&self, registration: DeviceRegistration) -> Result<SensorDevice> {
        let problems = registration.problems();
        if !problems.is_empty() {
            return Err(SensorError::config(&registration.id, problems.join("; ")));
        }
        let device = registration.into_device();
        let id = device.id.clone();

        {
            let mut devices = self.devices.write().await;
            if devices.contains_key(&id) {
                return Err(SensorError::DuplicateSensor(id));
            }
            devices.insert(id.clone(), Arc::new(AsyncMutex::new(DeviceSlot::new(device.clone()))));
        }

        self.history
            .lock()
            .entry(id.clone())
            .or_default()
            .record_status(OffsetDateTime::now_utc(), SensorStatus::Disconnected);
        self.events.lock().record(
            EventKind::Connection,
            Some(&id),
            format!("registered ({} via {})", device.parameter, device.protocol),
        );
        info!(
            sensor = %id,
            protocol = %device.protocol,
            parameter = %device.parameter,
            interval_secs = device.polling_interval_secs,
            "sensor registered"
        );
        Ok(device)
    }

    /// Remove a device. Refused while any group still lists it.
    pub async fn deregister(&self, sensor_id: &str) -> Result<()> {
        let slot = {
            let mut devices = self.devices.write().await;
            let referencing: Vec<String> = self
                .groups
                .read()
                .values()
                .filter(|g| g.member_sensor_ids.iter().any(|m| m == sensor_id))
                .map(|g| g.id.clone())
                .collect();
            if !referencing.is_empty() {
                return Err(SensorError::SensorInUse {
                    sensor_id: sensor_id.to_string(),
                    groups: referencing,
                });
            }
            devices
                .remove(sensor_id)
                .ok_or_else(|| SensorError::UnknownSensor(sensor_id.to_string()))?
        };

        self.cancel_retry(sensor_id);
        let link = {
            let mut s = slot.lock().await;
            s.reconnect_pending = false;
            self.set_status(&mut s, SensorStatus::Disconnected);
            s.link.take()
        };
        if let Some(link) = link {
            close_link(link).await;
        }

        self.latest.write().remove(sensor_id);
        self.history.lock().remove(sensor_id);
        self.events
            .lock()
            .record(EventKind::Connection, Some(sensor_id), "deregistered");
        info!(sensor = %sensor_id, "sensor deregistered");
        Ok(())
    }

    pub async fn device(&self, sensor_id: &str) -> Result<DeviceSnapshot> {
        let slot = self.slot(sensor_id).await?;
        let s = slot.lock().await;
        Ok(s.snapshot())
    }

    /// All devices, ordered by id.
    pub async fn devices(&self) -> Vec<DeviceSnapshot> {
        let slots: Vec<_> = self.devices.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.lock().await.snapshot());
        }
        out.sort_by(|a, b| a.device.id.cmp(&b.device.id));
        out
    }

    pub async fn status(&self, sensor_id: &str) -> Result<SensorStatus> {
        let slot = self.slot(sensor_id).await?;
        let status = slot.lock().await.device.status;
        Ok(status)
    }

    pub fn latest_reading(&self, sensor_id: &str) -> Option<SensorReading> {
        self.latest.read().get(sensor_id).cloned()
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Open the device's transport and start its poller or subscription.
    ///
    /// Returns `Ok` immediately if the device is already connected or a
    /// connect is in flight. On failure the device goes to `error`, a
    /// retry is scheduled after `retry_delay_secs`, and the error is
    /// returned.
    pub async fn connect(self: &Arc<Self>, sensor_id: &str) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SensorError::UnsupportedOperation("engine is shutting down".into()));
        }
        let slot = self.slot(sensor_id).await?;

        let device = {
            let mut s = slot.lock().await;
            if s.link.is_some() || s.device.status == SensorStatus::Connecting {
                return Ok(());
            }
            s.reconnect_pending = false;
            self.set_status(&mut s, SensorStatus::Connecting);
            s.device.clone()
        };
        self.cancel_retry(sensor_id);

        let io_timeout = self.settings.io_timeout();
        // Factories bound their own network waits; this only catches one
        // that forgets to.
        let opened = match tokio::time::timeout(io_timeout * 2, self.transports.open(&device, io_timeout)).await {
            Ok(result) => result,
            Err(_) => Err(SensorError::connection(
                sensor_id,
                format!("open did not complete within {:?}", io_timeout * 2),
            )),
        };

        let mut s = slot.lock().await;
        if s.device.status != SensorStatus::Connecting {
            // Disconnected or deregistered while the transport was opening.
            drop(s);
            if let Ok(mut transport) = opened {
                transport.close().await;
            }
            return Ok(());
        }

        let started = match opened {
            Ok(transport) => self.start_link(&device, transport).await,
            Err(e) => Err(e),
        };

        match started {
            Ok(link) => {
                s.link = Some(link);
                s.device.error_count = 0;
                s.reconnect_attempts = 0;
                s.last_error = None;
                self.set_status(&mut s, SensorStatus::Connected);
                info!(sensor = %sensor_id, protocol = %device.protocol, "sensor connected");
                Ok(())
            }
            Err(e) => {
                s.last_error = Some(e.to_string());
                self.set_status(&mut s, SensorStatus::Error);
                self.events
                    .lock()
                    .record(EventKind::Error, Some(sensor_id), e.to_string());
                warn!(sensor = %sensor_id, error = %e, "connect failed");
                self.schedule_reconnect(&mut s);
                Err(e)
            }
        }
    }

    /// [`connect`](Self::connect) on its own task. Slow or unreachable
    /// devices then never hold up the caller; failures are retried as usual.
    pub fn connect_in_background(self: &Arc<Self>, sensor_id: &str) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let id = sensor_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.connect(&id).await {
                warn!(sensor = %id, error = %e, "background connect failed");
            }
        })
    }

    /// Spawn the scheduling unit for a freshly opened transport. Called with
    /// the device slot locked, so the first sample waits until the link is
    /// installed.
    async fn start_link(self: &Arc<Self>, device: &SensorDevice, mut transport: Box<dyn Transport>) -> Result<Link> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        match transport.delivery() {
            Delivery::Pull => {
                let transport: SharedTransport = Arc::new(AsyncMutex::new(transport));
                let task = scheduler::spawn_poller(
                    Arc::clone(self),
                    device.id.clone(),
                    generation,
                    Arc::clone(&transport),
                    Duration::from_secs(device.polling_interval_secs),
                    self.settings.io_timeout(),
                );
                Ok(Link {
                    generation,
                    transport,
                    task,
                })
            }
            Delivery::Push => {
                let (tx, rx) = mpsc::channel(PUSH_BUFFER);
                if let Err(e) = transport.subscribe(tx).await {
                    transport.close().await;
                    return Err(e);
                }
                let task = scheduler::spawn_push_consumer(Arc::clone(self), device.id.clone(), generation, rx);
                Ok(Link {
                    generation,
                    transport: Arc::new(AsyncMutex::new(transport)),
                    task,
                })
            }
        }
    }

    /// Stop reading and close the transport. Cancels any pending retry.
    pub async fn disconnect(&self, sensor_id: &str) -> Result<()> {
        let slot = self.slot(sensor_id).await?;
        self.cancel_retry(sensor_id);
        let link = {
            let mut s = slot.lock().await;
            s.reconnect_pending = false;
            self.set_status(&mut s, SensorStatus::Disconnected);
            s.link.take()
        };
        if let Some(link) = link {
            close_link(link).await;
            info!(sensor = %sensor_id, "sensor disconnected");
        }
        Ok(())
    }

    fn schedule_reconnect(self: &Arc<Self>, slot: &mut DeviceSlot) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        slot.reconnect_attempts += 1;
        slot.reconnect_pending = true;

        let id = slot.device.id.clone();
        let delay = self.settings.retry_delay();
        info!(
            sensor = %id,
            attempt = slot.reconnect_attempts,
            delay_secs = delay.as_secs(),
            "reconnect scheduled"
        );

        let this = Arc::clone(self);
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.retries.lock().remove(&task_id);
            if let Err(e) = this.connect(&task_id).await {
                debug!(sensor = %task_id, error = %e, "reconnect attempt failed");
            }
        });
        if let Some(old) = self.retries.lock().insert(id, handle) {
            old.abort();
        }
    }

    fn cancel_retry(&self, sensor_id: &str) {
        if let Some(handle) = self.retries.lock().remove(sensor_id) {
            handle.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Reading pipeline
    // -----------------------------------------------------------------------

    /// Feed one sample from a device's scheduling unit. Returns `false` when
    /// the unit should stop: the device was disconnected, replaced by a
    /// newer connection, or just hit the error threshold.
    pub async fn handle_sample(self: &Arc<Self>, sensor_id: &str, generation: u64, sample: Result<f64>) -> bool {
        let Ok(slot) = self.slot(sensor_id).await else {
            return false;
        };
        let mut s = slot.lock().await;
        if s.link.as_ref().map(|l| l.generation) != Some(generation) {
            return false;
        }
        let now = OffsetDateTime::now_utc();

        match sample {
            Ok(raw) => {
                self.record_attempt(sensor_id, now, true);
                s.device.error_count = 0;
                s.last_error = None;
                s.device.last_reading_at = Some(now);

                let reading = self.build_reading(&mut s, raw, now);
                let mut alerts = self.thresholds.evaluate(&s.device, &reading);
                if calibration::is_due(&s.device.calibration, now) {
                    alerts.push(thresholds::maintenance_due_alert(&s.device));
                }
                // Cached while the slot is held: deregister clears the cache
                // only after taking the slot, so it cannot be repopulated.
                self.latest.write().insert(sensor_id.to_string(), reading.clone());
                self.events.lock().record(
                    EventKind::Reading,
                    Some(sensor_id),
                    format_values(&reading),
                );
                drop(s);

                debug!(
                    sensor = %sensor_id,
                    raw,
                    quality = ?reading.quality,
                    values = ?reading.values,
                    "reading"
                );
                if let Err(e) = self.store.save_reading(&reading).await {
                    warn!(sensor = %sensor_id, error = %format!("{e:#}"), "failed to store reading");
                }
                for alert in alerts {
                    self.raise(alert).await;
                }
                true
            }
            Err(e) if !e.is_read_failure() => {
                warn!(sensor = %sensor_id, error = %e, "transport returned a non-read error, not counted");
                true
            }
            Err(e) => {
                self.record_attempt(sensor_id, now, false);
                s.device.error_count += 1;
                s.last_error = Some(e.to_string());
                let count = s.device.error_count;
                warn!(sensor = %sensor_id, error = %e, consecutive = count, "read failed");

                if count < self.settings.error_threshold {
                    return true;
                }

                warn!(
                    sensor = %sensor_id,
                    threshold = self.settings.error_threshold,
                    "error threshold reached, disconnecting"
                );
                self.events.lock().record(
                    EventKind::Error,
                    Some(sensor_id),
                    format!("{count} consecutive failures: {e}"),
                );
                let link = s.link.take();
                self.set_status(&mut s, SensorStatus::Disconnected);
                self.schedule_reconnect(&mut s);
                drop(s);

                // This task is the link's own task, so it is left to exit
                // on the `false` below instead of being aborted.
                if let Some(link) = link {
                    link.transport.lock().await.close().await;
                }
                self.raise(thresholds::sensor_error_alert(sensor_id, count, &e.to_string()))
                    .await;
                false
            }
        }
    }

    fn record_attempt(&self, sensor_id: &str, at: OffsetDateTime, ok: bool) {
        self.history
            .lock()
            .entry(sensor_id.to_string())
            .or_default()
            .record_attempt(at, ok);
    }

    fn build_reading(&self, slot: &mut DeviceSlot, raw: f64, now: OffsetDateTime) -> SensorReading {
        let parameter = slot.device.parameter.clone();
        let value = calibration::apply(raw, &slot.device.calibration);
        let quality = quality::assess(&parameter, value, now, slot.prior);
        if quality != ReadingQuality::Bad {
            slot.prior = Some(PriorValue { value, at: now });
        }

        let mut values = BTreeMap::from([(parameter, value)]);
        if quality != ReadingQuality::Bad {
            if let Some(inputs) = self.climate_inputs(&slot.device, value, now) {
                derived::merge_into(&mut values, &derived::compute(inputs));
            }
        }

        SensorReading {
            sensor_id: slot.device.id.clone(),
            timestamp: now,
            values,
            quality,
            raw_value: Some(raw),
        }
    }

    /// Climate inputs for a temperature device that names a humidity
    /// source. Source readings must be fresh and not bad quality.
    fn climate_inputs(&self, device: &SensorDevice, air_temp: f64, now: OffsetDateTime) -> Option<ClimateInputs> {
        if device.parameter != "temperature" {
            return None;
        }
        let derive = device.derive.as_ref()?;
        let freshness = self.settings.default_freshness();
        let latest = self.latest.read();
        let fresh = |id: &String| {
            latest
                .get(id)
                .filter(|r| r.quality != ReadingQuality::Bad && now - r.timestamp <= freshness)
        };

        let relative_humidity = derive
            .humidity_from
            .as_ref()
            .and_then(fresh)
            .and_then(|r| r.values.get("humidity").copied())?;
        let leaf_temp = derive.leaf_temperature_from.as_ref().and_then(fresh).and_then(|r| {
            r.values
                .get("leaf_temperature")
                .or_else(|| r.values.get("temperature"))
                .copied()
        });

        Some(ClimateInputs {
            air_temp,
            relative_humidity,
            leaf_temp,
        })
    }

    // -----------------------------------------------------------------------
    // Alerts
    // -----------------------------------------------------------------------

    /// Record an alert unless an unresolved one with the same key exists.
    async fn raise(&self, alert: SensorAlert) -> Option<SensorAlert> {
        {
            let mut alerts = self.alerts.lock();
            let key = alert.dedup_key();
            if alerts.iter().any(|a| a.is_open() && a.dedup_key() == key) {
                return None;
            }
            alerts.push(alert.clone());
            prune_resolved(&mut alerts);
        }

        warn!(
            sensor = %alert.sensor_id,
            alert = %alert.id,
            kind = ?alert.alert_type,
            severity = ?alert.severity,
            "{}",
            alert.message
        );
        self.events
            .lock()
            .record(EventKind::Alert, Some(&alert.sensor_id), alert.message.clone());
        if let Err(e) = self.store.save_alert(&alert).await {
            warn!(alert = %alert.id, error = %format!("{e:#}"), "failed to store alert");
        }
        Some(alert)
    }

    /// Seed the alert list with alerts still open from a previous run so
    /// they keep deduplicating new ones. Resolved alerts are ignored.
    pub fn restore_alerts(&self, restored: Vec<SensorAlert>) -> usize {
        let mut alerts = self.alerts.lock();
        let before = alerts.len();
        for alert in restored.into_iter().filter(SensorAlert::is_open) {
            if !alerts.iter().any(|a| a.id == alert.id) {
                alerts.push(alert);
            }
        }
        let added = alerts.len() - before;
        drop(alerts);
        if added > 0 {
            info!(count = added, "open alerts restored");
        }
        added
    }

    /// Alerts newest first, optionally for one sensor. Resolved alerts are
    /// left out unless asked for.
    pub fn alerts(&self, sensor_id: Option<&str>, include_resolved: bool) -> Vec<SensorAlert> {
        let alerts = self.alerts.lock();
        alerts
            .iter()
            .rev()
            .filter(|a| sensor_id.map_or(true, |id| a.sensor_id == id))
            .filter(|a| include_resolved || a.is_open())
            .cloned()
            .collect()
    }

    pub async fn acknowledge(&self, alert_id: &str) -> Result<SensorAlert> {
        self.transition_alert(alert_id, AlertStatus::Acknowledged).await
    }

    pub async fn resolve(&self, alert_id: &str) -> Result<SensorAlert> {
        self.transition_alert(alert_id, AlertStatus::Resolved).await
    }

    async fn transition_alert(&self, alert_id: &str, to: AlertStatus) -> Result<SensorAlert> {
        let updated = {
            let mut alerts = self.alerts.lock();
            let alert = alerts
                .iter_mut()
                .find(|a| a.id == alert_id)
                .ok_or_else(|| SensorError::UnknownAlert(alert_id.to_string()))?;
            if alert.status == AlertStatus::Resolved && to != AlertStatus::Resolved {
                return Err(SensorError::UnsupportedOperation(format!(
                    "alert '{alert_id}' is already resolved"
                )));
            }
            alert.status = to;
            alert.clone()
        };
        info!(alert = %alert_id, sensor = %updated.sensor_id, status = ?to, "alert updated");
        self.store.save_alert(&updated).await?;
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Calibration
    // -----------------------------------------------------------------------

    /// Fit a new offset/slope from reference pairs. The fit is adopted only
    /// when it validates; a failing record is still returned and stored,
    /// and raises a `calibration_needed` alert.
    pub async fn calibrate(
        &self,
        sensor_id: &str,
        measurements: Vec<ReferenceMeasurement>,
    ) -> Result<CalibrationRecord> {
        let slot = self.slot(sensor_id).await?;

        let record = {
            let mut s = slot.lock().await;
            let previous = s.device.status;
            self.set_status(&mut s, SensorStatus::Calibrating);
            let result = calibration::run(sensor_id, measurements, self.settings.accuracy_threshold_percent);
            if let Ok(record) = &result {
                s.device.calibration =
                    calibration::adopt(&s.device.calibration, record, self.settings.calibration_interval_days);
                // A new fit changes the value scale.
                s.prior = None;
            }
            self.set_status(&mut s, previous);
            result?
        };

        if let Err(e) = self.store.save_calibration(&record).await {
            warn!(sensor = %sensor_id, error = %format!("{e:#}"), "failed to store calibration");
        }

        let v = &record.validation;
        self.events.lock().record(
            EventKind::Calibration,
            Some(sensor_id),
            format!(
                "{} accuracy {:.2}% r2 {:.4}",
                if v.passed { "passed" } else { "failed" },
                v.accuracy_percent,
                v.r2
            ),
        );
        if v.passed {
            info!(
                sensor = %sensor_id,
                offset = record.fitted_offset,
                slope = record.fitted_slope,
                accuracy = v.accuracy_percent,
                "calibration adopted"
            );
        } else {
            warn!(
                sensor = %sensor_id,
                accuracy = v.accuracy_percent,
                threshold = self.settings.accuracy_threshold_percent,
                "calibration failed validation"
            );
            self.raise(thresholds::calibration_needed_alert(&record)).await;
        }
        Ok(record)
    }

    pub async fn calibrations(&self, sensor_id: &str) -> Result<Vec<CalibrationRecord>> {
        self.slot(sensor_id).await?;
        Ok(self.store.calibrations_for(sensor_id).await?)
    }

    // -----------------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------------

    /// Create or replace a group. Every member must be registered.
    pub async fn upsert_group(&self, group: SensorGroup) -> Result<SensorGroup> {
        if group.id.trim().is_empty() {
            return Err(SensorError::InvalidRequest("group id is empty".into()));
        }
        if group.member_sensor_ids.is_empty() {
            return Err(SensorError::InvalidRequest(format!("group '{}' has no members", group.id)));
        }
        for (member, weight) in &group.weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(SensorError::InvalidRequest(format!(
                    "group '{}': weight for {member} must be a non-negative number",
                    group.id
                )));
            }
            if !group.member_sensor_ids.contains(member) {
                return Err(SensorError::InvalidRequest(format!(
                    "group '{}': weight given for non-member {member}",
                    group.id
                )));
            }
        }
        if group.freshness_secs == Some(0) {
            return Err(SensorError::InvalidRequest(format!(
                "group '{}': freshness_secs must be positive",
                group.id
            )));
        }

        // Held across the insert so a concurrent deregister cannot slip in
        // between the membership check and the write.
        let devices = self.devices.read().await;
        if let Some(unknown) = group.member_sensor_ids.iter().find(|m| !devices.contains_key(*m)) {
            return Err(SensorError::UnknownSensor(unknown.clone()));
        }
        self.groups.write().insert(group.id.clone(), group.clone());
        drop(devices);

        info!(
            group = %group.id,
            members = group.member_sensor_ids.len(),
            method = ?group.aggregation_method,
            "group saved"
        );
        Ok(group)
    }

    pub fn remove_group(&self, group_id: &str) -> Result<SensorGroup> {
        let removed = self
            .groups
            .write()
            .remove(group_id)
            .ok_or_else(|| SensorError::UnknownGroup(group_id.to_string()))?;
        info!(group = %group_id, "group removed");
        Ok(removed)
    }

    pub fn group(&self, group_id: &str) -> Result<SensorGroup> {
        self.groups
            .read()
            .get(group_id)
            .cloned()
            .ok_or_else(|| SensorError::UnknownGroup(group_id.to_string()))
    }

    pub fn groups(&self) -> Vec<SensorGroup> {
        self.groups.read().values().cloned().collect()
    }

    /// Reduce the members' latest readings into one value per parameter.
    pub fn aggregate(&self, group_id: &str) -> Result<AggregatedReading> {
        let group = self.group(group_id)?;
        let freshness = group
            .freshness_secs
            .map(|s| time::Duration::seconds(s as i64))
            .unwrap_or_else(|| self.settings.default_freshness());
        let latest: BTreeMap<String, SensorReading> = {
            let cache = self.latest.read();
            group
                .member_sensor_ids
                .iter()
                .filter_map(|m| cache.get(m).map(|r| (m.clone(), r.clone())))
                .collect()
        };
        Ok(aggregation::aggregate(&group, &latest, freshness, OffsetDateTime::now_utc()))
    }

    // -----------------------------------------------------------------------
    // Analytics & status
    // -----------------------------------------------------------------------

    pub async fn analytics(
        &self,
        sensor_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<AnalyticsReport> {
        if end <= start {
            return Err(SensorError::InvalidRequest("window end must be after its start".into()));
        }
        self.slot(sensor_id).await?;
        let readings = self.store.readings_between(sensor_id, start, end).await?;
        let history = self.history.lock().get(sensor_id).cloned();
        Ok(analytics::analyze(sensor_id, &readings, history.as_ref(), start, end))
    }

    pub async fn status_report(&self) -> StatusReport {
        let devices = self.devices().await;
        let mut by_status = BTreeMap::new();
        for d in &devices {
            *by_status.entry(d.device.status.to_string()).or_insert(0) += 1;
        }
        let open_alerts = self.alerts.lock().iter().filter(|a| a.is_open()).count();
        let (uptime_secs, events) = {
            let log = self.events.lock();
            (log.uptime_secs(), log.recent())
        };
        StatusReport {
            uptime_secs,
            devices: devices.len(),
            by_status,
            groups: self.groups.read().len(),
            open_alerts,
            events,
        }
    }

    pub fn record_system_event(&self, detail: impl Into<String>) {
        self.events.lock().system(detail);
    }

    /// Stop every scheduling unit and pending retry and close all
    /// transports. Later `connect` calls are refused.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let retries: Vec<JoinHandle<()>> = self.retries.lock().drain().map(|(_, h)| h).collect();
        for handle in retries {
            handle.abort();
        }

        let slots: Vec<_> = self.devices.read().await.values().cloned().collect();
        let mut closed = 0usize;
        for slot in slots {
            let link = {
                let mut s = slot.lock().await;
                s.reconnect_pending = false;
                self.set_status(&mut s, SensorStatus::Disconnected);
                s.link.take()
            };
            if let Some(link) = link {
                close_link(link).await;
                closed += 1;
            }
        }
        self.record_system_event("shutdown");
        info!(closed, "connection manager stopped");
    }
}

async fn close_link(link: Link) {
    link.task.abort();
    link.transport.lock().await.close().await;
}

fn prune_resolved(alerts: &mut Vec<SensorAlert>) {
    let resolved = alerts.iter().filter(|a| !a.is_open()).count();
    if resolved <= MAX_RESOLVED_ALERTS {
        return;
    }
    let mut excess = resolved - MAX_RESOLVED_ALERTS;
    alerts.retain(|a| {
        if excess > 0 && !a.is_open() {
            excess -= 1;
            false
        } else {
            true
        }
    });
}

fn format_values(reading: &SensorReading) -> String {
    reading
        .values
        .iter()
        .map(|(k, v)| format!("{k}={v:.2}"))
        .collect::<Vec<_>>()
        .join(" ")
}

// ===========================================================================
// Tests
// ===========================================================================
