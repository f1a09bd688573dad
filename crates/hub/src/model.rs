//! Core data model: devices, readings, calibration records, alerts, groups.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

// ---------------------------------------------------------------------------
// Device identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SensorKind {
    RootZone,
    CanopyTemperature,
    Co2,
    LightPar,
    DerivedOnly,
}

impl SensorKind {
    /// Parameter a device of this kind reports when none is configured.
    pub fn default_parameter(self) -> &'static str {
        match self {
            Self::RootZone => "ec",
            Self::CanopyTemperature => "temperature",
            Self::Co2 => "co2",
            Self::LightPar => "ppfd",
            Self::DerivedOnly => "humidity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Modbus,
    Mqtt,
    Serial,
    Http,
}

impl Protocol {
    /// Pull protocols are driven by the polling scheduler; MQTT pushes.
    pub fn is_pull(self) -> bool {
        !matches!(self, Self::Mqtt)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Modbus => write!(f, "modbus"),
            Self::Mqtt => write!(f, "mqtt"),
            Self::Serial => write!(f, "serial"),
            Self::Http => write!(f, "http"),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    #[default]
    Holding,
    Input,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    #[default]
    U16,
    I16,
}

/// Which register to read and how to scale it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusPoint {
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    pub register: u16,
    #[serde(default)]
    pub register_kind: RegisterKind,
    #[serde(default)]
    pub data_type: RegisterType,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionParams {
    ModbusTcp {
        #[serde(alias = "address")]
        host: String,
        #[serde(default = "default_modbus_port")]
        port: u16,
        #[serde(flatten)]
        point: ModbusPoint,
    },
    ModbusRtu {
        serial_port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(flatten)]
        point: ModbusPoint,
    },
    Mqtt {
        broker: String,
        #[serde(default = "default_mqtt_port")]
        port: u16,
        topic: String,
        #[serde(default)]
        client_id: Option<String>,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    Serial {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    Http {
        url: String,
        #[serde(default)]
        method: HttpMethod,
        #[serde(default)]
        json_path: Option<String>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<serde_json::Value>,
    },
}

impl ConnectionParams {
    /// Protocol family these parameters belong to.
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::ModbusTcp { .. } | Self::ModbusRtu { .. } => Protocol::Modbus,
            Self::Mqtt { .. } => Protocol::Mqtt,
            Self::Serial { .. } => Protocol::Serial,
            Self::Http { .. } => Protocol::Http,
        }
    }

    /// Every required field that is missing or empty, by name.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        match self {
            Self::ModbusTcp { host, port, point } => {
                if host.trim().is_empty() {
                    missing.push("host");
                }
                if *port == 0 {
                    missing.push("port");
                }
                if point.scale == 0.0 || !point.scale.is_finite() {
                    missing.push("scale");
                }
            }
            Self::ModbusRtu {
                serial_port,
                baud_rate,
                point,
            } => {
                if serial_port.trim().is_empty() {
                    missing.push("serial_port");
                }
                if *baud_rate == 0 {
                    missing.push("baud_rate");
                }
                if point.scale == 0.0 || !point.scale.is_finite() {
                    missing.push("scale");
                }
            }
            Self::Mqtt {
                broker, port, topic, ..
            } => {
                if broker.trim().is_empty() {
                    missing.push("broker");
                }
                if *port == 0 {
                    missing.push("port");
                }
                if topic.trim().is_empty() {
                    missing.push("topic");
                }
            }
            Self::Serial { port, baud_rate } => {
                if port.trim().is_empty() {
                    missing.push("port");
                }
                if *baud_rate == 0 {
                    missing.push("baud_rate");
                }
            }
            Self::Http { url, .. } => {
                if url.trim().is_empty() {
                    missing.push("url");
                }
            }
        }
        missing
    }
}

fn default_unit_id() -> u8 {
    1
}

fn default_scale() -> f64 {
    1.0
}

fn default_modbus_port() -> u16 {
    502
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_baud_rate() -> u32 {
    9600
}

// ---------------------------------------------------------------------------
// Device state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub offset: f64,
    pub slope: f64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_calibrated: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_calibration_due: Option<OffsetDateTime>,
    #[serde(default)]
    pub needs_calibration: bool,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            offset: 0.0,
            slope: 1.0,
            last_calibrated: None,
            next_calibration_due: None,
            needs_calibration: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    Disconnected,
    Connecting,
    Connected,
    Calibrating,
    Error,
}

impl SensorStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Calibrating)
    }
}

impl std::fmt::Display for SensorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Calibrating => "calibrating",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Other devices whose latest readings feed this device's derived metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeriveSources {
    #[serde(default)]
    pub humidity_from: Option<String>,
    #[serde(default)]
    pub leaf_temperature_from: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorDevice {
    pub id: String,
    pub kind: SensorKind,
    pub protocol: Protocol,
    pub parameter: String,
    pub connection: ConnectionParams,
    pub polling_interval_secs: u64,
    pub calibration: Calibration,
    pub status: SensorStatus,
    pub error_count: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_reading_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub derive: Option<DeriveSources>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, ValueRange>,
}

/// What a caller submits to register a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub id: String,
    pub kind: SensorKind,
    pub protocol: Protocol,
    #[serde(default)]
    pub parameter: Option<String>,
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,
    pub connection: ConnectionParams,
    #[serde(default)]
    pub calibration: Option<InitialCalibration>,
    #[serde(default)]
    pub derive: Option<DeriveSources>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, ValueRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InitialCalibration {
    pub offset: f64,
    pub slope: f64,
}

fn default_polling_interval() -> u64 {
    60
}

impl DeviceRegistration {
    /// Every reason this registration would be rejected, empty when valid.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.id.trim().is_empty() {
            problems.push("id is empty".to_string());
        }
        if self.connection.protocol() != self.protocol {
            problems.push(format!(
                "protocol {} does not match {} connection parameters",
                self.protocol,
                self.connection.protocol()
            ));
        }
        let missing = self.connection.missing_fields();
        if !missing.is_empty() {
            problems.push(format!("missing connection parameter(s): {}", missing.join(", ")));
        }
        if self.protocol.is_pull() && self.polling_interval_secs == 0 {
            problems.push("polling_interval_secs must be positive".to_string());
        }
        if let Some(c) = &self.calibration {
            if !c.offset.is_finite() || !c.slope.is_finite() || c.slope == 0.0 {
                problems.push(format!(
                    "calibration offset {} / slope {} is not usable",
                    c.offset, c.slope
                ));
            }
        }
        for (parameter, range) in &self.thresholds {
            if !range.min.is_finite() || !range.max.is_finite() || range.min >= range.max {
                problems.push(format!(
                    "threshold for {parameter}: min ({}) must be below max ({})",
                    range.min, range.max
                ));
            }
        }
        problems
    }

    /// Resolve defaults into a fresh, disconnected device.
    pub fn into_device(self) -> SensorDevice {
        let parameter = self
            .parameter
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.kind.default_parameter().to_string());
        let calibration = self
            .calibration
            .map(|c| Calibration {
                offset: c.offset,
                slope: c.slope,
                ..Calibration::default()
            })
            .unwrap_or_default();

        SensorDevice {
            id: self.id,
            kind: self.kind,
            protocol: self.protocol,
            parameter,
            connection: self.connection,
            polling_interval_secs: self.polling_interval_secs,
            calibration,
            status: SensorStatus::Disconnected,
            error_count: 0,
            last_reading_at: None,
            derive: self.derive,
            thresholds: self.thresholds,
        }
    }
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingQuality {
    Good,
    Questionable,
    Bad,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub values: BTreeMap<String, f64>,
    pub quality: ReadingQuality,
    #[serde(default)]
    pub raw_value: Option<f64>,
}

// ---------------------------------------------------------------------------
// Calibration records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceMeasurement {
    pub reference: f64,
    pub measured: f64,
    #[serde(default = "OffsetDateTime::now_utc", with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationValidation {
    pub accuracy_percent: f64,
    pub r2: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub sensor_id: String,
    pub reference_measurements: Vec<ReferenceMeasurement>,
    pub fitted_offset: f64,
    pub fitted_slope: f64,
    pub validation: CalibrationValidation,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl CalibrationRecord {
    /// Turn a failed validation into a `CalibrationValidation` error.
    pub fn into_result(self) -> crate::error::Result<Self> {
        if self.validation.passed {
            Ok(self)
        } else {
            Err(crate::error::SensorError::CalibrationValidation {
                sensor_id: self.sensor_id,
                accuracy_percent: self.validation.accuracy_percent,
                r2: self.validation.r2,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    OutOfRange,
    SensorError,
    CalibrationNeeded,
    MaintenanceDue,
    Anomaly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundCondition {
    Below,
    Above,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdBreach {
    pub parameter: String,
    pub condition: BoundCondition,
    pub boundary: f64,
    pub actual_value: f64,
    /// Distance past the boundary, always positive.
    pub deviation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorAlert {
    pub id: String,
    pub sensor_id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    pub status: AlertStatus,
    pub message: String,
    #[serde(default)]
    pub threshold: Option<ThresholdBreach>,
    pub recommended_actions: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl SensorAlert {
    pub fn new(
        sensor_id: &str,
        alert_type: AlertType,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sensor_id: sensor_id.to_string(),
            alert_type,
            severity,
            status: AlertStatus::Active,
            message: message.into(),
            threshold: None,
            recommended_actions: Vec::new(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_threshold(mut self, breach: ThresholdBreach) -> Self {
        self.threshold = Some(breach);
        self
    }

    pub fn with_actions(mut self, actions: Vec<String>) -> Self {
        self.recommended_actions = actions;
        self
    }

    pub fn is_open(&self) -> bool {
        self.status != AlertStatus::Resolved
    }

    /// Alerts sharing a key are duplicates while either is unresolved.
    pub fn dedup_key(&self) -> (String, AlertType, Option<String>) {
        (
            self.sensor_id.clone(),
            self.alert_type,
            self.threshold.as_ref().map(|t| t.parameter.clone()),
        )
    }
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMethod {
    #[default]
    Average,
    Median,
    Min,
    Max,
    Weighted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorGroup {
    pub id: String,
    #[serde(alias = "members")]
    pub member_sensor_ids: Vec<String>,
    #[serde(default, alias = "method")]
    pub aggregation_method: AggregationMethod,
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
    /// Readings older than this are left out of the reduction.
    #[serde(default)]
    pub freshness_secs: Option<u64>,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_params_deserialize_tagged() {
        let json = r#"{"type":"modbus_tcp","host":"10.0.0.5","register":100}"#;
        let params: ConnectionParams = serde_json::from_str(json).unwrap();
        match &params {
            ConnectionParams::ModbusTcp { host, port, point } => {
                assert_eq!(host, "10.0.0.5");
                assert_eq!(*port, 502);
                assert_eq!(point.register, 100);
                assert_eq!(point.unit_id, 1);
                assert_eq!(point.register_kind, RegisterKind::Holding);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
        assert_eq!(params.protocol(), Protocol::Modbus);
    }

    #[test]
    fn missing_fields_reports_each_empty_value() {
        let params = ConnectionParams::Mqtt {
            broker: " ".into(),
            port: 1883,
            topic: "".into(),
            client_id: None,
            username: None,
            password: None,
        };
        assert_eq!(params.missing_fields(), vec!["broker", "topic"]);
    }

    #[test]
    fn registration_defaults_parameter_from_kind() {
        let reg = DeviceRegistration {
            id: "co2-1".into(),
            kind: SensorKind::Co2,
            protocol: Protocol::Http,
            parameter: None,
            polling_interval_secs: 30,
            connection: ConnectionParams::Http {
                url: "http://10.0.0.9/co2".into(),
                method: HttpMethod::Get,
                json_path: None,
                headers: BTreeMap::new(),
                body: None,
            },
            calibration: None,
            derive: None,
            thresholds: BTreeMap::new(),
        };
        let device = reg.into_device();
        assert_eq!(device.parameter, "co2");
        assert_eq!(device.status, SensorStatus::Disconnected);
        assert_eq!(device.calibration.slope, 1.0);
        assert_eq!(device.calibration.offset, 0.0);
    }

    #[test]
    fn registration_problems_are_collected() {
        let reg = DeviceRegistration {
            id: " ".into(),
            kind: SensorKind::RootZone,
            protocol: Protocol::Mqtt,
            parameter: None,
            polling_interval_secs: 0,
            connection: ConnectionParams::ModbusTcp {
                host: "".into(),
                port: 502,
                point: ModbusPoint {
                    unit_id: 1,
                    register: 0,
                    register_kind: RegisterKind::Holding,
                    data_type: RegisterType::U16,
                    scale: 0.1,
                },
            },
            calibration: Some(InitialCalibration {
                offset: 0.0,
                slope: 0.0,
            }),
            derive: None,
            thresholds: BTreeMap::from([("ec".to_string(), ValueRange::new(3.0, 1.0))]),
        };
        let problems = reg.problems().join("; ");
        assert!(problems.contains("id is empty"), "{problems}");
        assert!(problems.contains("protocol mqtt does not match modbus"), "{problems}");
        assert!(problems.contains("missing connection parameter(s): host"), "{problems}");
        assert!(problems.contains("slope 0"), "{problems}");
        assert!(problems.contains("threshold for ec"), "{problems}");
        // mqtt is push, so a zero interval is fine for the declared protocol
        assert!(!problems.contains("polling_interval_secs"), "{problems}");
    }

    #[test]
    fn alert_serializes_type_field() {
        let alert = SensorAlert::new("ec-1", AlertType::SensorError, Severity::High, "offline");
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["type"], "sensor_error");
        assert_eq!(json["severity"], "high");
        assert_eq!(json["status"], "active");
    }

    #[test]
    fn failed_calibration_record_into_error() {
        let record = CalibrationRecord {
            sensor_id: "ph-1".into(),
            reference_measurements: vec![],
            fitted_offset: 0.1,
            fitted_slope: 0.9,
            validation: CalibrationValidation {
                accuracy_percent: 80.0,
                r2: 0.5,
                passed: false,
            },
            created_at: OffsetDateTime::now_utc(),
        };
        assert!(matches!(
            record.into_result(),
            Err(crate::error::SensorError::CalibrationValidation { .. })
        ));
    }
}
