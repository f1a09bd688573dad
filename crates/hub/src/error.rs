//! Error taxonomy for the sensor engine.
//!
//! Transport-level variants (`Connection`, `ReadTimeout`, `Read`, `Parse`)
//! are absorbed by the connection manager and turned into error counts and
//! alerts.  The remaining variants are returned to whoever triggered the
//! action (registration, calibration, group updates, queries).

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    #[error("configuration error for sensor '{sensor_id}': {message}")]
    Configuration { sensor_id: String, message: String },

    #[error("connection to sensor '{sensor_id}' failed: {message}")]
    Connection { sensor_id: String, message: String },

    #[error("read from sensor '{sensor_id}' timed out after {timeout:?}")]
    ReadTimeout { sensor_id: String, timeout: Duration },

    #[error("read from sensor '{sensor_id}' failed: {message}")]
    Read { sensor_id: String, message: String },

    #[error("malformed payload from sensor '{sensor_id}': {message}")]
    Parse { sensor_id: String, message: String },

    #[error(
        "calibration of sensor '{sensor_id}' failed validation: accuracy {accuracy_percent:.2}% (r2 {r2:.4})"
    )]
    CalibrationValidation {
        sensor_id: String,
        accuracy_percent: f64,
        r2: f64,
    },

    #[error("invalid calibration input: {0}")]
    InvalidCalibrationInput(String),

    #[error("unknown sensor '{0}'")]
    UnknownSensor(String),

    #[error("unknown group '{0}'")]
    UnknownGroup(String),

    #[error("unknown alert '{0}'")]
    UnknownAlert(String),

    #[error("sensor '{0}' is already registered")]
    DuplicateSensor(String),

    #[error("sensor '{sensor_id}' is still a member of group(s): {groups:?}")]
    SensorInUse {
        sensor_id: String,
        groups: Vec<String>,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    UnsupportedOperation(String),

    #[error("reading store error: {0}")]
    Store(String),
}

impl SensorError {
    pub(crate) fn config(sensor_id: &str, message: impl Into<String>) -> Self {
        Self::Configuration {
            sensor_id: sensor_id.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn connection(sensor_id: &str, message: impl ToString) -> Self {
        Self::Connection {
            sensor_id: sensor_id.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn read(sensor_id: &str, message: impl ToString) -> Self {
        Self::Read {
            sensor_id: sensor_id.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn parse(sensor_id: &str, message: impl ToString) -> Self {
        Self::Parse {
            sensor_id: sensor_id.to_string(),
            message: message.to_string(),
        }
    }

    /// True for failures that count toward a device's `error_count`.
    pub fn is_read_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ReadTimeout { .. } | Self::Read { .. } | Self::Parse { .. }
        )
    }
}

impl From<anyhow::Error> for SensorError {
    fn from(e: anyhow::Error) -> Self {
        Self::Store(format!("{e:#}"))
    }
}

pub type Result<T, E = SensorError> = std::result::Result<T, E>;
