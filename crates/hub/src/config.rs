//! TOML config file loading, validation, and registration of the devices
//! and groups it declares.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::manager::ConnectionManager;
use crate::model::{DeviceRegistration, SensorGroup, ValueRange};
use crate::thresholds::ThresholdTable;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    /// Facility-wide threshold overrides keyed by parameter.
    #[serde(default)]
    pub thresholds: BTreeMap<String, ValueRange>,
    #[serde(default)]
    pub devices: Vec<DeviceRegistration>,
    #[serde(default)]
    pub groups: Vec<SensorGroup>,
}

/// Engine tunables. Every field has a default, so `[engine]` may be omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Consecutive read failures before a device is forced offline.
    pub error_threshold: u32,
    pub retry_delay_secs: u64,
    /// Bound on any single transport open or read.
    pub io_timeout_secs: u64,
    pub calibration_interval_days: i64,
    pub accuracy_threshold_percent: f64,
    /// How old a reading may be and still feed groups and derived metrics.
    pub default_freshness_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            error_threshold: 3,
            retry_delay_secs: 30,
            io_timeout_secs: 5,
            calibration_interval_days: crate::calibration::DEFAULT_INTERVAL_DAYS,
            accuracy_threshold_percent: crate::calibration::DEFAULT_ACCURACY_THRESHOLD,
            default_freshness_secs: 300,
        }
    }
}

impl EngineConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn default_freshness(&self) -> time::Duration {
        time::Duration::seconds(self.default_freshness_secs as i64)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_engine(&mut errors);
        self.validate_thresholds(&mut errors);
        self.validate_devices(&mut errors);
        self.validate_groups(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_engine(&self, errors: &mut Vec<String>) {
        let e = &self.engine;
        if e.error_threshold == 0 {
            errors.push("engine: error_threshold must be at least 1".into());
        }
        if e.retry_delay_secs == 0 {
            errors.push("engine: retry_delay_secs must be positive".into());
        }
        if e.io_timeout_secs == 0 {
            errors.push("engine: io_timeout_secs must be positive".into());
        }
        if e.calibration_interval_days <= 0 {
            errors.push(format!(
                "engine: calibration_interval_days must be positive, got {}",
                e.calibration_interval_days
            ));
        }
        if !(e.accuracy_threshold_percent > 0.0 && e.accuracy_threshold_percent <= 100.0) {
            errors.push(format!(
                "engine: accuracy_threshold_percent {} out of range (0, 100]",
                e.accuracy_threshold_percent
            ));
        }
        if e.default_freshness_secs == 0 {
            errors.push("engine: default_freshness_secs must be positive".into());
        }
    }

    fn validate_thresholds(&self, errors: &mut Vec<String>) {
        for (param, range) in &self.thresholds {
            if !range.min.is_finite() || !range.max.is_finite() || range.min >= range.max {
                errors.push(format!(
                    "thresholds.{param}: min ({}) must be below max ({})",
                    range.min, range.max
                ));
            }
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let ids: HashSet<&str> = self.devices.iter().map(|d| d.id.as_str()).collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.id.trim().is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.id)
                }
            };

            if !d.id.trim().is_empty() && !seen_ids.insert(&d.id) {
                errors.push(format!("{}: duplicate id", ctx()));
            }
            for problem in d.problems() {
                errors.push(format!("{}: {problem}", ctx()));
            }

            // ── Derivation sources ─────────────────────────────
            if let Some(derive) = &d.derive {
                let sources = [
                    ("humidity_from", &derive.humidity_from),
                    ("leaf_temperature_from", &derive.leaf_temperature_from),
                ];
                for (field, source) in sources {
                    let Some(source) = source else { continue };
                    if source == &d.id {
                        errors.push(format!("{}: {field} refers to itself", ctx()));
                    } else if !ids.contains(source.as_str()) {
                        errors.push(format!(
                            "{}: {field} '{source}' does not match any defined device",
                            ctx()
                        ));
                    }
                }
            }
        }
    }

    fn validate_groups(&self, errors: &mut Vec<String>) {
        let device_ids: HashSet<&str> = self.devices.iter().map(|d| d.id.as_str()).collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, g) in self.groups.iter().enumerate() {
            let ctx = || {
                if g.id.trim().is_empty() {
                    format!("groups[{i}]")
                } else {
                    format!("group '{}'", g.id)
                }
            };

            if g.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(&g.id) {
                errors.push(format!("{}: duplicate id", ctx()));
            }

            if g.member_sensor_ids.is_empty() {
                errors.push(format!("{}: member_sensor_ids is empty", ctx()));
            }
            for member in &g.member_sensor_ids {
                if !device_ids.contains(member.as_str()) {
                    errors.push(format!(
                        "{}: member '{member}' does not match any defined device",
                        ctx()
                    ));
                }
            }

            for (member, weight) in &g.weights {
                if !weight.is_finite() || *weight < 0.0 {
                    errors.push(format!(
                        "{}: weight {weight} for '{member}' must be a non-negative number",
                        ctx()
                    ));
                }
                if !g.member_sensor_ids.contains(member) {
                    errors.push(format!("{}: weight given for non-member '{member}'", ctx()));
                }
            }

            if g.freshness_secs == Some(0) {
                errors.push(format!("{}: freshness_secs must be positive", ctx()));
            }
        }
    }

    pub fn threshold_table(&self) -> ThresholdTable {
        ThresholdTable::new(self.thresholds.clone())
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Register every configured device and group with the manager. Devices
/// are left disconnected.
pub async fn apply(config: &Config, manager: &Arc<ConnectionManager>) -> Result<()> {
    for d in &config.devices {
        manager
            .register(d.clone())
            .await
            .with_context(|| format!("failed to register device '{}'", d.id))?;
    }

    for g in &config.groups {
        manager
            .upsert_group(g.clone())
            .await
            .with_context(|| format!("failed to create group '{}'", g.id))?;
    }

    tracing::info!(
        devices = config.devices.len(),
        groups = config.groups.len(),
        thresholds = config.thresholds.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
