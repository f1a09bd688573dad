//! Threshold evaluation and alert construction.
//!
//! Range lookup order for a parameter: the device's own override, then the
//! facility override from config, then the built-in agronomic default.

use std::collections::BTreeMap;

use crate::model::{
    AlertType, BoundCondition, CalibrationRecord, ReadingQuality, SensorAlert, SensorDevice,
    SensorReading, Severity, ThresholdBreach, ValueRange,
};

/// Built-in target ranges for a typical leafy-greens / fruiting crop room.
pub fn default_range(parameter: &str) -> Option<ValueRange> {
    let (min, max) = match parameter {
        "ec" => (1.0, 3.0),
        "ph" => (5.5, 6.5),
        "co2" => (400.0, 1500.0),
        "temperature" => (18.0, 28.0),
        "ppfd" => (200.0, 1000.0),
        "humidity" => (40.0, 80.0),
        "vpd" => (0.4, 1.6),
        "moisture" => (20.0, 80.0),
        _ => return None,
    };
    Some(ValueRange::new(min, max))
}

/// Facility-wide overrides, usually loaded from the `[thresholds]` table.
#[derive(Debug, Clone, Default)]
pub struct ThresholdTable {
    overrides: BTreeMap<String, ValueRange>,
}

impl ThresholdTable {
    pub fn new(overrides: BTreeMap<String, ValueRange>) -> Self {
        Self { overrides }
    }

    pub fn range_for(&self, device: &SensorDevice, parameter: &str) -> Option<ValueRange> {
        device
            .thresholds
            .get(parameter)
            .or_else(|| self.overrides.get(parameter))
            .copied()
            .or_else(|| default_range(parameter))
    }

    /// One `out_of_range` alert per parameter outside its range.
    ///
    /// A bad-quality value is still reported, as critical and with the
    /// sensor named as the first suspect. When such a value breaches no
    /// configured range (non-finite, or a wide device override) it raises
    /// an `anomaly` alert instead.
    pub fn evaluate(&self, device: &SensorDevice, reading: &SensorReading) -> Vec<SensorAlert> {
        let implausible = reading.quality == ReadingQuality::Bad;
        let mut alerts: Vec<SensorAlert> = reading
            .values
            .iter()
            .filter_map(|(parameter, &value)| {
                let range = self.range_for(device, parameter)?;
                let breach = check(parameter, value, range)?;
                let alert = out_of_range_alert(&device.id, breach);
                Some(if implausible { suspect_sensor(alert) } else { alert })
            })
            .collect();

        if implausible && alerts.is_empty() {
            let value = reading.values.get(&device.parameter).copied().unwrap_or(f64::NAN);
            alerts.push(implausible_value_alert(&device.id, &device.parameter, value));
        }
        alerts
    }
}

fn suspect_sensor(mut alert: SensorAlert) -> SensorAlert {
    alert.severity = Severity::Critical;
    alert.message.push_str(" (outside physical limits)");
    alert.recommended_actions.insert(0, SENSOR_CHECK.to_string());
    alert
}

const SENSOR_CHECK: &str = "Verify the sensor and its wiring before acting on this value";

pub fn implausible_value_alert(sensor_id: &str, parameter: &str, value: f64) -> SensorAlert {
    SensorAlert::new(
        sensor_id,
        AlertType::Anomaly,
        Severity::High,
        format!("{parameter} {value:.2} is outside what the sensor can physically report"),
    )
    .with_actions(vec![
        SENSOR_CHECK.into(),
        "Recalibrate or replace the sensor if the value persists".into(),
    ])
}

/// Compare one value against a range.
pub fn check(parameter: &str, value: f64, range: ValueRange) -> Option<ThresholdBreach> {
    let (condition, boundary) = if value < range.min {
        (BoundCondition::Below, range.min)
    } else if value > range.max {
        (BoundCondition::Above, range.max)
    } else {
        return None;
    };
    Some(ThresholdBreach {
        parameter: parameter.to_string(),
        condition,
        boundary,
        actual_value: value,
        deviation: (value - boundary).abs(),
    })
}

pub fn out_of_range_alert(sensor_id: &str, breach: ThresholdBreach) -> SensorAlert {
    let direction = match breach.condition {
        BoundCondition::Below => "below",
        BoundCondition::Above => "above",
    };
    let message = format!(
        "{} {:.2} is {direction} {:.2} by {:.2}",
        breach.parameter, breach.actual_value, breach.boundary, breach.deviation
    );
    let actions = recommended_actions(&breach.parameter, breach.condition);
    SensorAlert::new(sensor_id, AlertType::OutOfRange, Severity::High, message)
        .with_threshold(breach)
        .with_actions(actions)
}

pub fn sensor_error_alert(sensor_id: &str, consecutive_failures: u32, last_error: &str) -> SensorAlert {
    SensorAlert::new(
        sensor_id,
        AlertType::SensorError,
        Severity::High,
        format!("{consecutive_failures} consecutive read failures; last error: {last_error}"),
    )
    .with_actions(vec![
        "Check power and cabling to the sensor".into(),
        "Verify the connection parameters (address, topic, port, URL)".into(),
        "Inspect the sensor for physical damage or fouling".into(),
    ])
}

pub fn calibration_needed_alert(record: &CalibrationRecord) -> SensorAlert {
    SensorAlert::new(
        &record.sensor_id,
        AlertType::CalibrationNeeded,
        Severity::High,
        format!(
            "calibration failed validation: accuracy {:.2}%, r2 {:.4}; previous calibration kept",
            record.validation.accuracy_percent, record.validation.r2
        ),
    )
    .with_actions(vec![
        "Clean the probe and let it stabilise before measuring".into(),
        "Use fresh reference standards spanning the working range".into(),
        "Repeat the calibration with at least three reference points".into(),
    ])
}

pub fn maintenance_due_alert(device: &SensorDevice) -> SensorAlert {
    let due = device
        .calibration
        .next_calibration_due
        .map(|d| d.date().to_string())
        .unwrap_or_else(|| "unknown".into());
    SensorAlert::new(
        &device.id,
        AlertType::MaintenanceDue,
        Severity::Medium,
        format!("scheduled calibration was due on {due}"),
    )
    .with_actions(vec!["Schedule a calibration run for this sensor".into()])
}

fn recommended_actions(parameter: &str, condition: BoundCondition) -> Vec<String> {
    use BoundCondition::{Above, Below};

    let actions: &[&str] = match (parameter, condition) {
        ("ec", Above) => &[
            "Dilute the nutrient solution with fresh water",
            "Check the dosing pump for over-delivery",
        ],
        ("ec", Below) => &[
            "Increase nutrient concentration",
            "Check stock tanks and dosing lines",
        ],
        ("ph", Above) => &["Dose pH down", "Check the buffer capacity of the source water"],
        ("ph", Below) => &["Dose pH up", "Check for root-zone decomposition"],
        ("co2", Above) => &[
            "Reduce CO2 injection",
            "Increase ventilation if personnel are present",
        ],
        ("co2", Below) => &[
            "Check CO2 supply and injection schedule",
            "Close vents during enrichment periods",
        ],
        ("temperature", Above) => &[
            "Increase cooling or ventilation",
            "Deploy shade screens or dim lights",
        ],
        ("temperature", Below) => &["Increase heating", "Check for cold drafts"],
        ("ppfd", Above) => &["Dim fixtures or deploy shade screens"],
        ("ppfd", Below) => &[
            "Check fixture output and schedule",
            "Clean fixture lenses and glazing",
        ],
        ("humidity", Above) | ("vpd", Below) => &[
            "Increase dehumidification or air exchange",
            "Raise air temperature slightly to lift VPD",
        ],
        ("humidity", Below) | ("vpd", Above) => &[
            "Increase humidification or fogging",
            "Lower air temperature to reduce VPD",
        ],
        ("moisture", Below) => &["Trigger irrigation", "Check emitters for clogging"],
        ("moisture", Above) => &["Pause irrigation", "Check drainage"],
        _ => &["Inspect the affected zone"],
    };
    actions.iter().map(|s| s.to_string()).collect()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Calibration, ConnectionParams, Protocol, SensorKind, SensorStatus,
    };
    use time::OffsetDateTime;

    fn device(parameter: &str) -> SensorDevice {
        SensorDevice {
            id: "dev-1".into(),
            kind: SensorKind::RootZone,
            protocol: Protocol::Serial,
            parameter: parameter.into(),
            connection: ConnectionParams::Serial {
                port: "/dev/ttyUSB0".into(),
                baud_rate: 9600,
            },
            polling_interval_secs: 10,
            calibration: Calibration::default(),
            status: SensorStatus::Connected,
            error_count: 0,
            last_reading_at: None,
            derive: None,
            thresholds: BTreeMap::new(),
        }
    }

    fn reading(values: &[(&str, f64)], quality: ReadingQuality) -> SensorReading {
        SensorReading {
            sensor_id: "dev-1".into(),
            timestamp: OffsetDateTime::now_utc(),
            values: values.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            quality,
            raw_value: None,
        }
    }

    #[test]
    fn in_range_reading_raises_nothing() {
        let table = ThresholdTable::default();
        let alerts = table.evaluate(&device("ec"), &reading(&[("ec", 2.0)], ReadingQuality::Good));
        assert!(alerts.is_empty());
    }

    #[test]
    fn above_max_raises_high_alert_with_breach() {
        let table = ThresholdTable::default();
        let alerts = table.evaluate(&device("ec"), &reading(&[("ec", 3.4)], ReadingQuality::Good));
        assert_eq!(alerts.len(), 1);

        let a = &alerts[0];
        assert_eq!(a.alert_type, AlertType::OutOfRange);
        assert_eq!(a.severity, Severity::High);
        let breach = a.threshold.as_ref().unwrap();
        assert_eq!(breach.condition, BoundCondition::Above);
        assert_eq!(breach.boundary, 3.0);
        assert!((breach.deviation - 0.4).abs() < 1e-9);
        assert!(!a.recommended_actions.is_empty());
    }

    #[test]
    fn derived_values_are_checked_too() {
        let table = ThresholdTable::default();
        let alerts = table.evaluate(
            &device("temperature"),
            &reading(&[("temperature", 24.0), ("vpd", 2.1)], ReadingQuality::Good),
        );
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].threshold.as_ref().unwrap().parameter, "vpd");
    }

    #[test]
    fn bad_quality_breach_is_critical_and_blames_the_sensor() {
        let table = ThresholdTable::default();
        let alerts = table.evaluate(&device("ph"), &reading(&[("ph", 14.5)], ReadingQuality::Bad));
        assert_eq!(alerts.len(), 1);

        let a = &alerts[0];
        assert_eq!(a.alert_type, AlertType::OutOfRange);
        assert_eq!(a.severity, Severity::Critical);
        assert_eq!(a.threshold.as_ref().unwrap().boundary, 6.5);
        assert_eq!(a.recommended_actions[0], SENSOR_CHECK);
    }

    #[test]
    fn bad_quality_inside_a_wide_override_is_an_anomaly() {
        let table = ThresholdTable::default();
        let mut dev = device("ec");
        dev.thresholds.insert("ec".into(), ValueRange::new(0.0, 1000.0));
        let alerts = table.evaluate(&dev, &reading(&[("ec", 250.0)], ReadingQuality::Bad));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::Anomaly);
        assert!(alerts[0].threshold.is_none());

        let alerts = table.evaluate(&device("ec"), &reading(&[("ec", f64::NAN)], ReadingQuality::Bad));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::Anomaly);
    }

    #[test]
    fn device_override_beats_facility_override() {
        let table = ThresholdTable::new(BTreeMap::from([(
            "co2".to_string(),
            ValueRange::new(400.0, 1200.0),
        )]));
        let mut dev = device("co2");
        assert_eq!(table.range_for(&dev, "co2"), Some(ValueRange::new(400.0, 1200.0)));

        dev.thresholds
            .insert("co2".into(), ValueRange::new(300.0, 2000.0));
        assert_eq!(table.range_for(&dev, "co2"), Some(ValueRange::new(300.0, 2000.0)));
        assert_eq!(table.range_for(&dev, "ph"), default_range("ph"));
    }

    #[test]
    fn unknown_parameter_has_no_threshold() {
        let table = ThresholdTable::default();
        assert!(table.range_for(&device("x"), "wind").is_none());
    }

    #[test]
    fn below_min_reports_condition_below() {
        let breach = check("ph", 5.1, ValueRange::new(5.5, 6.5)).unwrap();
        assert_eq!(breach.condition, BoundCondition::Below);
        assert_eq!(breach.boundary, 5.5);
    }
}
