//! Linear raw → engineering-unit calibration: least-squares fit, application
//! and fit-quality validation.
//!
//! Reference values are the dependent variable (y), raw measured values the
//! independent one (x):
//!
//! ```text
//! slope  = (nΣxy − ΣxΣy) / (nΣx² − (Σx)²)
//! offset = (Σy − slope·Σx) / n
//! ```

use time::{Duration, OffsetDateTime};

use crate::error::{Result, SensorError};
use crate::model::{Calibration, CalibrationRecord, CalibrationValidation, ReferenceMeasurement};

/// Minimum accuracy for a fit to replace the active calibration.
pub const DEFAULT_ACCURACY_THRESHOLD: f64 = 95.0;

/// Days until a fresh calibration is due again.
pub const DEFAULT_INTERVAL_DAYS: i64 = 30;

/// Tolerance for treating the x-variance denominator as zero.
const DEGENERATE_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub offset: f64,
    pub slope: f64,
}

/// Ordinary least-squares fit of reference (y) against measured (x).
pub fn fit(measurements: &[ReferenceMeasurement]) -> Result<LinearFit> {
    if measurements.len() < 2 {
        return Err(SensorError::InvalidCalibrationInput(format!(
            "need at least 2 reference measurements, got {}",
            measurements.len()
        )));
    }
    if let Some(bad) = measurements
        .iter()
        .find(|m| !m.reference.is_finite() || !m.measured.is_finite())
    {
        return Err(SensorError::InvalidCalibrationInput(format!(
            "non-finite measurement pair (reference {}, measured {})",
            bad.reference, bad.measured
        )));
    }

    let n = measurements.len() as f64;
    let (mut sx, mut sy, mut sxy, mut sxx) = (0.0, 0.0, 0.0, 0.0);
    for m in measurements {
        sx += m.measured;
        sy += m.reference;
        sxy += m.measured * m.reference;
        sxx += m.measured * m.measured;
    }

    let denom = n * sxx - sx * sx;
    if denom.abs() < DEGENERATE_EPSILON * n * n.max(sxx) {
        return Err(SensorError::InvalidCalibrationInput(
            "measured values have no spread; slope is undefined".into(),
        ));
    }

    let slope = (n * sxy - sx * sy) / denom;
    let offset = (sy - slope * sx) / n;
    Ok(LinearFit { offset, slope })
}

/// Raw value to calibrated value.
pub fn apply(raw: f64, calibration: &Calibration) -> f64 {
    raw * calibration.slope + calibration.offset
}

/// Score a fit against the pairs it was derived from.
///
/// Percent error is taken relative to the reference; for a zero reference
/// the absolute error (× 100) is used instead.
pub fn validate(
    measurements: &[ReferenceMeasurement],
    offset: f64,
    slope: f64,
    accuracy_threshold: f64,
) -> CalibrationValidation {
    if measurements.is_empty() {
        return CalibrationValidation {
            accuracy_percent: 0.0,
            r2: 0.0,
            passed: false,
        };
    }

    let n = measurements.len() as f64;
    let mean_ref = measurements.iter().map(|m| m.reference).sum::<f64>() / n;

    let mut pct_err_sum = 0.0;
    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for m in measurements {
        let predicted = m.measured * slope + offset;
        let err = (predicted - m.reference).abs();
        pct_err_sum += if m.reference == 0.0 {
            err * 100.0
        } else {
            err / m.reference.abs() * 100.0
        };
        ss_res += (m.reference - predicted).powi(2);
        ss_tot += (m.reference - mean_ref).powi(2);
    }

    let accuracy_percent = 100.0 - pct_err_sum / n;
    let r2 = if ss_tot == 0.0 {
        if ss_res == 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        1.0 - ss_res / ss_tot
    };

    CalibrationValidation {
        accuracy_percent,
        r2,
        passed: accuracy_percent >= accuracy_threshold,
    }
}

/// Fit, validate and package a calibration run for `sensor_id`.
pub fn run(
    sensor_id: &str,
    measurements: Vec<ReferenceMeasurement>,
    accuracy_threshold: f64,
) -> Result<CalibrationRecord> {
    let LinearFit { offset, slope } = fit(&measurements)?;
    let validation = validate(&measurements, offset, slope, accuracy_threshold);
    Ok(CalibrationRecord {
        sensor_id: sensor_id.to_string(),
        reference_measurements: measurements,
        fitted_offset: offset,
        fitted_slope: slope,
        validation,
        created_at: OffsetDateTime::now_utc(),
    })
}

/// Fold a calibration record into a device's active calibration.
///
/// A passing record replaces offset/slope and pushes the due date out by
/// `interval_days`; a failing one only raises the `needs_calibration` flag
/// and leaves the previous fit active.
pub fn adopt(current: &Calibration, record: &CalibrationRecord, interval_days: i64) -> Calibration {
    if record.validation.passed {
        Calibration {
            offset: record.fitted_offset,
            slope: record.fitted_slope,
            last_calibrated: Some(record.created_at),
            next_calibration_due: Some(record.created_at + Duration::days(interval_days)),
            needs_calibration: false,
        }
    } else {
        Calibration {
            needs_calibration: true,
            ..current.clone()
        }
    }
}

/// True once the due date has passed.
pub fn is_due(calibration: &Calibration, now: OffsetDateTime) -> bool {
    calibration
        .next_calibration_due
        .map(|due| now >= due)
        .unwrap_or(false)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn pairs(points: &[(f64, f64)]) -> Vec<ReferenceMeasurement> {
        points
            .iter()
            .map(|&(reference, measured)| ReferenceMeasurement {
                reference,
                measured,
                timestamp: OffsetDateTime::now_utc(),
            })
            .collect()
    }

    #[test]
    fn fit_recovers_exact_line() {
        // reference = 2·measured + 0.5
        let m = pairs(&[(2.5, 1.0), (4.5, 2.0), (6.5, 3.0), (8.5, 4.0)]);
        let f = fit(&m).unwrap();
        assert_abs_diff_eq!(f.slope, 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(f.offset, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn fit_rejects_single_point() {
        let m = pairs(&[(1.0, 1.0)]);
        assert!(matches!(
            fit(&m),
            Err(SensorError::InvalidCalibrationInput(_))
        ));
    }

    #[test]
    fn fit_rejects_zero_spread() {
        let m = pairs(&[(1.0, 3.0), (2.0, 3.0), (3.0, 3.0)]);
        assert!(matches!(
            fit(&m),
            Err(SensorError::InvalidCalibrationInput(_))
        ));
    }

    #[test]
    fn apply_uses_slope_then_offset() {
        let cal = Calibration {
            offset: -0.2,
            slope: 1.1,
            ..Calibration::default()
        };
        assert_abs_diff_eq!(apply(10.0, &cal), 10.8, epsilon = 1e-12);
    }

    #[test]
    fn applied_fit_reconstructs_references_within_accuracy() {
        // Slightly noisy EC probe readings against a lab meter.
        let m = pairs(&[
            (1.00, 0.93),
            (1.41, 1.30),
            (2.00, 1.86),
            (2.76, 2.55),
            (3.00, 2.80),
        ]);
        let f = fit(&m).unwrap();
        let v = validate(&m, f.offset, f.slope, DEFAULT_ACCURACY_THRESHOLD);
        assert!(v.passed, "validation failed: {v:?}");

        let cal = Calibration {
            offset: f.offset,
            slope: f.slope,
            ..Calibration::default()
        };
        let tolerance_pct = 100.0 - v.accuracy_percent;
        for p in &m {
            let got = apply(p.measured, &cal);
            let pct = (got - p.reference).abs() / p.reference * 100.0;
            // Each pair stays inside a few multiples of the mean error.
            assert!(
                pct <= tolerance_pct * m.len() as f64,
                "pair {p:?} off by {pct:.3}%"
            );
        }
    }

    #[test]
    fn validate_perfect_fit_scores_full_marks() {
        let m = pairs(&[(5.5, 5.0), (6.5, 6.0), (7.5, 7.0)]);
        let v = validate(&m, 0.5, 1.0, DEFAULT_ACCURACY_THRESHOLD);
        assert_abs_diff_eq!(v.accuracy_percent, 100.0, epsilon = 1e-9);
        assert_abs_diff_eq!(v.r2, 1.0, epsilon = 1e-9);
        assert!(v.passed);
    }

    #[test]
    fn validate_poor_fit_fails() {
        let m = pairs(&[(400.0, 100.0), (800.0, 900.0), (1200.0, 300.0)]);
        let f = fit(&m).unwrap();
        let v = validate(&m, f.offset, f.slope, DEFAULT_ACCURACY_THRESHOLD);
        assert!(!v.passed, "scattered data should fail: {v:?}");
        assert!(v.r2 < 0.5);
    }

    #[test]
    fn validate_zero_reference_uses_absolute_error() {
        let m = pairs(&[(0.0, 0.0), (10.0, 10.0)]);
        let v = validate(&m, 0.01, 1.0, DEFAULT_ACCURACY_THRESHOLD);
        // pair 1: |0.01| * 100 = 1%, pair 2: 0.01/10*100 = 0.1%  -> mean 0.55%
        assert_abs_diff_eq!(v.accuracy_percent, 99.45, epsilon = 1e-9);
    }

    #[test]
    fn adopt_passing_record_sets_due_date() {
        let m = pairs(&[(1.0, 1.0), (2.0, 2.0)]);
        let record = run("ec-1", m, DEFAULT_ACCURACY_THRESHOLD).unwrap();
        let next = adopt(&Calibration::default(), &record, 30);
        assert!(!next.needs_calibration);
        assert_eq!(
            next.next_calibration_due,
            Some(record.created_at + Duration::days(30))
        );
    }

    #[test]
    fn adopt_failing_record_keeps_previous_fit() {
        let current = Calibration {
            offset: 0.3,
            slope: 0.97,
            ..Calibration::default()
        };
        let m = pairs(&[(400.0, 100.0), (800.0, 900.0), (1200.0, 300.0)]);
        let record = run("co2-1", m, DEFAULT_ACCURACY_THRESHOLD).unwrap();
        assert!(!record.validation.passed);

        let next = adopt(&current, &record, 30);
        assert_eq!(next.offset, 0.3);
        assert_eq!(next.slope, 0.97);
        assert!(next.needs_calibration);
    }

    #[test]
    fn is_due_only_after_deadline() {
        let now = OffsetDateTime::now_utc();
        let mut cal = Calibration::default();
        assert!(!is_due(&cal, now));
        cal.next_calibration_due = Some(now + Duration::days(1));
        assert!(!is_due(&cal, now));
        cal.next_calibration_due = Some(now - Duration::hours(1));
        assert!(is_due(&cal, now));
    }
}
