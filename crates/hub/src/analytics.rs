//! Historical analytics over one device's readings: descriptive
//! statistics, quartile trend, 3σ anomalies, uptime and error rate.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use time::OffsetDateTime;

use crate::aggregation::median_sorted;
use crate::model::{ReadingQuality, SensorReading, SensorStatus};

/// Percent change below which a trend counts as stable.
const STABLE_BAND_PCT: f64 = 5.0;

/// Standard deviations from the mean beyond which a point is anomalous.
const ANOMALY_SIGMA: f64 = 3.0;

/// Retained history entries per device.
const MAX_HISTORY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParameterStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    /// Population standard deviation.
    pub std_dev: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParameterTrend {
    pub direction: TrendDirection,
    pub percent_change: f64,
    pub first_quartile_mean: f64,
    pub last_quartile_mean: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub parameter: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub value: f64,
    pub expected_min: f64,
    pub expected_max: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsReport {
    pub sensor_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    pub sample_count: usize,
    pub statistics: BTreeMap<String, ParameterStats>,
    pub trends: BTreeMap<String, ParameterTrend>,
    pub anomalies: Vec<Anomaly>,
    /// Fraction of the window the device was connected, 0.0..=1.0.
    pub uptime: f64,
    /// Failed reads / attempted reads inside the window.
    pub error_rate: Option<f64>,
}

// ---------------------------------------------------------------------------
// Connection / read history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadAttempt {
    pub at: OffsetDateTime,
    pub ok: bool,
}

/// Status transitions and read outcomes for one device, oldest first.
#[derive(Debug, Clone, Default)]
pub struct DeviceHistory {
    transitions: VecDeque<(OffsetDateTime, SensorStatus)>,
    attempts: VecDeque<ReadAttempt>,
}

impl DeviceHistory {
    pub fn record_status(&mut self, at: OffsetDateTime, status: SensorStatus) {
        if self.transitions.back().map(|(_, s)| *s) == Some(status) {
            return;
        }
        if self.transitions.len() >= MAX_HISTORY {
            self.transitions.pop_front();
        }
        self.transitions.push_back((at, status));
    }

    pub fn record_attempt(&mut self, at: OffsetDateTime, ok: bool) {
        if self.attempts.len() >= MAX_HISTORY {
            self.attempts.pop_front();
        }
        self.attempts.push_back(ReadAttempt { at, ok });
    }

    /// Connected fraction of `[start, end]`. Time before the first known
    /// transition counts as disconnected.
    pub fn uptime(&self, start: OffsetDateTime, end: OffsetDateTime) -> f64 {
        let window = (end - start).as_seconds_f64();
        if window <= 0.0 {
            return 0.0;
        }

        let mut connected = self
            .transitions
            .iter()
            .take_while(|(at, _)| *at <= start)
            .last()
            .map(|(_, s)| s.is_connected())
            .unwrap_or(false);
        let mut cursor = start;
        let mut disconnected = 0.0;

        for (at, status) in self.transitions.iter().filter(|(at, _)| *at > start && *at < end) {
            if !connected {
                disconnected += (*at - cursor).as_seconds_f64();
            }
            cursor = *at;
            connected = status.is_connected();
        }
        if !connected {
            disconnected += (end - cursor).as_seconds_f64();
        }

        ((window - disconnected) / window).clamp(0.0, 1.0)
    }

    pub fn error_rate(&self, start: OffsetDateTime, end: OffsetDateTime) -> Option<f64> {
        let (total, failed) = self
            .attempts
            .iter()
            .filter(|a| a.at >= start && a.at <= end)
            .fold((0usize, 0usize), |(t, f), a| (t + 1, f + usize::from(!a.ok)));
        (total > 0).then(|| failed as f64 / total as f64)
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Per-parameter series in time order, bad-quality readings dropped.
fn series(readings: &[SensorReading]) -> BTreeMap<&str, Vec<(OffsetDateTime, f64)>> {
    let mut ordered: Vec<&SensorReading> = readings
        .iter()
        .filter(|r| r.quality != ReadingQuality::Bad)
        .collect();
    ordered.sort_by_key(|r| r.timestamp);

    let mut out: BTreeMap<&str, Vec<(OffsetDateTime, f64)>> = BTreeMap::new();
    for r in ordered {
        for (param, &v) in &r.values {
            out.entry(param.as_str()).or_default().push((r.timestamp, v));
        }
    }
    out
}

pub fn describe(values: &[f64]) -> Option<ParameterStats> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    Some(ParameterStats {
        count: values.len(),
        mean,
        median: median_sorted(&sorted),
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        std_dev: variance.sqrt(),
    })
}

pub fn statistics(readings: &[SensorReading]) -> BTreeMap<String, ParameterStats> {
    series(readings)
        .into_iter()
        .filter_map(|(param, s)| {
            let values: Vec<f64> = s.iter().map(|(_, v)| *v).collect();
            describe(&values).map(|st| (param.to_string(), st))
        })
        .collect()
}

/// Compare the first and last quartiles (by time) of a series.
pub fn trend(values: &[f64]) -> Option<ParameterTrend> {
    if values.len() < 2 {
        return None;
    }
    let q = (values.len() / 4).max(1);
    let mean = |s: &[f64]| s.iter().sum::<f64>() / s.len() as f64;
    let first = mean(&values[..q]);
    let last = mean(&values[values.len() - q..]);

    let percent_change = if first == 0.0 {
        if last == 0.0 {
            0.0
        } else {
            100.0 * last.signum()
        }
    } else {
        (last - first) / first.abs() * 100.0
    };

    let direction = if percent_change.abs() < STABLE_BAND_PCT {
        TrendDirection::Stable
    } else if percent_change > 0.0 {
        TrendDirection::Increasing
    } else {
        TrendDirection::Decreasing
    };

    Some(ParameterTrend {
        direction,
        percent_change,
        first_quartile_mean: first,
        last_quartile_mean: last,
    })
}

pub fn trends(readings: &[SensorReading]) -> BTreeMap<String, ParameterTrend> {
    series(readings)
        .into_iter()
        .filter_map(|(param, s)| {
            let values: Vec<f64> = s.iter().map(|(_, v)| *v).collect();
            trend(&values).map(|t| (param.to_string(), t))
        })
        .collect()
}

/// Points further than 3σ from their parameter's window mean.
pub fn anomalies(readings: &[SensorReading]) -> Vec<Anomaly> {
    let mut out = Vec::new();
    for (param, s) in series(readings) {
        let values: Vec<f64> = s.iter().map(|(_, v)| *v).collect();
        let Some(stats) = describe(&values) else {
            continue;
        };
        if stats.std_dev == 0.0 {
            continue;
        }
        let band = ANOMALY_SIGMA * stats.std_dev;
        let (lo, hi) = (stats.mean - band, stats.mean + band);
        out.extend(
            s.iter()
                .filter(|(_, v)| *v < lo || *v > hi)
                .map(|(ts, v)| Anomaly {
                    parameter: param.to_string(),
                    timestamp: *ts,
                    value: *v,
                    expected_min: lo,
                    expected_max: hi,
                }),
        );
    }
    out.sort_by_key(|a| a.timestamp);
    out
}

pub fn analyze(
    sensor_id: &str,
    readings: &[SensorReading],
    history: Option<&DeviceHistory>,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> AnalyticsReport {
    AnalyticsReport {
        sensor_id: sensor_id.to_string(),
        start,
        end,
        sample_count: readings.len(),
        statistics: statistics(readings),
        trends: trends(readings),
        anomalies: anomalies(readings),
        uptime: history.map(|h| h.uptime(start, end)).unwrap_or(0.0),
        error_rate: history.and_then(|h| h.error_rate(start, end)),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use time::Duration;

    fn readings(values: &[f64], start: OffsetDateTime) -> Vec<SensorReading> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| SensorReading {
                sensor_id: "t-1".into(),
                timestamp: start + Duration::minutes(i as i64),
                values: BTreeMap::from([("temperature".to_string(), v)]),
                quality: ReadingQuality::Good,
                raw_value: None,
            })
            .collect()
    }

    #[test]
    fn describe_basic_statistics() {
        let s = describe(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(s.count, 8);
        assert_abs_diff_eq!(s.mean, 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s.std_dev, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s.median, 4.5, epsilon = 1e-12);
        assert_eq!(s.min, 2.0);
        assert_eq!(s.max, 9.0);
    }

    #[test]
    fn trend_directions() {
        let rising = [20.0, 20.5, 21.0, 22.0, 23.0, 24.0, 25.0, 26.0];
        let flat = [20.0, 20.1, 19.9, 20.0, 20.2, 20.0, 19.8, 20.1];
        let falling = [1500.0, 1400.0, 1300.0, 1200.0, 1000.0, 900.0, 800.0, 700.0];
        assert_eq!(trend(&rising).unwrap().direction, TrendDirection::Increasing);
        assert_eq!(trend(&flat).unwrap().direction, TrendDirection::Stable);
        assert_eq!(trend(&falling).unwrap().direction, TrendDirection::Decreasing);
        assert!(trend(&[1.0]).is_none());
    }

    #[test]
    fn trend_uses_time_order_not_input_order() {
        let start = OffsetDateTime::now_utc();
        let mut r = readings(&[10.0, 10.0, 10.0, 10.0, 20.0, 20.0, 20.0, 20.0], start);
        r.reverse();
        let t = &trends(&r)["temperature"];
        assert_eq!(t.direction, TrendDirection::Increasing);
        assert_abs_diff_eq!(t.percent_change, 100.0, epsilon = 1e-9);
    }

    #[test]
    fn injected_five_sigma_point_is_flagged() {
        let start = OffsetDateTime::now_utc();
        // Alternating 9/11 gives mean 10, σ 1.
        let mut values: Vec<f64> = (0..40).map(|i| if i % 2 == 0 { 9.0 } else { 11.0 }).collect();
        values.push(15.0);
        let found = anomalies(&readings(&values, start));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, 15.0);
        assert!(found[0].expected_max < 15.0);
    }

    #[test]
    fn points_within_two_sigma_are_not_flagged() {
        let start = OffsetDateTime::now_utc();
        let values: Vec<f64> = (0..30).map(|i| 10.0 + ((i % 5) as f64 - 2.0)).collect();
        assert!(anomalies(&readings(&values, start)).is_empty());
    }

    #[test]
    fn constant_series_has_no_anomalies() {
        let start = OffsetDateTime::now_utc();
        assert!(anomalies(&readings(&[5.0; 40], start)).is_empty());
    }

    #[test]
    fn bad_readings_are_left_out() {
        let start = OffsetDateTime::now_utc();
        let mut r = readings(&[20.0, 22.0], start);
        r[1].quality = ReadingQuality::Bad;
        let stats = statistics(&r);
        assert_eq!(stats["temperature"].count, 1);
    }

    #[test]
    fn uptime_subtracts_disconnected_spans() {
        let start = OffsetDateTime::now_utc();
        let end = start + Duration::hours(10);
        let mut h = DeviceHistory::default();
        h.record_status(start - Duration::hours(1), SensorStatus::Connected);
        h.record_status(start + Duration::hours(2), SensorStatus::Disconnected);
        h.record_status(start + Duration::hours(4), SensorStatus::Connected);
        h.record_status(start + Duration::hours(9), SensorStatus::Error);
        // down 2h + 1h of 10h
        assert_abs_diff_eq!(h.uptime(start, end), 0.7, epsilon = 1e-9);
    }

    #[test]
    fn uptime_without_history_is_zero() {
        let start = OffsetDateTime::now_utc();
        let h = DeviceHistory::default();
        assert_eq!(h.uptime(start, start + Duration::hours(1)), 0.0);
    }

    #[test]
    fn error_rate_counts_window_only() {
        let start = OffsetDateTime::now_utc();
        let mut h = DeviceHistory::default();
        h.record_attempt(start - Duration::minutes(5), false);
        for i in 0..8 {
            h.record_attempt(start + Duration::minutes(i), i % 4 != 0);
        }
        let rate = h.error_rate(start, start + Duration::hours(1)).unwrap();
        assert_abs_diff_eq!(rate, 0.25, epsilon = 1e-12);
        assert!(h
            .error_rate(start + Duration::days(1), start + Duration::days(2))
            .is_none());
    }
}
