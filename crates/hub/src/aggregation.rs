//! Group aggregation: reduce the latest reading of each live member into one
//! site/zone-level reading per parameter.

use std::collections::BTreeMap;

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::model::{AggregationMethod, ReadingQuality, SensorGroup, SensorReading};

#[derive(Debug, Clone, Serialize)]
pub struct AggregatedReading {
    pub group_id: String,
    pub method: AggregationMethod,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
    pub values: BTreeMap<String, f64>,
    /// Members whose readings went into the reduction.
    pub contributors: Vec<String>,
    /// Members with no fresh, usable reading.
    pub excluded: Vec<String>,
}

/// Reduce `latest` (member id → latest reading) for `group`.
///
/// Members without a reading younger than `freshness`, or whose latest
/// reading is bad quality, are excluded rather than counted as zero.
pub fn aggregate(
    group: &SensorGroup,
    latest: &BTreeMap<String, SensorReading>,
    freshness: Duration,
    now: OffsetDateTime,
) -> AggregatedReading {
    let mut contributors = Vec::new();
    let mut excluded = Vec::new();
    // parameter -> [(value, weight)]
    let mut samples: BTreeMap<&str, Vec<(f64, f64)>> = BTreeMap::new();

    for member in &group.member_sensor_ids {
        let usable = latest.get(member).filter(|r| {
            r.quality != ReadingQuality::Bad && now - r.timestamp <= freshness
        });
        let Some(reading) = usable else {
            excluded.push(member.clone());
            continue;
        };

        let weight = group.weights.get(member).copied().unwrap_or(1.0);
        for (param, &value) in &reading.values {
            samples.entry(param.as_str()).or_default().push((value, weight));
        }
        contributors.push(member.clone());
    }

    let values = samples
        .into_iter()
        .filter_map(|(param, s)| reduce(group.aggregation_method, &s).map(|v| (param.to_string(), v)))
        .collect();

    AggregatedReading {
        group_id: group.id.clone(),
        method: group.aggregation_method,
        computed_at: now,
        values,
        contributors,
        excluded,
    }
}

/// Reduce `(value, weight)` samples. `None` for an empty set or a zero
/// total weight.
pub fn reduce(method: AggregationMethod, samples: &[(f64, f64)]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    match method {
        AggregationMethod::Average => Some(samples.iter().map(|(v, _)| v).sum::<f64>() / n),
        AggregationMethod::Median => {
            let mut sorted: Vec<f64> = samples.iter().map(|(v, _)| *v).collect();
            sorted.sort_by(f64::total_cmp);
            Some(median_sorted(&sorted))
        }
        AggregationMethod::Min => samples.iter().map(|(v, _)| *v).reduce(f64::min),
        AggregationMethod::Max => samples.iter().map(|(v, _)| *v).reduce(f64::max),
        AggregationMethod::Weighted => {
            let total: f64 = samples.iter().map(|(_, w)| w).sum();
            if total == 0.0 {
                return None;
            }
            Some(samples.iter().map(|(v, w)| v * w).sum::<f64>() / total)
        }
    }
}

/// Median of an already-sorted, non-empty slice.
pub(crate) fn median_sorted(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

// ===========================================================================
// Tests
// ===========================================================================
