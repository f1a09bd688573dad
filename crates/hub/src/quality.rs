//! Reading quality grading.
//!
//! `bad` means the value is physically impossible for the parameter (the
//! probe or its wiring is broken), `questionable` means it is possible but
//! moved faster than the parameter can plausibly change since the previous
//! reading from the same device.

use time::OffsetDateTime;

use crate::model::{ReadingQuality, ValueRange};

/// Physical limits and plausible change rate for one parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicalLimits {
    pub range: ValueRange,
    /// Largest believable change, in parameter units per minute.
    pub max_change_per_min: f64,
}

/// Built-in limits keyed by parameter name. Unknown parameters are only
/// checked for finiteness.
pub fn physical_limits(parameter: &str) -> Option<PhysicalLimits> {
    let (min, max, rate) = match parameter {
        "temperature" | "leaf_temperature" => (-40.0, 85.0, 5.0),
        "humidity" => (0.0, 100.0, 20.0),
        "ec" => (0.0, 20.0, 1.0),
        "ph" => (0.0, 14.0, 1.0),
        "moisture" => (0.0, 100.0, 15.0),
        "co2" => (0.0, 10_000.0, 800.0),
        // Lights switch on and off in one step.
        "ppfd" => (0.0, 3_000.0, 2_500.0),
        _ => return None,
    };
    Some(PhysicalLimits {
        range: ValueRange::new(min, max),
        max_change_per_min: rate,
    })
}

/// The previous accepted value for the same device and parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorValue {
    pub value: f64,
    pub at: OffsetDateTime,
}

pub fn assess(
    parameter: &str,
    value: f64,
    at: OffsetDateTime,
    prior: Option<PriorValue>,
) -> ReadingQuality {
    if !value.is_finite() {
        return ReadingQuality::Bad;
    }
    let Some(limits) = physical_limits(parameter) else {
        return ReadingQuality::Good;
    };
    if !limits.range.contains(value) {
        return ReadingQuality::Bad;
    }

    if let Some(prior) = prior {
        // Floor at one second so back-to-back samples don't divide by zero.
        let elapsed_min = ((at - prior.at).as_seconds_f64().abs().max(1.0)) / 60.0;
        let rate = (value - prior.value).abs() / elapsed_min;
        if rate > limits.max_change_per_min {
            return ReadingQuality::Questionable;
        }
    }

    ReadingQuality::Good
}

// ===========================================================================
// Tests
// ===========================================================================
