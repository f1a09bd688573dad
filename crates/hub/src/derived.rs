//! Derived climate metrics: VPD, leaf VPD, dew point and DLI.
//!
//! Saturation vapor pressure uses the Tetens approximation (kPa, °C):
//! `svp = 0.6108 · e^(17.27·T / (T + 237.3))`.

use std::collections::BTreeMap;

const TETENS_A: f64 = 0.6108;
const TETENS_B: f64 = 17.27;
const TETENS_C: f64 = 237.3;

/// Inputs gathered for one derivation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateInputs {
    pub air_temp: f64,
    pub relative_humidity: f64,
    pub leaf_temp: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedMetrics {
    pub vpd: f64,
    pub leaf_vpd: Option<f64>,
    pub dew_point: Option<f64>,
}

/// Saturation vapor pressure in kPa.
pub fn saturation_vapor_pressure(temp_c: f64) -> f64 {
    TETENS_A * (TETENS_B * temp_c / (temp_c + TETENS_C)).exp()
}

/// Actual vapor pressure from ambient temperature and RH (%).
pub fn actual_vapor_pressure(air_temp: f64, relative_humidity: f64) -> f64 {
    (relative_humidity / 100.0) * saturation_vapor_pressure(air_temp)
}

pub fn vpd(air_temp: f64, relative_humidity: f64) -> f64 {
    saturation_vapor_pressure(air_temp) - actual_vapor_pressure(air_temp, relative_humidity)
}

/// Leaf-to-air VPD: saturation at leaf temperature, actual vapor pressure
/// still from the ambient air.
pub fn leaf_vpd(air_temp: f64, relative_humidity: f64, leaf_temp: f64) -> f64 {
    saturation_vapor_pressure(leaf_temp) - actual_vapor_pressure(air_temp, relative_humidity)
}

/// Magnus dew point (°C). `None` when RH is not strictly positive.
pub fn dew_point(air_temp: f64, relative_humidity: f64) -> Option<f64> {
    if relative_humidity <= 0.0 {
        return None;
    }
    let gamma = TETENS_B * air_temp / (TETENS_C + air_temp) + (relative_humidity / 100.0).ln();
    Some(TETENS_C * gamma / (TETENS_B - gamma))
}

/// Daily light integral (mol·m⁻²·day⁻¹) from an average PPFD held for
/// `photoperiod_hours`.
pub fn daily_light_integral(ppfd: f64, photoperiod_hours: f64) -> f64 {
    ppfd * photoperiod_hours * 3600.0 / 1_000_000.0
}

pub fn compute(inputs: ClimateInputs) -> DerivedMetrics {
    let ClimateInputs {
        air_temp,
        relative_humidity,
        leaf_temp,
    } = inputs;
    DerivedMetrics {
        vpd: vpd(air_temp, relative_humidity),
        leaf_vpd: leaf_temp.map(|lt| leaf_vpd(air_temp, relative_humidity, lt)),
        dew_point: dew_point(air_temp, relative_humidity),
    }
}

/// Merge derived values next to the measured ones.
pub fn merge_into(values: &mut BTreeMap<String, f64>, metrics: &DerivedMetrics) {
    values.insert("vpd".into(), metrics.vpd);
    if let Some(lv) = metrics.leaf_vpd {
        values.insert("leaf_vpd".into(), lv);
    }
    if let Some(dp) = metrics.dew_point {
        values.insert("dew_point".into(), dp);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn svp_at_reference_temperatures() {
        assert_abs_diff_eq!(saturation_vapor_pressure(0.0), 0.6108, epsilon = 1e-9);
        assert_abs_diff_eq!(saturation_vapor_pressure(25.0), 3.1678, epsilon = 1e-3);
    }

    #[test]
    fn vpd_at_25c_60pct() {
        assert_abs_diff_eq!(vpd(25.0, 60.0), 1.27, epsilon = 0.01);
    }

    #[test]
    fn vpd_is_zero_at_saturation() {
        assert_abs_diff_eq!(vpd(22.0, 100.0), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn cooler_leaf_lowers_leaf_vpd() {
        let air = vpd(26.0, 65.0);
        let leaf = leaf_vpd(26.0, 65.0, 24.0);
        assert!(leaf < air, "leaf {leaf} should be below air {air}");
    }

    #[test]
    fn leaf_vpd_equals_vpd_when_leaf_matches_air() {
        assert_abs_diff_eq!(leaf_vpd(24.0, 55.0, 24.0), vpd(24.0, 55.0), epsilon = 1e-12);
    }

    #[test]
    fn dew_point_matches_air_at_saturation() {
        assert_abs_diff_eq!(dew_point(20.0, 100.0).unwrap(), 20.0, epsilon = 1e-9);
        assert!(dew_point(20.0, 0.0).is_none());
    }

    #[test]
    fn dli_from_constant_ppfd() {
        // 500 µmol/m²/s for 12 h = 21.6 mol/m²/day
        assert_abs_diff_eq!(daily_light_integral(500.0, 12.0), 21.6, epsilon = 1e-9);
    }

    #[test]
    fn merge_adds_leaf_vpd_only_when_available() {
        let mut values = BTreeMap::from([("temperature".to_string(), 25.0)]);
        merge_into(
            &mut values,
            &compute(ClimateInputs {
                air_temp: 25.0,
                relative_humidity: 60.0,
                leaf_temp: None,
            }),
        );
        assert!(values.contains_key("vpd"));
        assert!(values.contains_key("dew_point"));
        assert!(!values.contains_key("leaf_vpd"));
    }
}
