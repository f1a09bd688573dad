//! Stateful environmental sensor simulator for benches without hardware.
//!
//! Each channel follows one parameter (temperature, humidity, CO₂, PPFD,
//! EC, pH, ...) and models:
//! - Temporal coherence via random walk with mean reversion
//! - Optional slow drift (probe ageing)
//! - Per-reading electronic noise
//! - Occasional spikes (flaky probe or cabling)
//! - Diurnal (lights on / lights off) cycle
//! - Per-channel offsets so two probes in the same room disagree a little

use std::f64::consts::PI;
use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6 is close to N(0,1).
fn approx_std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profile selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Hovers around the parameter's set point. Rare spikes.
    Stable,
    /// Creeps steadily upward; lets threshold alerts fire after a while.
    Drifting,
    /// Heavy noise and frequent spikes. Exercises quality grading and
    /// anomaly detection on the hub.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "drifting" | "drift" => Self::Drifting,
            "flaky" => Self::Flaky,
            _ => Self::Stable,
        }
    }

    /// (drift in walk-sigmas per sample, noise multiplier, spike probability)
    fn shape(self) -> (f64, f64, f32) {
        match self {
            Self::Stable => (0.0, 1.0, 0.005),
            Self::Drifting => (2.0, 1.0, 0.01),
            Self::Flaky => (0.0, 4.0, 0.10),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Drifting => write!(f, "drifting"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Parameter profiles
// ---------------------------------------------------------------------------

/// How one parameter behaves in a typical grow room.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Profile {
    pub center: f64,
    pub walk_sigma: f64,
    pub mean_reversion: f64,
    pub noise_sigma: f64,
    /// Peak swing at mid-photoperiod; negative moves against the lights.
    pub diurnal_amplitude: f64,
    pub min: f64,
    pub max: f64,
}

pub fn profile(parameter: &str) -> Option<Profile> {
    let p = |center, walk_sigma, noise_sigma, diurnal_amplitude, min, max| Profile {
        center,
        walk_sigma,
        mean_reversion: 0.05,
        noise_sigma,
        diurnal_amplitude,
        min,
        max,
    };
    Some(match parameter {
        "temperature" => p(24.0, 0.15, 0.05, 3.0, -40.0, 85.0),
        "leaf_temperature" => p(23.0, 0.15, 0.05, 2.5, -40.0, 85.0),
        "humidity" => p(60.0, 0.8, 0.3, -8.0, 0.0, 100.0),
        "co2" => p(900.0, 15.0, 5.0, -150.0, 0.0, 10_000.0),
        "ppfd" => p(600.0, 10.0, 5.0, 500.0, 0.0, 3_000.0),
        "ec" => p(2.0, 0.02, 0.01, 0.0, 0.0, 20.0),
        "ph" => p(6.0, 0.02, 0.01, 0.0, 0.0, 14.0),
        "moisture" => p(45.0, 0.5, 0.2, -2.0, 0.0, 100.0),
        _ => return None,
    })
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

struct Channel {
    profile: Profile,
    /// Current "true" value. Evolves each sample.
    base: f64,
    /// Permanent per-probe bias.
    offset: f64,
    noise_sigma: f64,
}

pub struct EnvironmentSim {
    channels: Vec<Channel>,
    drift_walks: f64,
    spike_prob: f32,
    diurnal_period_s: f64,
}

impl EnvironmentSim {
    /// One channel per entry of `parameters`; unknown names are rejected.
    ///
    /// `diurnal_period_s` is the day length: 86400 for real time, something
    /// like 600 for quick iteration.
    pub fn new(scenario: Scenario, parameters: &[&str], diurnal_period_s: f64) -> anyhow::Result<Self> {
        let (drift_walks, noise_mult, spike_prob) = scenario.shape();
        let channels = parameters
            .iter()
            .map(|name| {
                let profile = profile(name).ok_or_else(|| anyhow::anyhow!("no simulation profile for parameter {name:?}"))?;
                let span = profile.max - profile.min;
                let sigma = profile.noise_sigma * noise_mult;
                Ok(Channel {
                    profile,
                    base: profile.center + gaussian(0.0, profile.walk_sigma * 3.0),
                    offset: gaussian(0.0, (span * 0.0005).min(profile.walk_sigma)),
                    noise_sigma: sigma * (1.0 + 0.2 * approx_std_normal()).max(0.3),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            channels,
            drift_walks,
            spike_prob,
            diurnal_period_s,
        })
    }

    /// Next value for channel `index` at `t_secs` (any monotonic clock; only
    /// the diurnal phase depends on it).
    pub fn sample_at(&mut self, index: usize, t_secs: f64) -> f64 {
        let ch = &mut self.channels[index];
        let p = ch.profile;

        let pull = p.mean_reversion * (p.center - ch.base);
        let walk = gaussian(0.0, p.walk_sigma);
        let drift = self.drift_walks * p.walk_sigma;
        // The drifting scenario may wander well past the set point, but the
        // true value still stays physical.
        ch.base = (ch.base + pull + walk + drift).clamp(p.min, p.max);

        let phase = 2.0 * PI * t_secs / self.diurnal_period_s;
        let diurnal = p.diurnal_amplitude * phase.sin();
        let noise = gaussian(0.0, ch.noise_sigma);
        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, p.walk_sigma * 20.0)
        } else {
            0.0
        };

        (ch.base + ch.offset + diurnal + noise + spike).clamp(p.min, p.max)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
