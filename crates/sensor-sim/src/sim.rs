//! Stateful telemetry feed simulator for local development.
//!
//! Each (sensor, channel) pair follows a bounded random walk with mean
//! reversion inside the channel's mock range, so successive polls look like
//! a real feed rather than fresh noise. Scenarios add outages, dropped
//! channels and garbage values to exercise the panel's fallback paths.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

use irrigation_panel::telemetry::{
    tank_level_channel, MockRange, MockValue, Subsystem, TANK_LEVELS_KEY, TANK_LEVEL_MOCK,
};

/// Walk bounds for valve flow, which has no fixed mock range on the panel.
const VALVE_FLOW: MockRange = MockRange::new(30.0, 20.0);

/// Strength of the pull back toward the middle of the range, per poll.
const MEAN_REVERSION: f64 = 0.1;

// ---------------------------------------------------------------------------
// Gaussian approximation
// ---------------------------------------------------------------------------

/// Irwin-Hall approximation of N(0,1): sum of 12 uniforms minus 6.
fn approx_std_normal(rng: &mut fastrand::Rng) -> f64 {
    (0..12).map(|_| rng.f64()).sum::<f64>() - 6.0
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Feed behaviour selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Every poll succeeds with every channel. Slow drift.
    Stable,
    /// ~20% of polls fail, ~15% of channels go missing and ~5% carry
    /// unparsable values. Larger steps.
    Flaky,
    /// Every poll fails; the panel should show mock data throughout.
    Offline,
}

struct Profile {
    outage_prob: f64,
    drop_prob: f64,
    garbage_prob: f64,
    /// Walk sigma as a fraction of the channel's spread.
    walk_frac: f64,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "flaky" => Self::Flaky,
            "offline" => Self::Offline,
            _ => Self::Stable, // default
        }
    }

    fn profile(self) -> Profile {
        match self {
            Self::Stable => Profile {
                outage_prob: 0.0,
                drop_prob: 0.0,
                garbage_prob: 0.0,
                walk_frac: 0.02,
            },
            Self::Flaky => Profile {
                outage_prob: 0.2,
                drop_prob: 0.15,
                garbage_prob: 0.05,
                walk_frac: 0.08,
            },
            Self::Offline => Profile {
                outage_prob: 1.0,
                drop_prob: 0.0,
                garbage_prob: 0.0,
                walk_frac: 0.0,
            },
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedError {
    /// The sensor id does not name a motor, valve or fertigation feed.
    UnknownSensor,
    /// Simulated outage.
    Unavailable,
}

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSensor => write!(f, "unknown sensor"),
            Self::Unavailable => write!(f, "sensor feed unavailable"),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct FeedSim {
    scenario: Scenario,
    tank_ids: Vec<String>,
    rng: fastrand::Rng,
    /// Current walk value per `"{sensor_id}/{channel}"`.
    walks: HashMap<String, f64>,
}

impl FeedSim {
    pub fn new(scenario: Scenario, tank_ids: Vec<String>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        Self {
            scenario,
            tank_ids,
            rng,
            walks: HashMap::new(),
        }
    }

    pub fn scenario(&self) -> Scenario {
        self.scenario
    }

    /// Next payload for `sensor_id`, in the shape the panel fetches: a JSON
    /// object of numeric strings, plus `tankLevels` on the fertigation feed.
    pub fn payload(&mut self, sensor_id: &str) -> Result<Value, FeedError> {
        let subsystem = Subsystem::from_sensor_id(sensor_id).ok_or(FeedError::UnknownSensor)?;
        let profile = self.scenario.profile();

        if self.rng.f64() < profile.outage_prob {
            return Err(FeedError::Unavailable);
        }

        let mut body = Map::new();
        for spec in subsystem.channels() {
            let range = match spec.mock {
                MockValue::Range(r) | MockValue::PumpFlow(r) => r,
                MockValue::ValveFlow => VALVE_FLOW,
            };
            let key = format!("{sensor_id}/{}", spec.name);
            if let Some(value) = self.channel(&key, range, spec.decimals + 1, &profile) {
                body.insert(spec.name.to_string(), value);
            }
        }

        if subsystem == Subsystem::Fertigation {
            let mut levels = Map::new();
            for tank_id in self.tank_ids.clone() {
                let key = format!("{sensor_id}/{}", tank_level_channel(&tank_id));
                if let Some(value) = self.channel(&key, TANK_LEVEL_MOCK, 1, &profile) {
                    levels.insert(tank_id, value);
                }
            }
            body.insert(TANK_LEVELS_KEY.to_string(), Value::Object(levels));
        }

        Ok(Value::Object(body))
    }

    /// Step one walk and render it, or drop or garble it per the profile.
    fn channel(
        &mut self,
        key: &str,
        range: MockRange,
        decimals: usize,
        profile: &Profile,
    ) -> Option<Value> {
        let value = self.step(key, range, profile.walk_frac);

        if self.rng.f64() < profile.drop_prob {
            return None;
        }
        if self.rng.f64() < profile.garbage_prob {
            return Some(Value::String("err".into()));
        }
        Some(Value::String(format!("{value:.decimals$}")))
    }

    fn step(&mut self, key: &str, range: MockRange, walk_frac: f64) -> f64 {
        let lo = range.base;
        let hi = range.base + range.spread;
        let center = lo + range.spread / 2.0;

        let current = match self.walks.get(key) {
            Some(v) => *v,
            None => center + approx_std_normal(&mut self.rng) * range.spread * 0.1,
        };
        let pull = MEAN_REVERSION * (center - current);
        let walk = approx_std_normal(&mut self.rng) * range.spread * walk_frac;
        let next = (current + pull + walk).clamp(lo, hi);

        self.walks.insert(key.to_string(), next);
        next
    }
}

// ===========================================================================
// Tests
// ===========================================================================
