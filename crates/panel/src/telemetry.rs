//! Sensor-reading normalization.
//!
//! A telemetry payload is turned into a [`SensorReading`] along one of two
//! paths, chosen once per call:
//!
//! - **live**: the API returned a JSON object. Each expected channel is
//!   formatted to its fixed precision; a channel that is missing or not
//!   numeric renders as [`UNAVAILABLE`].
//! - **mock**: the fetch failed or returned nothing. The whole record is
//!   generated from the per-channel mock ranges. Live and mock values are
//!   never mixed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::numeric::{parse_lenient, to_fixed};

/// Display sentinel for "no data".
pub const UNAVAILABLE: &str = "--";

// ---------------------------------------------------------------------------
// Subsystems and channel tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    Motor,
    Valve,
    Fertigation,
}

impl Subsystem {
    /// Device type segment of the telemetry sensor id.
    pub fn device_type(self) -> &'static str {
        match self {
            Self::Motor => "motor",
            Self::Valve => "valve",
            Self::Fertigation => "fertigation_system",
        }
    }

    /// Recover the subsystem from a sensor id such as `motor_m1`.
    pub fn from_sensor_id(sensor_id: &str) -> Option<Self> {
        // fertigation_system_ must be checked before any shorter prefix.
        [Self::Fertigation, Self::Motor, Self::Valve]
            .into_iter()
            .find(|s| {
                sensor_id
                    .strip_prefix(s.device_type())
                    .is_some_and(|rest| rest.starts_with('_'))
            })
    }

    pub fn channels(self) -> &'static [ChannelSpec] {
        match self {
            Self::Motor => MOTOR_CHANNELS,
            Self::Valve => VALVE_CHANNELS,
            Self::Fertigation => FERTIGATION_CHANNELS,
        }
    }
}

/// Uniform mock distribution over `[base, base + spread)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MockRange {
    pub base: f64,
    pub spread: f64,
}

impl MockRange {
    pub const fn new(base: f64, spread: f64) -> Self {
        Self { base, spread }
    }

    pub fn sample(&self, rng: &mut fastrand::Rng) -> f64 {
        self.base + rng.f64() * self.spread
    }

    /// Whether a formatted value can have come from this range. Rounding may
    /// lift a sample onto the upper bound, so the check is inclusive.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.base && value <= self.base + self.spread
    }
}

/// How a channel is synthesized on the mock path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockValue {
    Range(MockRange),
    /// The valve's configured flow while open, `"0"` while closed.
    ValveFlow,
    /// Random within range while the dosing pump runs, `"0"` while stopped.
    PumpFlow(MockRange),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSpec {
    pub name: &'static str,
    pub decimals: usize,
    pub mock: MockValue,
}

impl ChannelSpec {
    const fn ranged(name: &'static str, decimals: usize, base: f64, spread: f64) -> Self {
        Self {
            name,
            decimals,
            mock: MockValue::Range(MockRange::new(base, spread)),
        }
    }
}

const MOTOR_CHANNELS: &[ChannelSpec] = &[
    ChannelSpec::ranged("current", 1, 5.0, 10.0),
    ChannelSpec::ranged("voltage", 0, 380.0, 50.0),
    ChannelSpec::ranged("temperature", 1, 40.0, 20.0),
    ChannelSpec::ranged("powerFactor", 2, 0.85, 0.3),
];

const VALVE_CHANNELS: &[ChannelSpec] = &[
    ChannelSpec::ranged("moisture", 1, 40.0, 30.0),
    ChannelSpec::ranged("pressure", 1, 30.0, 20.0),
    ChannelSpec::ranged("pH", 1, 6.0, 2.0),
    ChannelSpec {
        name: "flowRate",
        decimals: 1,
        mock: MockValue::ValveFlow,
    },
    ChannelSpec::ranged("temperature", 1, 20.0, 10.0),
];

const FERTIGATION_CHANNELS: &[ChannelSpec] = &[
    ChannelSpec::ranged("ec", 1, 1.0, 2.0),
    ChannelSpec::ranged("pH", 1, 6.5, 1.0),
    ChannelSpec::ranged("temperature", 1, 20.0, 5.0),
    ChannelSpec::ranged("pressure", 1, 30.0, 10.0),
    ChannelSpec {
        name: "flowRate",
        decimals: 1,
        mock: MockValue::PumpFlow(MockRange::new(5.0, 10.0)),
    },
];

/// Payload key holding the per-tank level object on the fertigation feed.
pub const TANK_LEVELS_KEY: &str = "tankLevels";
/// Tank levels are whole percentages.
pub const TANK_LEVEL_DECIMALS: usize = 0;
pub const TANK_LEVEL_MOCK: MockRange = MockRange::new(0.0, 100.0);

/// Reading channel name for a tank's level.
pub fn tank_level_channel(tank_id: &str) -> String {
    format!("{tank_id}.level")
}

// ---------------------------------------------------------------------------
// Normalization target and result
// ---------------------------------------------------------------------------

/// What is being read, with the device status the mock path needs.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryTarget {
    Motor {
        running: bool,
    },
    Valve {
        open: bool,
        configured_flow: String,
    },
    Fertigation {
        pump_running: bool,
        tank_ids: Vec<String>,
    },
}

impl TelemetryTarget {
    pub fn subsystem(&self) -> Subsystem {
        match self {
            Self::Motor { .. } => Subsystem::Motor,
            Self::Valve { .. } => Subsystem::Valve,
            Self::Fertigation { .. } => Subsystem::Fertigation,
        }
    }

    /// Every channel name a reading for this target carries.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .subsystem()
            .channels()
            .iter()
            .map(|c| c.name.to_string())
            .collect();
        if let Self::Fertigation { tank_ids, .. } = self {
            names.extend(tank_ids.iter().map(|id| tank_level_channel(id)));
        }
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingSource {
    /// Placeholder written while a fetch is outstanding.
    Pending,
    Live,
    Mock,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub subsystem: Subsystem,
    pub source: ReadingSource,
    pub channels: BTreeMap<String, String>,
    pub is_loading: bool,
}

impl SensorReading {
    /// Transient placeholder: every channel unavailable, `is_loading` set.
    pub fn loading(target: &TelemetryTarget) -> Self {
        Self {
            subsystem: target.subsystem(),
            source: ReadingSource::Pending,
            channels: target
                .channel_names()
                .into_iter()
                .map(|name| (name, UNAVAILABLE.to_string()))
                .collect(),
            is_loading: true,
        }
    }

    pub fn get(&self, channel: &str) -> Option<&str> {
        self.channels.get(channel).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Normalize
// ---------------------------------------------------------------------------

/// Build the display reading for `target` from a fetched payload.
///
/// `raw` of `None`, or any JSON value that is not an object, selects the mock
/// path. The returned reading never has `is_loading` set.
pub fn normalize(
    target: &TelemetryTarget,
    raw: Option<&Value>,
    rng: &mut fastrand::Rng,
) -> SensorReading {
    match raw.and_then(Value::as_object) {
        Some(payload) => live_reading(target, payload),
        None => mock_reading(target, rng),
    }
}

fn live_reading(target: &TelemetryTarget, payload: &Map<String, Value>) -> SensorReading {
    let mut channels: BTreeMap<String, String> = target
        .subsystem()
        .channels()
        .iter()
        .map(|spec| {
            (
                spec.name.to_string(),
                format_channel(payload.get(spec.name), spec.decimals),
            )
        })
        .collect();

    if let TelemetryTarget::Fertigation { tank_ids, .. } = target {
        let levels = payload.get(TANK_LEVELS_KEY).and_then(Value::as_object);
        for tank_id in tank_ids {
            let raw_level = levels.and_then(|l| l.get(tank_id));
            channels.insert(
                tank_level_channel(tank_id),
                format_channel(raw_level, TANK_LEVEL_DECIMALS),
            );
        }
    }

    SensorReading {
        subsystem: target.subsystem(),
        source: ReadingSource::Live,
        channels,
        is_loading: false,
    }
}

/// Synthesize a complete reading for `target`.
pub fn mock_reading(target: &TelemetryTarget, rng: &mut fastrand::Rng) -> SensorReading {
    let mut channels = BTreeMap::new();

    for spec in target.subsystem().channels() {
        let value = match (spec.mock, target) {
            (MockValue::Range(range), _) => to_fixed(range.sample(rng), spec.decimals),
            (
                MockValue::ValveFlow,
                TelemetryTarget::Valve {
                    open,
                    configured_flow,
                },
            ) => {
                if *open {
                    configured_flow.clone()
                } else {
                    "0".to_string()
                }
            }
            (MockValue::PumpFlow(range), TelemetryTarget::Fertigation { pump_running, .. }) => {
                if *pump_running {
                    to_fixed(range.sample(rng), spec.decimals)
                } else {
                    "0".to_string()
                }
            }
            // Status-dependent channels only appear on their own subsystem.
            _ => UNAVAILABLE.to_string(),
        };
        channels.insert(spec.name.to_string(), value);
    }

    if let TelemetryTarget::Fertigation { tank_ids, .. } = target {
        for tank_id in tank_ids {
            channels.insert(
                tank_level_channel(tank_id),
                to_fixed(TANK_LEVEL_MOCK.sample(rng), TANK_LEVEL_DECIMALS),
            );
        }
    }

    SensorReading {
        subsystem: target.subsystem(),
        source: ReadingSource::Mock,
        channels,
        is_loading: false,
    }
}

/// Format one payload field, accepting numeric strings and JSON numbers.
fn format_channel(value: Option<&Value>, decimals: usize) -> String {
    let parsed = match value {
        Some(Value::String(s)) => parse_lenient(s),
        Some(Value::Number(n)) => n.as_f64().filter(|v| v.is_finite()),
        _ => None,
    };
    parsed
        .map(|v| to_fixed(v, decimals))
        .unwrap_or_else(|| UNAVAILABLE.to_string())
}

// ---------------------------------------------------------------------------
// Presentation helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WaterQuality {
    Good,
    Check,
    Unknown,
}

/// Water quality verdict from a formatted pH channel: good within 6.5–7.5.
pub fn water_quality(ph: &str) -> WaterQuality {
    if ph == UNAVAILABLE {
        return WaterQuality::Unknown;
    }
    match parse_lenient(ph) {
        Some(v) if (6.5..=7.5).contains(&v) => WaterQuality::Good,
        Some(_) => WaterQuality::Check,
        None => WaterQuality::Unknown,
    }
}

/// `"7.3" + "A"` → `"7.3 A"`; the sentinel keeps the unit attached (`"--A"`).
pub fn format_sensor_value(value: &str, unit: &str) -> String {
    if value == UNAVAILABLE {
        format!("{UNAVAILABLE}{unit}")
    } else {
        format!("{value} {unit}")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
