//! Device registry: every motor, valve, nutrient tank and the dosing pump the
//! panel can address, together with the SMS destination number and command
//! templates. This is the `Settings` blob persisted by [`crate::db::Db`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::command::CommandTemplate;
use crate::numeric::parse_or_zero;

/// Fixed registry id of the single dosing pump.
pub const DOSING_PUMP_ID: &str = "dosingPump";

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// SMS addressing fields. `prefix + id` is the device's wire address; the
/// registry does not enforce uniqueness (see [`Settings::lint`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub sms_prefix: String,
    pub sms_id: String,
}

impl DeviceIdentity {
    pub fn new(prefix: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            sms_prefix: prefix.into(),
            sms_id: id.into(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}{}", self.sms_prefix, self.sms_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    Motor,
    Valve,
    Tank,
    DosingPump,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Motor => write!(f, "motor"),
            Self::Valve => write!(f, "valve"),
            Self::Tank => write!(f, "tank"),
            Self::DosingPump => write!(f, "dosing-pump"),
        }
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "motor" => Ok(Self::Motor),
            "valve" => Ok(Self::Valve),
            "tank" => Ok(Self::Tank),
            "dosing-pump" => Ok(Self::DosingPump),
            _ => Err(format!("unknown device kind '{s}'")),
        }
    }
}

/// Registry lookup key: device kind plus registry id (`motor1`, `tank2`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub kind: DeviceKind,
    pub id: String,
}

impl DeviceKey {
    pub fn new(kind: DeviceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn motor(id: impl Into<String>) -> Self {
        Self::new(DeviceKind::Motor, id)
    }

    pub fn valve(id: impl Into<String>) -> Self {
        Self::new(DeviceKind::Valve, id)
    }

    pub fn tank(id: impl Into<String>) -> Self {
        Self::new(DeviceKind::Tank, id)
    }

    pub fn dosing_pump() -> Self {
        Self::new(DeviceKind::DosingPump, DOSING_PUMP_ID)
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

// ---------------------------------------------------------------------------
// Device records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotorConfig {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub identity: DeviceIdentity,
    /// Rated power as entered, e.g. `"5.2 kW"`.
    pub power: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValveConfig {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub identity: DeviceIdentity,
    /// Nominal flow when open, e.g. `"45 L/min"`.
    pub flow: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DosingPumpConfig {
    #[serde(flatten)]
    pub identity: DeviceIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TankConfig {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub identity: DeviceIdentity,
    /// Tank volume in litres, as entered.
    pub volume: String,
    pub nutrient: NutrientProfile,
}

/// Percentages of each nutrient in a tank's solution, kept as the strings the
/// operator typed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NutrientProfile {
    #[serde(rename = "N", default)]
    pub n: String,
    #[serde(rename = "P", default)]
    pub p: String,
    #[serde(rename = "K", default)]
    pub k: String,
    #[serde(rename = "Ca", default)]
    pub ca: String,
    #[serde(rename = "Mg", default)]
    pub mg: String,
    #[serde(rename = "S", default)]
    pub s: String,
}

impl NutrientProfile {
    pub fn new(n: &str, p: &str, k: &str, ca: &str, mg: &str, s: &str) -> Self {
        Self {
            n: n.into(),
            p: p.into(),
            k: k.into(),
            ca: ca.into(),
            mg: mg.into(),
            s: s.into(),
        }
    }

    /// Channels in display order.
    pub fn channels(&self) -> [(&'static str, &str); 6] {
        [
            ("N", &self.n),
            ("P", &self.p),
            ("K", &self.k),
            ("Ca", &self.ca),
            ("Mg", &self.mg),
            ("S", &self.s),
        ]
    }

    /// Sum of all channels; unparsable channels count as zero.
    pub fn total(&self) -> f64 {
        self.channels().iter().map(|(_, v)| parse_or_zero(v)).sum()
    }

    pub fn exceeds_full_strength(&self) -> bool {
        self.total() > 100.0
    }

    /// Copy with blank channels replaced by `"0"`.
    pub fn with_blank_as_zero(&self) -> Self {
        let fill = |v: &String| {
            if v.trim().is_empty() {
                "0".to_string()
            } else {
                v.clone()
            }
        };
        Self {
            n: fill(&self.n),
            p: fill(&self.p),
            k: fill(&self.k),
            ca: fill(&self.ca),
            mg: fill(&self.mg),
            s: fill(&self.s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FertigationConfig {
    pub dosing_pump: DosingPumpConfig,
    pub tanks: Vec<TankConfig>,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Destination number of the field controller's SIM.
    pub phone_number: String,
    #[serde(flatten)]
    pub template: CommandTemplate,
    pub motors: Vec<MotorConfig>,
    pub valves: Vec<ValveConfig>,
    pub fertigation: FertigationConfig,
}

impl Default for Settings {
    fn default() -> Self {
        let motor = |n: u32, name: &str, power: &str| MotorConfig {
            id: format!("motor{n}"),
            name: name.into(),
            identity: DeviceIdentity::new("M", n.to_string()),
            power: power.into(),
        };
        let valve = |n: u32, name: &str, flow: &str| ValveConfig {
            id: format!("valve{n}"),
            name: name.into(),
            identity: DeviceIdentity::new("V", n.to_string()),
            flow: flow.into(),
        };
        let tank = |n: u32, name: &str, nutrient: NutrientProfile| TankConfig {
            id: format!("tank{n}"),
            name: name.into(),
            identity: DeviceIdentity::new("T", n.to_string()),
            volume: "1000".into(),
            nutrient,
        };

        Self {
            phone_number: "+917305467054".into(),
            template: CommandTemplate::default(),
            motors: vec![
                motor(1, "Main Pump", "5.2 kW"),
                motor(2, "Booster Pump", "3.7 kW"),
                motor(3, "Circulation Pump", "2.1 kW"),
            ],
            valves: vec![
                valve(1, "Zone 1 - North Field", "45 L/min"),
                valve(2, "Zone 2 - South Field", "45 L/min"),
                valve(3, "Zone 3 - East Orchard", "38 L/min"),
                valve(4, "Zone 4 - West Garden", "45 L/min"),
            ],
            fertigation: FertigationConfig {
                dosing_pump: DosingPumpConfig {
                    identity: DeviceIdentity::new("DP", "1"),
                },
                tanks: vec![
                    tank(
                        1,
                        "Tank A - Base Nutrients",
                        NutrientProfile::new("15", "5", "10", "5", "2", "3"),
                    ),
                    tank(
                        2,
                        "Tank B - Calcium Nitrate",
                        NutrientProfile::new("19", "0", "0", "26", "0", "0"),
                    ),
                    tank(
                        3,
                        "Tank C - Magnesium Sulfate",
                        NutrientProfile::new("0", "0", "0", "0", "16", "13"),
                    ),
                ],
            },
        }
    }
}

impl Settings {
    /// Overlay a stored settings document on the built-in defaults.
    ///
    /// Top-level keys present in `stored` replace the default value wholesale;
    /// absent keys keep the default. A non-object document yields defaults.
    pub fn merged_over_defaults(stored: Value) -> Result<Self, serde_json::Error> {
        Self::default().merged_with(stored)
    }

    /// Same shallow overlay, applied to `self` instead of the defaults.
    pub fn merged_with(&self, patch: Value) -> Result<Self, serde_json::Error> {
        let mut merged = serde_json::to_value(self)?;
        if let (Value::Object(base), Value::Object(overrides)) = (&mut merged, patch) {
            for (key, value) in overrides {
                base.insert(key, value);
            }
        }
        serde_json::from_value(merged)
    }

    pub fn motor(&self, id: &str) -> Option<&MotorConfig> {
        self.motors.iter().find(|m| m.id == id)
    }

    pub fn valve(&self, id: &str) -> Option<&ValveConfig> {
        self.valves.iter().find(|v| v.id == id)
    }

    pub fn tank(&self, id: &str) -> Option<&TankConfig> {
        self.fertigation.tanks.iter().find(|t| t.id == id)
    }

    pub fn tank_mut(&mut self, id: &str) -> Option<&mut TankConfig> {
        self.fertigation.tanks.iter_mut().find(|t| t.id == id)
    }

    pub fn identity(&self, key: &DeviceKey) -> Option<&DeviceIdentity> {
        match key.kind {
            DeviceKind::Motor => self.motor(&key.id).map(|m| &m.identity),
            DeviceKind::Valve => self.valve(&key.id).map(|v| &v.identity),
            DeviceKind::Tank => self.tank(&key.id).map(|t| &t.identity),
            DeviceKind::DosingPump if key.id == DOSING_PUMP_ID => {
                Some(&self.fertigation.dosing_pump.identity)
            }
            DeviceKind::DosingPump => None,
        }
    }

    pub fn name(&self, key: &DeviceKey) -> Option<&str> {
        match key.kind {
            DeviceKind::Motor => self.motor(&key.id).map(|m| m.name.as_str()),
            DeviceKind::Valve => self.valve(&key.id).map(|v| v.name.as_str()),
            DeviceKind::Tank => self.tank(&key.id).map(|t| t.name.as_str()),
            DeviceKind::DosingPump => self.identity(key).map(|_| "Dosing Pump"),
        }
    }

    pub fn contains(&self, key: &DeviceKey) -> bool {
        self.identity(key).is_some()
    }

    /// Every addressable device: motors, valves, the dosing pump, then tanks.
    pub fn keys(&self) -> Vec<DeviceKey> {
        let mut keys: Vec<DeviceKey> = self.motors.iter().map(|m| DeviceKey::motor(&m.id)).collect();
        keys.extend(self.valves.iter().map(|v| DeviceKey::valve(&v.id)));
        keys.push(DeviceKey::dosing_pump());
        keys.extend(self.fertigation.tanks.iter().map(|t| DeviceKey::tank(&t.id)));
        keys
    }

    /// Append a placeholder motor and return its key.
    pub fn add_motor(&mut self) -> DeviceKey {
        let taken: Vec<&str> = self.motors.iter().map(|m| m.id.as_str()).collect();
        let n = next_free_index("motor", self.motors.len(), &taken);
        let id = format!("motor{n}");
        self.motors.push(MotorConfig {
            id: id.clone(),
            name: format!("New Motor {n}"),
            identity: DeviceIdentity::new("M", n.to_string()),
            power: "0 kW".into(),
        });
        DeviceKey::motor(id)
    }

    /// Append a placeholder valve and return its key.
    pub fn add_valve(&mut self) -> DeviceKey {
        let taken: Vec<&str> = self.valves.iter().map(|v| v.id.as_str()).collect();
        let n = next_free_index("valve", self.valves.len(), &taken);
        let id = format!("valve{n}");
        self.valves.push(ValveConfig {
            id: id.clone(),
            name: format!("New Valve {n}"),
            identity: DeviceIdentity::new("V", n.to_string()),
            flow: "0 L/min".into(),
        });
        DeviceKey::valve(id)
    }

    /// Remove a motor or valve. Tanks and the dosing pump are fixed.
    pub fn remove_device(&mut self, key: &DeviceKey) -> bool {
        let before = self.motors.len() + self.valves.len();
        match key.kind {
            DeviceKind::Motor => self.motors.retain(|m| m.id != key.id),
            DeviceKind::Valve => self.valves.retain(|v| v.id != key.id),
            DeviceKind::Tank | DeviceKind::DosingPump => return false,
        }
        self.motors.len() + self.valves.len() < before
    }

    /// Configuration problems worth surfacing. None of these block saving;
    /// the formatter tolerates every one of them.
    pub fn lint(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.phone_number.trim().is_empty() {
            warnings.push("phoneNumber is empty".to_string());
        }

        for (format, token) in self.template.missing_tokens() {
            warnings.push(format!("{format} has no {token} placeholder"));
        }

        let mut by_address: HashMap<String, Vec<String>> = HashMap::new();
        for key in self.keys() {
            let Some(identity) = self.identity(&key) else {
                continue;
            };
            if identity.sms_prefix.trim().is_empty() {
                warnings.push(format!("{key}: smsPrefix is empty"));
            }
            if identity.sms_id.trim().is_empty() {
                warnings.push(format!("{key}: smsId is empty"));
            }
            by_address
                .entry(identity.address())
                .or_default()
                .push(key.to_string());
        }

        let mut duplicates: Vec<_> = by_address
            .into_iter()
            .filter(|(_, keys)| keys.len() > 1)
            .collect();
        duplicates.sort();
        for (address, keys) in duplicates {
            warnings.push(format!(
                "address '{address}' is shared by {}",
                keys.join(", ")
            ));
        }

        warnings
    }
}

/// Lowest `n >= count + 1` for which `{stem}{n}` is not already taken.
fn next_free_index(stem: &str, count: usize, taken: &[&str]) -> usize {
    let mut n = count + 1;
    while taken.contains(&format!("{stem}{n}").as_str()) {
        n += 1;
    }
    n
}

// ===========================================================================
// Tests
// ===========================================================================
