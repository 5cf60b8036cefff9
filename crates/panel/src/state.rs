use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::controller::{DeviceState, Notice, NoticeLevel};
use crate::nutrient::{aggregate, NutrientMix};
use crate::registry::{DeviceKey, DeviceKind, Settings};
use crate::telemetry::SensorReading;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<PanelState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct PanelState {
    pub started_at: Instant,
    pub settings: Settings,
    pub devices: HashMap<DeviceKey, DeviceState>,
    pub telemetry: TelemetryBoard,
    pub events: VecDeque<PanelEvent>,
}

#[derive(Clone, Serialize)]
pub struct PanelEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Command,
    Telemetry,
    Error,
    System,
}

/// Latest reading per device, guarded by a request ticket so that only the
/// most recently started refresh may overwrite what is displayed.
#[derive(Default)]
pub struct TelemetryBoard {
    last_ticket: u64,
    entries: HashMap<DeviceKey, BoardEntry>,
}

struct BoardEntry {
    ticket: u64,
    reading: SensorReading,
}

impl TelemetryBoard {
    /// Start a refresh: show `placeholder` and return the ticket the result
    /// must present to [`TelemetryBoard::complete`].
    pub fn begin(&mut self, key: &DeviceKey, placeholder: SensorReading) -> u64 {
        self.last_ticket += 1;
        let ticket = self.last_ticket;
        self.entries.insert(
            key.clone(),
            BoardEntry {
                ticket,
                reading: placeholder,
            },
        );
        ticket
    }

    /// Store `reading` if `ticket` is still the newest for `key`. Returns
    /// false for a superseded response, which is dropped.
    pub fn complete(&mut self, key: &DeviceKey, ticket: u64, reading: SensorReading) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if entry.ticket == ticket => {
                entry.reading = reading;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, key: &DeviceKey) -> Option<&SensorReading> {
        self.entries.get(key).map(|e| &e.reading)
    }

    fn retain(&mut self, settings: &Settings) {
        self.entries.retain(|key, _| settings.contains(key));
    }
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub key: String,
    pub kind: DeviceKind,
    pub id: String,
    pub name: String,
    pub address: String,
    pub on: bool,
    pub state: DeviceState,
    pub reading: Option<SensorReading>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub phone_number: String,
    pub devices: Vec<DeviceStatus>,
    pub nutrient_mix: NutrientMix,
    pub events: Vec<PanelEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl PanelState {
    pub fn new(settings: Settings) -> Self {
        Self {
            started_at: Instant::now(),
            settings,
            devices: HashMap::new(),
            telemetry: TelemetryBoard::default(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(settings: Settings) -> SharedState {
        Arc::new(RwLock::new(Self::new(settings)))
    }

    /// Current state of `key`; devices never toggled are idle and off.
    pub fn device_state(&self, key: &DeviceKey) -> DeviceState {
        self.devices.get(key).copied().unwrap_or_default()
    }

    pub fn is_on(&self, key: &DeviceKey) -> bool {
        self.device_state(key).is_on()
    }

    /// Mix of the tanks whose valves are currently open.
    pub fn nutrient_mix(&self) -> NutrientMix {
        aggregate(&self.settings.fertigation.tanks, |t| {
            self.is_on(&DeviceKey::tank(&t.id))
        })
    }

    /// Swap in a new settings snapshot, dropping runtime state for devices
    /// that no longer exist.
    pub fn replace_settings(&mut self, settings: Settings) {
        self.devices.retain(|key, _| settings.contains(key));
        self.telemetry.retain(&settings);
        self.settings = settings;
        self.record_system("settings updated".to_string());
    }

    /// Record a user-visible notice from the controller.
    pub fn record_notice(&mut self, key: &DeviceKey, notice: &Notice) {
        let kind = match notice.level {
            NoticeLevel::Success => EventKind::Command,
            NoticeLevel::Error => EventKind::Error,
        };
        self.push_event(kind, format!("{key}: {}: {}", notice.title, notice.message));
    }

    pub fn record_telemetry(&mut self, key: &DeviceKey, reading: &SensorReading) {
        let source = serde_json::to_value(reading.source)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        self.push_event(EventKind::Telemetry, format!("{key}: {source} reading"));
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        let devices = self
            .settings
            .keys()
            .into_iter()
            .filter_map(|key| {
                let identity = self.settings.identity(&key)?;
                let state = self.device_state(&key);
                Some(DeviceStatus {
                    key: key.to_string(),
                    kind: key.kind,
                    id: key.id.clone(),
                    name: self.settings.name(&key).unwrap_or_default().to_string(),
                    address: identity.address(),
                    on: state.is_on(),
                    state,
                    reading: self.telemetry.get(&key).cloned(),
                })
            })
            .collect();

        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            phone_number: self.settings.phone_number.clone(),
            devices,
            nutrient_mix: self.nutrient_mix(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(PanelEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
