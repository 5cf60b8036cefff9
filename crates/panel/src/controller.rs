//! Device state controller: turns toggle requests into SMS dispatches and
//! refresh requests into telemetry readings.
//!
//! ## Per-device state machine
//!
//! ```text
//! Idle{on} ──[toggle]──▶ Dispatching{was_on, target_on}
//!    ▲                          │
//!    ├──[accepted]── Idle{on: target_on}
//!    └──[unavailable | failed]── Idle{on: was_on}
//! ```
//!
//! A toggle while `Dispatching` is rejected. Status flips as soon as the
//! transport accepts the message; there is no hardware confirmation.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{sensor_id_for, TelemetrySource};
use crate::db::Db;
use crate::error::ControlError;
use crate::registry::{DeviceKey, DeviceKind, Settings};
use crate::sms::{SendResult, SmsTransport};
use crate::state::{PanelState, SharedState};
use crate::telemetry::{normalize, SensorReading, TelemetryTarget};

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum DeviceState {
    Idle { on: bool },
    #[serde(rename_all = "camelCase")]
    Dispatching { was_on: bool, target_on: bool },
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::Idle { on: false }
    }
}

/// Next state plus the side effect the caller must carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition<E> {
    pub next: DeviceState,
    pub effect: E,
}

/// Send the command that moves the device to `target_on`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendCommand {
    pub target_on: bool,
}

/// How a dispatch attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Accepted(SendResult),
    Unavailable,
    Failed(String),
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted(r) => r.as_str(),
            Self::Unavailable => "unavailable",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Success,
    Error,
}

/// User-visible outcome of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

impl DeviceState {
    pub fn is_on(self) -> bool {
        match self {
            Self::Idle { on } => on,
            Self::Dispatching { was_on, .. } => was_on,
        }
    }

    pub fn is_dispatching(self) -> bool {
        matches!(self, Self::Dispatching { .. })
    }

    pub fn request_toggle(self, key: &DeviceKey) -> Result<Transition<SendCommand>, ControlError> {
        match self {
            Self::Idle { on } => Ok(Transition {
                next: Self::Dispatching {
                    was_on: on,
                    target_on: !on,
                },
                effect: SendCommand { target_on: !on },
            }),
            Self::Dispatching { .. } => Err(ControlError::AlreadyInProgress(key.clone())),
        }
    }

    /// Resolve a dispatch. Only an accepted dispatch changes the on/off state.
    pub fn settle(self, outcome: &DispatchOutcome, command: &str) -> Transition<Notice> {
        let (was_on, target_on) = match self {
            Self::Dispatching { was_on, target_on } => (was_on, target_on),
            Self::Idle { on } => (on, on),
        };

        match outcome {
            DispatchOutcome::Accepted(_) => Transition {
                next: Self::Idle { on: target_on },
                effect: Notice {
                    level: NoticeLevel::Success,
                    title: "Success".into(),
                    message: format!("Command sent: {command}"),
                },
            },
            DispatchOutcome::Unavailable => Transition {
                next: Self::Idle { on: was_on },
                effect: Notice {
                    level: NoticeLevel::Error,
                    title: "SMS Not Available".into(),
                    message: ControlError::TransportUnavailable.to_string(),
                },
            },
            DispatchOutcome::Failed(reason) => Transition {
                next: Self::Idle { on: was_on },
                effect: Notice {
                    level: NoticeLevel::Error,
                    title: "Error".into(),
                    message: ControlError::DispatchFailed(reason.clone()).to_string(),
                },
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Result of an accepted toggle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispatch {
    pub key: DeviceKey,
    pub phone: String,
    pub message: String,
    pub on: bool,
    pub result: SendResult,
}

pub struct Controller {
    shared: SharedState,
    transport: Arc<dyn SmsTransport>,
    dispatch_log: Option<Db>,
    rng: std::sync::Mutex<fastrand::Rng>,
}

impl Controller {
    pub fn new(shared: SharedState, transport: Arc<dyn SmsTransport>) -> Self {
        Self {
            shared,
            transport,
            dispatch_log: None,
            rng: std::sync::Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Record every dispatch attempt in `db`.
    pub fn with_dispatch_log(mut self, db: Db) -> Self {
        self.dispatch_log = Some(db);
        self
    }

    /// Seed the mock telemetry generator.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: std::sync::Mutex::new(fastrand::Rng::with_seed(seed)),
            ..self
        }
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    /// Send the command that flips `key` and settle its state.
    pub async fn toggle(&self, key: &DeviceKey) -> Result<Dispatch, ControlError> {
        // Claim the device and build the message under one lock.
        let (phone, message, target_on) = {
            let mut st = self.shared.write().await;
            let identity = st
                .settings
                .identity(key)
                .cloned()
                .ok_or_else(|| ControlError::UnknownDevice(key.clone()))?;
            let transition = st.device_state(key).request_toggle(key)?;
            st.devices.insert(key.clone(), transition.next);

            let target_on = transition.effect.target_on;
            let message = st.settings.template.render(target_on, &identity);
            (st.settings.phone_number.clone(), message, target_on)
        };

        debug!(device = %key, %message, "dispatching command");

        let outcome = if !self.transport.is_available().await {
            DispatchOutcome::Unavailable
        } else {
            match self.transport.send(&phone, &message).await {
                Ok(result) => DispatchOutcome::Accepted(result),
                Err(e) => DispatchOutcome::Failed(e.to_string()),
            }
        };

        {
            let mut st = self.shared.write().await;
            let current = st.device_state(key);
            let settled = current.settle(&outcome, &message);
            // Removal while the send was outstanding prunes the claim; a device
            // re-added under the same id starts idle and must keep its state.
            if current.is_dispatching() && st.settings.contains(key) {
                st.devices.insert(key.clone(), settled.next);
            }
            st.record_notice(key, &settled.effect);
        }

        if let Some(db) = &self.dispatch_log {
            if let Err(e) = db
                .insert_dispatch(&key.to_string(), &phone, &message, outcome.as_str())
                .await
            {
                warn!(device = %key, "failed to log dispatch: {e:#}");
            }
        }

        match outcome {
            DispatchOutcome::Accepted(result) => {
                info!(device = %key, %message, result = result.as_str(), "command dispatched");
                Ok(Dispatch {
                    key: key.clone(),
                    phone,
                    message,
                    on: target_on,
                    result,
                })
            }
            DispatchOutcome::Unavailable => {
                warn!(device = %key, "sms transport unavailable");
                Err(ControlError::TransportUnavailable)
            }
            DispatchOutcome::Failed(reason) => {
                warn!(device = %key, "dispatch failed: {reason}");
                Err(ControlError::DispatchFailed(reason))
            }
        }
    }

    /// Fetch and normalize the telemetry feed behind `key`.
    ///
    /// Concurrent refreshes of one device each get a ticket; only the newest
    /// ticket's result is kept on the board. Fetch failures resolve to mock
    /// data and never surface as errors.
    pub async fn refresh_telemetry(
        &self,
        key: &DeviceKey,
        source: &dyn TelemetrySource,
    ) -> Result<SensorReading, ControlError> {
        let (ticket, target, sensor_id) = {
            let mut st = self.shared.write().await;
            let (target, sensor_id) = telemetry_target(&st, key)?;
            let ticket = st.telemetry.begin(key, SensorReading::loading(&target));
            (ticket, target, sensor_id)
        };

        let raw = source.fetch(&sensor_id).await;
        let reading = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            normalize(&target, raw.as_ref(), &mut rng)
        };

        let mut st = self.shared.write().await;
        if st.telemetry.complete(key, ticket, reading.clone()) {
            st.record_telemetry(key, &reading);
        } else {
            debug!(device = %key, ticket, "dropping superseded telemetry response");
        }
        Ok(reading)
    }
}

/// Normalization target and sensor id for `key`, from the current snapshot.
pub fn telemetry_target(
    st: &PanelState,
    key: &DeviceKey,
) -> Result<(TelemetryTarget, String), ControlError> {
    let settings: &Settings = &st.settings;
    let unknown = || ControlError::UnknownDevice(key.clone());

    match key.kind {
        DeviceKind::Motor => {
            let motor = settings.motor(&key.id).ok_or_else(unknown)?;
            let target = TelemetryTarget::Motor {
                running: st.is_on(key),
            };
            let id = sensor_id_for(target.subsystem(), &motor.identity);
            Ok((target, id))
        }
        DeviceKind::Valve => {
            let valve = settings.valve(&key.id).ok_or_else(unknown)?;
            let target = TelemetryTarget::Valve {
                open: st.is_on(key),
                configured_flow: valve.flow.clone(),
            };
            let id = sensor_id_for(target.subsystem(), &valve.identity);
            Ok((target, id))
        }
        DeviceKind::DosingPump => {
            let identity = settings.identity(key).ok_or_else(unknown)?;
            let target = TelemetryTarget::Fertigation {
                pump_running: st.is_on(key),
                tank_ids: settings.fertigation.tanks.iter().map(|t| t.id.clone()).collect(),
            };
            let id = sensor_id_for(target.subsystem(), identity);
            Ok((target, id))
        }
        DeviceKind::Tank => {
            if settings.contains(key) {
                Err(ControlError::NoTelemetry(key.clone()))
            } else {
                Err(unknown())
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
