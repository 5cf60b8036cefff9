use thiserror::Error;

use crate::registry::DeviceKey;

/// Failures surfaced to whoever asked for a device action.
///
/// Telemetry fetch problems never appear here: they resolve to mock data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("unknown device '{0}'")]
    UnknownDevice(DeviceKey),

    #[error("a command for '{0}' is already in progress")]
    AlreadyInProgress(DeviceKey),

    #[error("SMS is not available on this device")]
    TransportUnavailable,

    #[error("failed to send SMS: {0}")]
    DispatchFailed(String),

    #[error("'{0}' has no telemetry feed")]
    NoTelemetry(DeviceKey),
}
