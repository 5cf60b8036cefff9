//! SMS command synthesis from the configured ON/OFF templates.

use serde::{Deserialize, Serialize};

use crate::registry::DeviceIdentity;

/// Placeholder replaced by the device's SMS prefix.
pub const PREFIX_TOKEN: &str = "{prefix}";
/// Placeholder replaced by the device's SMS id.
pub const DEVICE_ID_TOKEN: &str = "{deviceId}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandTemplate {
    pub on_format: String,
    pub off_format: String,
}

impl Default for CommandTemplate {
    fn default() -> Self {
        Self {
            on_format: "ON {prefix}{deviceId}".to_string(),
            off_format: "OFF {prefix}{deviceId}".to_string(),
        }
    }
}

impl CommandTemplate {
    /// Template used to drive a device to `on`.
    pub fn for_target(&self, on: bool) -> &str {
        if on {
            &self.on_format
        } else {
            &self.off_format
        }
    }

    /// Render the command that drives `identity` to `on`.
    pub fn render(&self, on: bool, identity: &DeviceIdentity) -> String {
        format_command(self.for_target(on), identity)
    }

    /// Templates that lack one of the placeholders, as `(format name, token)`.
    pub fn missing_tokens(&self) -> Vec<(&'static str, &'static str)> {
        let mut missing = Vec::new();
        for (name, template) in [("onFormat", &self.on_format), ("offFormat", &self.off_format)] {
            for token in [PREFIX_TOKEN, DEVICE_ID_TOKEN] {
                if !template.contains(token) {
                    missing.push((name, token));
                }
            }
        }
        missing
    }
}

/// Substitute the first `{prefix}` and then the first `{deviceId}` in
/// `template`.
///
/// Absent tokens are skipped. Repeated tokens keep every occurrence after the
/// first as literal text, so `"ON {prefix}{deviceId} {prefix}{deviceId}"`
/// renders as `"ON M1 {prefix}{deviceId}"` for `M`/`1`.
pub fn format_command(template: &str, identity: &DeviceIdentity) -> String {
    template
        .replacen(PREFIX_TOKEN, &identity.sms_prefix, 1)
        .replacen(DEVICE_ID_TOKEN, &identity.sms_id, 1)
}

// ===========================================================================
// Tests
// ===========================================================================
