//! Remote telemetry API client.
//!
//! Every failure mode (network error, non-2xx, undecodable body) collapses to
//! `None`, which the normalizer turns into mock data.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::registry::DeviceIdentity;
use crate::telemetry::Subsystem;

// ---------------------------------------------------------------------------
// Sensor ids
// ---------------------------------------------------------------------------

/// `"{device_type}_{prefix}{id}"`, lower-cased: `motor_m1`, `valve_v3`.
pub fn sensor_id(device_type: &str, prefix: &str, id: &str) -> String {
    format!("{device_type}_{prefix}{id}").to_lowercase()
}

/// Sensor id of a device's telemetry feed. Fertigation is keyed by the
/// dosing pump identity.
pub fn sensor_id_for(subsystem: Subsystem, identity: &DeviceIdentity) -> String {
    sensor_id(
        subsystem.device_type(),
        &identity.sms_prefix,
        &identity.sms_id,
    )
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Latest payload for `sensor_id`, or `None` when unreachable.
    async fn fetch(&self, sensor_id: &str) -> Option<Value>;
}

pub struct TelemetryClient {
    client: reqwest::Client,
    base_url: String,
}

impl TelemetryClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build telemetry http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, sensor_id: &str) -> String {
        format!("{}/{sensor_id}", self.base_url)
    }
}

#[async_trait]
impl TelemetrySource for TelemetryClient {
    async fn fetch(&self, sensor_id: &str) -> Option<Value> {
        let url = self.url_for(sensor_id);

        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(sensor = sensor_id, "telemetry fetch failed: {e}");
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(sensor = sensor_id, status = status.as_u16(), "telemetry fetch not ok");
            return None;
        }

        match response.json::<Value>().await {
            Ok(Value::Null) => {
                debug!(sensor = sensor_id, "telemetry payload is null");
                None
            }
            Ok(v) => Some(v),
            Err(e) => {
                warn!(sensor = sensor_id, "telemetry payload is not json: {e}");
                None
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
