//! SMS command transport. `HttpSmsGateway` hands messages to an HTTP SMS
//! gateway; `LogTransport` only logs them, for development without a gateway.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Completion signal reported by the transport once it has taken a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SendResult {
    Sent,
    Cancelled,
    /// Accepted, but the transport cannot say whether it went out.
    Unknown,
}

impl SendResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Error)]
pub enum SmsError {
    #[error("gateway request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("gateway rejected message with status {0}")]
    Rejected(u16),

    #[error("no gateway configured")]
    NotConfigured,
}

#[async_trait]
pub trait SmsTransport: Send + Sync {
    /// Whether a send can be attempted at all. Checked before every send.
    async fn is_available(&self) -> bool;

    async fn send(&self, phone: &str, message: &str) -> Result<SendResult, SmsError>;
}

// ---------------------------------------------------------------------------
// Log-only transport (development)
// ---------------------------------------------------------------------------

pub struct LogTransport;

#[async_trait]
impl SmsTransport for LogTransport {
    async fn is_available(&self) -> bool {
        true
    }

    async fn send(&self, phone: &str, message: &str) -> Result<SendResult, SmsError> {
        info!(phone, message, "[mock-sms] command not sent (no gateway)");
        Ok(SendResult::Sent)
    }
}

// ---------------------------------------------------------------------------
// HTTP gateway
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct GatewayMessage<'a> {
    to: &'a str,
    body: &'a str,
}

/// Optional JSON receipt in a 2xx gateway response.
#[derive(Debug, Default, Deserialize)]
struct GatewayReceipt {
    #[serde(default)]
    status: Option<String>,
}

impl GatewayReceipt {
    fn result(&self) -> Option<SendResult> {
        match self.status.as_deref()?.to_ascii_lowercase().as_str() {
            "sent" | "delivered" => Some(SendResult::Sent),
            "cancelled" | "canceled" => Some(SendResult::Cancelled),
            "queued" | "accepted" | "pending" => Some(SendResult::Unknown),
            _ => None,
        }
    }
}

/// A receipt `status` wins; otherwise 202 means queued and any other 2xx sent.
fn send_result(status: StatusCode, body: &[u8]) -> SendResult {
    let receipt: GatewayReceipt = serde_json::from_slice(body).unwrap_or_default();
    receipt.result().unwrap_or(if status == StatusCode::ACCEPTED {
        SendResult::Unknown
    } else {
        SendResult::Sent
    })
}

pub struct HttpSmsGateway {
    client: reqwest::Client,
    url: Option<String>,
    token: Option<String>,
}

impl HttpSmsGateway {
    pub fn new(url: Option<String>, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.filter(|u| !u.trim().is_empty()),
            token,
        })
    }
}

#[async_trait]
impl SmsTransport for HttpSmsGateway {
    async fn is_available(&self) -> bool {
        self.url.is_some()
    }

    async fn send(&self, phone: &str, message: &str) -> Result<SendResult, SmsError> {
        let url = self.url.as_deref().ok_or(SmsError::NotConfigured)?;

        let mut request = self.client.post(url).json(&GatewayMessage {
            to: phone,
            body: message,
        });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SmsError::Rejected(status.as_u16()));
        }
        let body = response.bytes().await?;
        Ok(send_result(status, &body))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
