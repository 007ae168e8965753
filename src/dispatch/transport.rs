//! Push transports: the boundary to whatever actually reaches the device.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

/// Timeout for a single gateway request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A failed delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Worth retrying: network trouble, throttling, gateway errors.
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// The subscription no longer exists; retrying cannot help.
    #[error("push subscription is gone (status {0})")]
    Gone(u16),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

/// Delivers a serialized payload to the device owning `public_key`.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn deliver(&self, public_key: &str, payload: &str) -> Result<(), DeliveryError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GatewayRequest<'a> {
    public_key: &'a str,
    payload: &'a str,
}

/// Posts deliveries to a push gateway as JSON.
#[derive(Debug, Clone)]
pub struct HttpPushTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPushTransport {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn deliver(&self, public_key: &str, payload: &str) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&GatewayRequest {
                public_key,
                payload,
            })
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("push request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        match status.as_u16() {
            404 | 410 => Err(DeliveryError::Gone(status.as_u16())),
            code => Err(DeliveryError::Transient(format!("gateway returned {code}"))),
        }
    }
}

/// Logs deliveries instead of sending them. Used when no gateway is configured.
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

#[async_trait]
impl PushTransport for LogTransport {
    async fn deliver(&self, public_key: &str, payload: &str) -> Result<(), DeliveryError> {
        let key_prefix: String = public_key.chars().take(12).collect();
        tracing::info!(
            key = %key_prefix,
            bytes = payload.len(),
            "Push delivery (no gateway configured)"
        );
        Ok(())
    }
}
