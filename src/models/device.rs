//! Registered push device.

use serde::{Deserialize, Serialize};

/// A device subscribed to push delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    /// Push-subscription public key material, opaque to the relay.
    pub public_key: String,
    pub registration_date: String,
    /// Consecutive failed deliveries across notifications.
    #[serde(default)]
    pub consecutive_failures: i64,
}

/// Request body for registering a device.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceRequest {
    /// Producer-assigned id; the server assigns one when absent.
    #[serde(default)]
    pub device_id: Option<String>,
    pub public_key: String,
}
