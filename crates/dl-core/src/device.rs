use serde::{Deserialize, Serialize};

/// Persisted identity of the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub brand: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub serial: String,
    #[serde(default, rename = "key-id", skip_serializing_if = "String::is_empty")]
    pub key_id: String,
    #[serde(
        default,
        rename = "session-macaroon",
        skip_serializing_if = "String::is_empty"
    )]
    pub session_macaroon: String,
}

impl DeviceState {
    pub fn is_registered(&self) -> bool {
        !self.serial.is_empty()
    }

    pub fn has_key(&self) -> bool {
        !self.key_id.is_empty()
    }
}

/// A serial assertion issued by a device service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialAssertion {
    pub brand_id: String,
    pub model: String,
    pub serial: String,
    pub device_key_id: String,
    /// Signed wire form, kept verbatim.
    #[serde(default)]
    pub encoded: String,
}

impl SerialAssertion {
    /// Whether this serial was issued for the given identity and key.
    pub fn matches(&self, brand: &str, model: &str, key_id: &str) -> bool {
        self.brand_id == brand && self.model == model && self.device_key_id == key_id
    }
}

/// Per-task persisted progress of a serial request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSetup {
    #[serde(default, rename = "serial-request", skip_serializing_if = "String::is_empty")]
    pub serial_request: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<SerialAssertion>,
}
