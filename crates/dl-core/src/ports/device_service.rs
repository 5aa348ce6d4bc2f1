use async_trait::async_trait;
use thiserror::Error;

use crate::device::{DeviceState, SerialAssertion};
use crate::model::ModelAssertion;

#[derive(Debug, Error)]
pub enum DeviceServiceError {
    /// Network trouble or a server side failure worth retrying.
    #[error("{0}")]
    Transient(String),

    /// The service refused the request.
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialResponse {
    Issued(SerialAssertion),
    /// The request was accepted but the serial is not ready yet.
    Poll,
}

/// Remote device service issuing serials and store sessions.
#[async_trait]
pub trait DeviceServicePort: Send + Sync {
    async fn request_id(&self) -> Result<String, DeviceServiceError>;

    async fn submit_serial_request(
        &self,
        request: &str,
    ) -> Result<SerialResponse, DeviceServiceError>;

    /// Opens a store session scoped to the given model.
    async fn open_store_session(
        &self,
        model: &ModelAssertion,
        device: &DeviceState,
    ) -> Result<String, DeviceServiceError>;
}
