use async_trait::async_trait;
use thiserror::Error;

use crate::device::SerialAssertion;
use crate::model::ModelAssertion;

#[derive(Debug, Error)]
pub enum AssertionError {
    /// An assertion with the same revision is already present.
    #[error("assertion {0} is already present with the same revision")]
    SameRevision(String),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The local assertion database.
#[async_trait]
pub trait AssertionDbPort: Send + Sync {
    async fn find_model(
        &self,
        brand_id: &str,
        model: &str,
    ) -> Result<Option<ModelAssertion>, AssertionError>;

    async fn add_model(&self, model: &ModelAssertion) -> Result<(), AssertionError>;

    async fn find_serials(
        &self,
        brand_id: &str,
        model: &str,
        device_key_id: &str,
    ) -> Result<Vec<SerialAssertion>, AssertionError>;

    async fn add_serial(&self, serial: &SerialAssertion) -> Result<(), AssertionError>;
}
