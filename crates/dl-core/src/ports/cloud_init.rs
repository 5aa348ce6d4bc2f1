use async_trait::async_trait;
use thiserror::Error;

use crate::model::Grade;

#[derive(Debug, Error)]
pub enum CloudInitError {
    #[error("cannot restrict cloud-init: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudInitRestriction {
    /// cloud-init did not run or already finished; it was disabled.
    Disabled,
    /// cloud-init stays enabled but limited to local datasources.
    Restricted,
    AlreadyRestricted,
}

#[async_trait]
pub trait CloudInitPort: Send + Sync {
    async fn restrict(&self, grade: Grade) -> Result<CloudInitRestriction, CloudInitError>;
}
