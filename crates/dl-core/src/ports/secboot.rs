use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecbootError {
    #[error("TPM not available: {0}")]
    Unavailable(String),

    #[error("TPM cannot be used for sealing: {0}")]
    Unsupported(String),
}

#[async_trait]
pub trait SecbootPort: Send + Sync {
    /// Checks that keys can be sealed to the TPM.
    async fn check_tpm_sealing_supported(&self) -> Result<(), SecbootError>;
}

#[cfg(test)]
mockall::mock! {
    pub Secboot {}

    #[async_trait]
    impl SecbootPort for Secboot {
        async fn check_tpm_sealing_supported(&self) -> Result<(), SecbootError>;
    }
}
