use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyPairError {
    #[error("cannot find key pair {0:?}")]
    NotFound(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Device key pair storage.
#[async_trait]
pub trait KeyPairPort: Send + Sync {
    /// Generates and stores a new key pair, returning its id.
    async fn generate(&self) -> Result<String, KeyPairError>;

    async fn exists(&self, key_id: &str) -> Result<bool, KeyPairError>;

    async fn public_key(&self, key_id: &str) -> Result<Vec<u8>, KeyPairError>;

    async fn sign(&self, key_id: &str, payload: &[u8]) -> Result<Vec<u8>, KeyPairError>;

    async fn delete(&self, key_id: &str) -> Result<(), KeyPairError>;
}
