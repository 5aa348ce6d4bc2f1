//! Ed25519 device keys stored one file per key.
//!
//! The key id is the hex SHA3-384 digest of the public key; the file holds
//! the hex encoded secret seed.

use std::path::PathBuf;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use sha3::{Digest, Sha3_384};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

use dl_core::ports::{KeyPairError, KeyPairPort};

pub struct FsKeyPairStore {
    dir: PathBuf,
}

impl FsKeyPairStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn key_path(&self, key_id: &str) -> Result<PathBuf, KeyPairError> {
        if key_id.is_empty() || !key_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(KeyPairError::Failed(format!("invalid key id {key_id:?}")));
        }
        Ok(self.dir.join(key_id))
    }

    async fn load(&self, key_id: &str) -> Result<SigningKey, KeyPairError> {
        let path = self.key_path(key_id)?;
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeyPairError::NotFound(key_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let seed: [u8; 32] = hex::decode(content.trim())
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| KeyPairError::Failed(format!("key {key_id} is corrupt")))?;
        Ok(SigningKey::from_bytes(&seed))
    }
}

pub(crate) fn key_id_of(key: &SigningKey) -> String {
    hex::encode(Sha3_384::digest(key.verifying_key().as_bytes()))
}

#[async_trait]
impl KeyPairPort for FsKeyPairStore {
    async fn generate(&self) -> Result<String, KeyPairError> {
        let seed: [u8; 32] = rand::random();
        let key = SigningKey::from_bytes(&seed);
        let key_id = key_id_of(&key);

        fs::create_dir_all(&self.dir).await?;
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(self.key_path(&key_id)?).await?;
        file.write_all(hex::encode(key.to_bytes()).as_bytes()).await?;
        file.sync_all().await?;

        info!(key_id = %key_id, "generated device key pair");
        Ok(key_id)
    }

    async fn exists(&self, key_id: &str) -> Result<bool, KeyPairError> {
        Ok(fs::try_exists(self.key_path(key_id)?).await?)
    }

    async fn public_key(&self, key_id: &str) -> Result<Vec<u8>, KeyPairError> {
        Ok(self.load(key_id).await?.verifying_key().to_bytes().to_vec())
    }

    async fn sign(&self, key_id: &str, payload: &[u8]) -> Result<Vec<u8>, KeyPairError> {
        let key = self.load(key_id).await?;
        Ok(key.sign(payload).to_bytes().to_vec())
    }

    async fn delete(&self, key_id: &str) -> Result<(), KeyPairError> {
        match fs::remove_file(self.key_path(key_id)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(KeyPairError::NotFound(key_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
