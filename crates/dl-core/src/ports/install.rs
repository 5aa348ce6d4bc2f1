use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::device::SerialAssertion;
use crate::encryption::{EncryptionBackend, EncryptionSetupData, KeysForRoles};
use crate::model::{Grade, ModelAssertion};

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallKind {
    Install,
    FactoryReset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    pub kind: InstallKind,
    pub recovery_system: String,
    pub backend: Option<EncryptionBackend>,
}

/// What the installer produced.
#[derive(Debug, Clone, Default)]
pub struct InstalledSystem {
    /// Key material per role, present when encrypting.
    pub keys: Option<KeysForRoles>,
    /// Disk traits to persist for later gadget updates.
    pub storage_traits: Value,
}

/// Target configuration applied before leaving install mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    pub grade: Grade,
    /// Whether cloud-init may run on the installed system.
    pub allow_cloud_init: bool,
    pub apply_gadget_defaults: bool,
}

/// What a previous installation left on the save partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveContents {
    /// Whether the previous installation was encrypted, if a marker exists.
    pub encrypted: Option<bool>,
    /// Serials found in the save assertion database, in storage order.
    pub serials: Vec<SerialAssertion>,
    /// Ids of device keys whose private part is stored on save.
    pub device_keys: Vec<String>,
}

/// Partitioning, content writing and target setup.
#[async_trait]
pub trait InstallPort: Send + Sync {
    async fn run(&self, options: &InstallOptions) -> Result<InstalledSystem, InstallError>;

    async fn save_storage_traits(&self, traits: &Value) -> Result<(), InstallError>;

    /// Restores the preseed artifact of the seed. Returns false when the
    /// seed has none.
    async fn restore_preseed_artifact(&self, recovery_system: &str) -> Result<bool, InstallError>;

    /// Copies the model assertion and the clock state into the target.
    async fn write_model_and_clock(&self, model: &ModelAssertion) -> Result<(), InstallError>;

    async fn configure_target(&self, config: &TargetConfig) -> Result<(), InstallError>;

    /// Creates and opens encrypted structures for an externally driven
    /// installation.
    async fn setup_storage_encryption(
        &self,
        recovery_system: &str,
        backend: EncryptionBackend,
    ) -> Result<EncryptionSetupData, InstallError>;

    async fn finish_install(
        &self,
        recovery_system: &str,
        encryption: Option<&EncryptionSetupData>,
    ) -> Result<(), InstallError>;

    async fn inspect_save(&self) -> Result<SaveContents, InstallError>;

    /// Moves the device key with the given id from save to the key store.
    async fn restore_device_key(&self, key_id: &str) -> Result<(), InstallError>;
}
