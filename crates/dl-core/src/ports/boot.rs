use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::encryption::{EncryptionBackend, KeysForRoles};
use crate::mode::SystemModeInfo;
use crate::model::ModelAssertion;

#[derive(Debug, Error)]
pub enum BootError {
    #[error("boot state is unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Request to make a freshly installed system bootable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakeRunnableRequest {
    pub model: ModelAssertion,
    /// Recovery system the installation came from.
    pub recovery_system: String,
    pub backend: Option<EncryptionBackend>,
    pub factory_reset: bool,
}

/// Outcome of booting into a tried recovery system, as recorded by the
/// boot path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryRecoveryOutcome {
    pub label: String,
    pub success: bool,
}

/// Bootloader and mode-record collaborator.
#[async_trait]
pub trait BootPort: Send + Sync {
    /// Reads the on-disk mode record.
    async fn mode_info(&self) -> Result<SystemModeInfo, BootError>;

    /// Installs boot assets into the target and seals keys, if any, to
    /// the boot chain.
    async fn make_runnable(
        &self,
        request: &MakeRunnableRequest,
        keys: Option<&KeysForRoles>,
    ) -> Result<(), BootError>;

    /// Sets the boot variables so the next boot enters run mode.
    async fn ensure_next_boot_to_run_mode(&self, recovery_system: &str) -> Result<(), BootError>;

    async fn set_try_recovery_system(&self, label: &str) -> Result<(), BootError>;

    /// Sets the next boot into `label` with the given mode.
    async fn set_recovery_boot_system_and_mode(
        &self,
        label: &str,
        mode: &str,
    ) -> Result<(), BootError>;

    async fn promote_tried_recovery_system(
        &self,
        label: &str,
        tried: &[String],
    ) -> Result<(), BootError>;

    /// Forgets `label` in the boot configuration.
    async fn drop_recovery_system(&self, label: &str) -> Result<(), BootError>;

    async fn mark_recovery_capable(&self, label: &str) -> Result<(), BootError>;

    async fn unmark_recovery_capable(&self, label: &str) -> Result<(), BootError>;

    /// Labels currently known as good recovery systems.
    async fn good_recovery_systems(&self) -> Result<Vec<String>, BootError>;

    async fn mark_boot_successful(&self) -> Result<(), BootError>;

    /// Outcome of a recovery system try boot, if one happened.
    async fn inspect_try_recovery_outcome(&self)
        -> Result<Option<TryRecoveryOutcome>, BootError>;

    async fn clear_try_recovery_system(&self, label: &str) -> Result<(), BootError>;
}
