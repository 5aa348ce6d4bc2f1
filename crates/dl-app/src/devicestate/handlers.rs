use async_trait::async_trait;

use dl_core::TaskId;

use super::DeviceManager;
use crate::engine::{TaskError, TaskHandler, TaskOutcome};

/// Task kinds owned by the device manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    InstallSeedSnap,
    MarkSeeded,
    RunHook,
    GenerateDeviceKey,
    RequestSerial,
    SetupRunSystem,
    FactoryResetRunSystem,
    RestartSystemToRunMode,
    InstallSetupStorageEncryption,
    InstallFinish,
    CreateRecoverySystem,
    FinalizeRecoverySystem,
    RemoveRecoverySystem,
    PrepareRemodeling,
    LinkSnap,
    SetModel,
}

impl Kind {
    pub(crate) const ALL: [Kind; 16] = [
        Kind::InstallSeedSnap,
        Kind::MarkSeeded,
        Kind::RunHook,
        Kind::GenerateDeviceKey,
        Kind::RequestSerial,
        Kind::SetupRunSystem,
        Kind::FactoryResetRunSystem,
        Kind::RestartSystemToRunMode,
        Kind::InstallSetupStorageEncryption,
        Kind::InstallFinish,
        Kind::CreateRecoverySystem,
        Kind::FinalizeRecoverySystem,
        Kind::RemoveRecoverySystem,
        Kind::PrepareRemodeling,
        Kind::LinkSnap,
        Kind::SetModel,
    ];

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Kind::InstallSeedSnap => "install-seed-snap",
            Kind::MarkSeeded => "mark-seeded",
            Kind::RunHook => "run-hook",
            Kind::GenerateDeviceKey => "generate-device-key",
            Kind::RequestSerial => "request-serial",
            Kind::SetupRunSystem => "setup-run-system",
            Kind::FactoryResetRunSystem => "factory-reset-run-system",
            Kind::RestartSystemToRunMode => "restart-system-to-run-mode",
            Kind::InstallSetupStorageEncryption => "install-setup-storage-encryption",
            Kind::InstallFinish => "install-finish",
            Kind::CreateRecoverySystem => "create-recovery-system",
            Kind::FinalizeRecoverySystem => "finalize-recovery-system",
            Kind::RemoveRecoverySystem => "remove-recovery-system",
            Kind::PrepareRemodeling => "prepare-remodeling",
            Kind::LinkSnap => "link-snap",
            Kind::SetModel => "set-model",
        }
    }
}

/// Routes the runner's calls for one task kind to the device manager.
pub(crate) struct DeviceTaskHandler {
    manager: DeviceManager,
    kind: Kind,
}

impl DeviceTaskHandler {
    pub(crate) fn new(manager: DeviceManager, kind: Kind) -> Self {
        Self { manager, kind }
    }
}

#[async_trait]
impl TaskHandler for DeviceTaskHandler {
    async fn run(&self, task: &TaskId) -> Result<TaskOutcome, TaskError> {
        let m = &self.manager;
        match self.kind {
            Kind::InstallSeedSnap => m.do_install_seed_snap(task).await,
            Kind::MarkSeeded => m.do_mark_seeded(task).await,
            Kind::RunHook => m.do_run_hook(task).await,
            Kind::GenerateDeviceKey => m.do_generate_device_key(task).await,
            Kind::RequestSerial => m.do_request_serial(task).await,
            Kind::SetupRunSystem => m.do_setup_run_system(task).await,
            Kind::FactoryResetRunSystem => m.do_factory_reset_run_system(task).await,
            Kind::RestartSystemToRunMode => m.do_restart_system_to_run_mode(task).await,
            Kind::InstallSetupStorageEncryption => {
                m.do_install_setup_storage_encryption(task).await
            }
            Kind::InstallFinish => m.do_install_finish(task).await,
            Kind::CreateRecoverySystem => m.do_create_recovery_system(task).await,
            Kind::FinalizeRecoverySystem => m.do_finalize_recovery_system(task).await,
            Kind::RemoveRecoverySystem => m.do_remove_recovery_system(task).await,
            Kind::PrepareRemodeling => m.do_prepare_remodeling(task).await,
            Kind::LinkSnap => m.do_link_snap(task).await,
            Kind::SetModel => m.do_set_model(task).await,
        }
    }

    fn has_undo(&self) -> bool {
        matches!(
            self.kind,
            Kind::CreateRecoverySystem | Kind::FinalizeRecoverySystem | Kind::LinkSnap | Kind::SetModel
        )
    }

    async fn undo(&self, task: &TaskId) -> Result<(), TaskError> {
        let m = &self.manager;
        match self.kind {
            Kind::CreateRecoverySystem => m.undo_create_recovery_system(task).await,
            Kind::FinalizeRecoverySystem => m.undo_finalize_recovery_system(task).await,
            Kind::LinkSnap => m.undo_link_snap(task).await,
            Kind::SetModel => m.undo_set_model(task).await,
            _ => Ok(()),
        }
    }

    async fn cleanup(&self, task: &TaskId) -> Result<(), TaskError> {
        let m = &self.manager;
        match self.kind {
            Kind::CreateRecoverySystem => m.cleanup_create_recovery_system(task).await,
            Kind::InstallFinish => m.cleanup_install_finish(task).await,
            _ => Ok(()),
        }
    }
}
