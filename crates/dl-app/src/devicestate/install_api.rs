//! Step-wise installation driven by an external installer.
//!
//! `install-setup-storage-encryption` keeps its result in memory until the
//! matching `install-finish` consumes it; the data holds key material and
//! is never persisted.

use tracing::info;

use dl_core::encryption::has_required_keys;
use dl_core::model::Grade;
use dl_core::ports::{MakeRunnableRequest, TargetConfig};
use dl_core::recovery::validate_label;
use dl_core::{ChangeId, SystemMode, TaskId};

use super::{task_data, DeviceManager, DeviceManagerError};
use crate::engine::{TaskError, TaskOutcome};

impl DeviceManager {
    pub async fn install_setup_storage_encryption(
        &self,
        label: &str,
    ) -> Result<ChangeId, DeviceManagerError> {
        self.new_install_step(
            label,
            "install-step-setup-storage-encryption",
            &format!("Setup storage encryption for installing system {label:?}"),
            "install-setup-storage-encryption",
        )
        .await
    }

    pub async fn install_finish(&self, label: &str) -> Result<ChangeId, DeviceManagerError> {
        self.new_install_step(
            label,
            "install-step-finish",
            &format!("Finish setup of run system for {label:?}"),
            "install-finish",
        )
        .await
    }

    async fn new_install_step(
        &self,
        label: &str,
        change_kind: &str,
        summary: &str,
        task_kind: &str,
    ) -> Result<ChangeId, DeviceManagerError> {
        validate_label(label)?;
        if self.mode.mode != SystemMode::Install {
            return Err(DeviceManagerError::NotAvailable(format!(
                "cannot use install API in {} mode",
                self.mode.mode
            )));
        }

        let mut st = self.state.lock().await;
        if let Some(chg) = st.graph().live_change_of_kind(change_kind) {
            return Err(DeviceManagerError::Conflict {
                op: summary.to_lowercase(),
                kind: chg.kind.clone(),
            });
        }
        let g = st.graph_mut();
        let chg = g.new_change(change_kind, summary);
        let task = g.new_task(task_kind, summary);
        g.task_mut(&task)?.set("system-label", label)?;
        g.add_task(&chg, &task)?;
        drop(st);

        self.checkpoint().await?;
        info!(change = %chg, label, kind = change_kind, "created install step change");
        Ok(chg)
    }

    pub(super) async fn do_install_setup_storage_encryption(
        &self,
        task: &TaskId,
    ) -> Result<TaskOutcome, TaskError> {
        let label: String = {
            let st = self.state.lock().await;
            task_data(&st, task, "system-label")?
        };
        let system = self
            .deps
            .seed
            .load_system(Some(&label))
            .await
            .map_err(TaskError::failed)?;

        let decision = self
            .decide_encryption(&system.model, &system.gadget)
            .await
            .map_err(|e| TaskError::Configuration(e.to_string()))?;
        let Some(backend) = decision.backend else {
            let reason = decision
                .unavailable_reason
                .unwrap_or_else(|| "not requested by the model".into());
            return Err(TaskError::Configuration(format!(
                "cannot setup storage encryption for system {label:?}: encryption unavailable: {reason}"
            )));
        };

        let setup = self
            .deps
            .install
            .setup_storage_encryption(&label, backend)
            .await
            .map_err(|e| TaskError::failed(format!("cannot setup storage encryption: {e}")))?;
        if !has_required_keys(Some(&setup.keys)) {
            return Err(TaskError::Internal("system encryption keys are unset".into()));
        }

        self.encryption_cache
            .lock()
            .await
            .insert(label.clone(), setup);
        self.task_log(task, format!("Storage encryption set up for system {label:?}"))
            .await?;
        Ok(TaskOutcome::Done)
    }

    pub(super) async fn do_install_finish(&self, task: &TaskId) -> Result<TaskOutcome, TaskError> {
        let label: String = {
            let st = self.state.lock().await;
            task_data(&st, task, "system-label")?
        };
        let system = self
            .deps
            .seed
            .load_system(Some(&label))
            .await
            .map_err(TaskError::failed)?;
        let encryption = self.encryption_cache.lock().await.get(&label).cloned();
        // Without a cached setup, finishing is only valid for systems that
        // would not be encrypted anyway.
        if encryption.is_none() {
            let decision = self
                .decide_encryption(&system.model, &system.gadget)
                .await
                .map_err(|e| TaskError::Configuration(e.to_string()))?;
            if decision.backend.is_some() {
                return Err(TaskError::Configuration(format!(
                    "cannot finish install: storage encryption for system {label:?} was not set up"
                )));
            }
        }

        self.deps
            .install
            .finish_install(&label, encryption.as_ref())
            .await
            .map_err(|e| TaskError::failed(format!("cannot finish installation: {e}")))?;

        let model = system.model;
        self.deps
            .boot
            .make_runnable(
                &MakeRunnableRequest {
                    model: model.clone(),
                    recovery_system: label.clone(),
                    backend: encryption.as_ref().map(|e| e.backend),
                    factory_reset: false,
                },
                encryption.as_ref().map(|e| &e.keys),
            )
            .await
            .map_err(|e| TaskError::failed(format!("cannot make system runnable: {e}")))?;
        self.deps
            .install
            .write_model_and_clock(&model)
            .await
            .map_err(|e| TaskError::failed(format!("cannot store the model: {e}")))?;
        self.deps
            .install
            .configure_target(&TargetConfig {
                grade: model.grade,
                allow_cloud_init: model.grade != Grade::Secured,
                apply_gadget_defaults: true,
            })
            .await
            .map_err(|e| TaskError::failed(format!("cannot configure target system: {e}")))?;

        self.task_log(task, format!("Finished installing system {label:?}"))
            .await?;
        Ok(TaskOutcome::Done)
    }

    pub(super) async fn cleanup_install_finish(&self, task: &TaskId) -> Result<(), TaskError> {
        let label: String = {
            let st = self.state.lock().await;
            task_data(&st, task, "system-label")?
        };
        self.encryption_cache.lock().await.remove(&label);
        Ok(())
    }
}
