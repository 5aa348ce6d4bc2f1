//! Install mode: turning the recovery system into an installed run system.

use tracing::info;

use dl_core::encryption::has_required_keys;
use dl_core::model::Grade;
use dl_core::ports::{InstallKind, InstallOptions, MakeRunnableRequest, RestartKind, TargetConfig};
use dl_core::{ChangeId, ModelAssertion, State, StateError, SystemMode, TaskId};

use super::hooks::HookSetup;
use super::{DeviceManager, DeviceManagerError};
use crate::engine::{TaskError, TaskOutcome};

pub(super) const INSTALL_DEVICE_HOOK: &str = "install-device";

/// The tasks of an install-like change.
pub(super) struct InstallChain<'a> {
    pub change_kind: &'a str,
    pub change_summary: &'a str,
    pub first_kind: &'a str,
    pub first_summary: &'a str,
    /// Gadget snap carrying an `install-device` hook, if any.
    pub hook_snap: Option<&'a str>,
}

/// `first` → optional `run-hook` (install-device) → `restart-system-to-run-mode`.
pub(super) fn new_install_change(
    st: &mut State,
    chain: &InstallChain<'_>,
) -> Result<ChangeId, StateError> {
    let g = st.graph_mut();
    let chg = g.new_change(chain.change_kind, chain.change_summary);
    let first = g.new_task(chain.first_kind, chain.first_summary);
    g.add_task(&chg, &first)?;
    let mut ids = vec![first];

    let hook = match chain.hook_snap {
        Some(snap) => {
            let hook = g.new_task("run-hook", "Run install-device hook");
            g.task_mut(&hook)?.set(
                "hook-setup",
                &HookSetup {
                    snap: snap.to_string(),
                    hook: INSTALL_DEVICE_HOOK.into(),
                    optional: true,
                },
            )?;
            g.add_task(&chg, &hook)?;
            ids.push(hook.clone());
            Some(hook)
        }
        None => None,
    };

    let restart = g.new_task("restart-system-to-run-mode", "Ensure next boot to run mode");
    g.add_task(&chg, &restart)?;
    ids.push(restart.clone());
    if let Some(hook) = hook {
        g.task_mut(&hook)?.set("restart-task", &restart)?;
    }
    g.chain(&ids)?;
    Ok(chg)
}

pub(super) fn change_kind(kind: InstallKind) -> &'static str {
    match kind {
        InstallKind::Install => "install-system",
        InstallKind::FactoryReset => "factory-reset",
    }
}

impl DeviceManager {
    pub(super) async fn ensure_installed(&self) -> Result<(), DeviceManagerError> {
        if self.mode.mode != SystemMode::Install {
            return Ok(());
        }
        if !self.ready_for_install_like(InstallKind::Install).await? {
            return Ok(());
        }

        let model = self.require_model().await?;
        let hook_snap = self.gadget_install_hook(&model).await?;

        let mut st = self.state.lock().await;
        let chg = new_install_change(
            &mut st,
            &InstallChain {
                change_kind: change_kind(InstallKind::Install),
                change_summary: "Install the system",
                first_kind: "setup-run-system",
                first_summary: "Setup system for run mode",
                hook_snap: hook_snap.as_deref(),
            },
        )?;
        info!(change = %chg, model = %model.identity(), "created install-system change");
        Ok(())
    }

    /// Shared gate of the install and factory reset checks: once per
    /// process, after seeding, and only while no change of that kind exists.
    pub(super) async fn ready_for_install_like(
        &self,
        kind: InstallKind,
    ) -> Result<bool, DeviceManagerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let ran = match kind {
            InstallKind::Install => &mut lifecycle.ensure_installed_ran,
            InstallKind::FactoryReset => &mut lifecycle.ensure_factory_reset_ran,
        };
        if *ran {
            return Ok(false);
        }
        let st = self.state.lock().await;
        if !super::is_seeded(&st)? {
            return Ok(false);
        }
        // set before creating the change, a failed attempt is not repeated
        *ran = true;
        Ok(st.graph().changes_of_kind(change_kind(kind)).is_empty())
    }

    pub(super) async fn gadget_install_hook(
        &self,
        model: &ModelAssertion,
    ) -> Result<Option<String>, DeviceManagerError> {
        let Some(gadget) = &model.gadget else {
            return Ok(None);
        };
        let present = self
            .deps
            .hooks
            .has_hook(gadget, INSTALL_DEVICE_HOOK)
            .await?;
        Ok(present.then(|| gadget.clone()))
    }

    pub(super) async fn do_setup_run_system(&self, task: &TaskId) -> Result<TaskOutcome, TaskError> {
        self.run_system(task, InstallKind::Install).await
    }

    /// Installs (or factory resets) the run system from the recovery
    /// system the device booted.
    pub(super) async fn run_system(
        &self,
        task: &TaskId,
        kind: InstallKind,
    ) -> Result<TaskOutcome, TaskError> {
        let label = self.boot_recovery_system()?;
        let model = self.require_model().await?;
        let system = self
            .deps
            .seed
            .load_system(Some(&label))
            .await
            .map_err(TaskError::failed)?;

        let decision = self
            .decide_encryption(&model, &system.gadget)
            .await
            .map_err(|e| TaskError::Configuration(e.to_string()))?;

        let save = match kind {
            InstallKind::FactoryReset => Some(self.check_factory_reset_save(decision.encrypted()).await?),
            InstallKind::Install => None,
        };
        let verb = match kind {
            InstallKind::Install => "install system",
            InstallKind::FactoryReset => "perform factory reset",
        };

        match decision.backend {
            Some(backend) => {
                self.task_log(task, format!("Encrypting device storage ({backend:?})"))
                    .await?
            }
            None => self.task_log(task, "Device storage will not be encrypted").await?,
        }

        let installed = self
            .deps
            .install
            .run(&InstallOptions {
                kind,
                recovery_system: label.clone(),
                backend: decision.backend,
            })
            .await
            .map_err(|e| TaskError::failed(format!("cannot {verb}: {e}")))?;

        if decision.encrypted() && !has_required_keys(installed.keys.as_ref()) {
            return Err(TaskError::Internal("system encryption keys are unset".into()));
        }

        self.deps
            .install
            .save_storage_traits(&installed.storage_traits)
            .await
            .map_err(|e| TaskError::failed(format!("cannot save storage traits: {e}")))?;

        let keys = if decision.encrypted() {
            installed.keys.as_ref()
        } else {
            None
        };
        self.deps
            .boot
            .make_runnable(
                &MakeRunnableRequest {
                    model: model.clone(),
                    recovery_system: label.clone(),
                    backend: decision.backend,
                    factory_reset: kind == InstallKind::FactoryReset,
                },
                keys,
            )
            .await
            .map_err(|e| TaskError::failed(format!("cannot make system runnable: {e}")))?;

        if kind == InstallKind::Install
            && self
                .deps
                .install
                .restore_preseed_artifact(&label)
                .await
                .map_err(|e| TaskError::failed(format!("cannot restore preseed artifact: {e}")))?
        {
            self.task_log(task, "Restored preseed artifact").await?;
        }

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

        if let Some(save) = save {
            self.restore_registration(task, &save).await?;
        }

        self.task_log(task, format!("Run system set up from recovery system {label}"))
            .await?;
        Ok(TaskOutcome::Done)
    }

    pub(super) async fn do_restart_system_to_run_mode(
        &self,
        task: &TaskId,
    ) -> Result<TaskOutcome, TaskError> {
        let label = self.boot_recovery_system()?;
        let restart: RestartKind = {
            let st = self.state.lock().await;
            st.task(task)?.get("restart-mode")?.unwrap_or_default()
        };

        self.deps
            .boot
            .ensure_next_boot_to_run_mode(&label)
            .await
            .map_err(|e| TaskError::failed(format!("cannot ensure next boot to run mode: {e}")))?;

        let mut st = self.state.lock().await;
        st.task_mut(task)?
            .logf(format!("Request system {restart} into run mode"));
        Ok(TaskOutcome::DoneWithRestart(restart))
    }

    pub(super) fn boot_recovery_system(&self) -> Result<String, TaskError> {
        self.mode
            .recovery_system
            .clone()
            .ok_or_else(|| TaskError::Internal("recovery system label is unset".into()))
    }
}
