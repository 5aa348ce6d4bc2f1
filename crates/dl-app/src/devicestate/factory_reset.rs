use tracing::{info, warn};

use dl_core::ports::{AssertionError, InstallKind, SaveContents};
use dl_core::{SystemMode, TaskId};

use super::install_mode::{change_kind, new_install_change, InstallChain};
use super::{DeviceManager, DeviceManagerError};
use crate::engine::{TaskError, TaskOutcome};

fn encryption_label(encrypted: bool) -> &'static str {
    if encrypted {
        "encrypted"
    } else {
        "unencrypted"
    }
}

impl DeviceManager {
    pub(super) async fn ensure_factory_reset(&self) -> Result<(), DeviceManagerError> {
        if self.mode.mode != SystemMode::FactoryReset {
            return Ok(());
        }
        if !self.ready_for_install_like(InstallKind::FactoryReset).await? {
            return Ok(());
        }

        let model = self.require_model().await?;
        let hook_snap = self.gadget_install_hook(&model).await?;

        let mut st = self.state.lock().await;
        let chg = new_install_change(
            &mut st,
            &InstallChain {
                change_kind: change_kind(InstallKind::FactoryReset),
                change_summary: "Perform factory reset of the system",
                first_kind: "factory-reset-run-system",
                first_summary: "Perform factory reset of the system",
                hook_snap: hook_snap.as_deref(),
            },
        )?;
        info!(change = %chg, model = %model.identity(), "created factory-reset change");
        Ok(())
    }

    pub(super) async fn do_factory_reset_run_system(
        &self,
        task: &TaskId,
    ) -> Result<TaskOutcome, TaskError> {
        self.run_system(task, InstallKind::FactoryReset).await
    }

    /// Refuses to reset when the save partition was set up with a different
    /// encryption than the one decided now.
    pub(super) async fn check_factory_reset_save(
        &self,
        encrypted: bool,
    ) -> Result<SaveContents, TaskError> {
        let save = self
            .deps
            .install
            .inspect_save()
            .await
            .map_err(|e| TaskError::failed(format!("cannot inspect save partition: {e}")))?;
        if let Some(previous) = save.encrypted {
            if previous != encrypted {
                return Err(TaskError::Configuration(format!(
                    "cannot perform factory reset: encryption of the previous installation ({}) \
                     does not match the current one ({})",
                    encryption_label(previous),
                    encryption_label(encrypted)
                )));
            }
        }
        Ok(save)
    }

    /// Carries the device identity over from the save partition. Only the
    /// first serial whose key is also on save is restored.
    pub(super) async fn restore_registration(
        &self,
        task: &TaskId,
        save: &SaveContents,
    ) -> Result<(), TaskError> {
        let mut restored = false;
        for serial in &save.serials {
            let key_on_save = save.device_keys.contains(&serial.device_key_id);
            if restored || !key_on_save {
                self.task_log(
                    task,
                    format!(
                        "Ignoring serial assertion {} for device key {}",
                        serial.serial, serial.device_key_id
                    ),
                )
                .await?;
                continue;
            }

            if let Err(err) = self
                .deps
                .install
                .restore_device_key(&serial.device_key_id)
                .await
            {
                warn!(key = %serial.device_key_id, error = %err, "cannot restore device key");
                continue;
            }
            match self.deps.assertions.add_serial(serial).await {
                Ok(()) | Err(AssertionError::SameRevision(_)) => {}
                Err(err) => {
                    return Err(TaskError::failed(format!(
                        "cannot restore serial assertion: {err}"
                    )))
                }
            }
            self.task_log(
                task,
                format!(
                    "Restored serial {} for device key {}",
                    serial.serial, serial.device_key_id
                ),
            )
            .await?;
            restored = true;
        }
        if !restored {
            self.task_log(task, "No device registration restored from save")
                .await?;
        }
        Ok(())
    }
}
