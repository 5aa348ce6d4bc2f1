use tracing::{debug, info, info_span, warn, Instrument};

use dl_core::ports::CloudInitRestriction;
use dl_core::state::keys;
use dl_core::SystemMode;

use super::{is_seeded, DeviceManager, DeviceManagerError, EnsureError};

impl DeviceManager {
    /// One reconciliation pass.
    ///
    /// Each step looks at the persisted state and creates whatever change
    /// is missing. Steps do not short-circuit: all of them run and their
    /// failures are reported together.
    pub async fn ensure(&self) -> Result<(), EnsureError> {
        let _ensure_guard = self.ensure_lock.lock().await;

        let span = info_span!("devicestate.ensure", mode = %self.mode.mode);
        async {
            let mut errors = Vec::new();

            let seeded = self.ensure_seeded().await;
            self.collect(&mut errors, seeded).await;

            if self.options.preseed {
                debug!("preseeding, skipping remaining ensure steps");
                return finish(errors);
            }

            let cloud_init = self.ensure_cloud_init_restricted().await;
            self.collect(&mut errors, cloud_init).await;
            let installed = self.ensure_installed().await;
            self.collect(&mut errors, installed).await;
            let factory_reset = self.ensure_factory_reset().await;
            self.collect(&mut errors, factory_reset).await;
            let operational = self.ensure_operational().await;
            self.collect(&mut errors, operational).await;
            let boot_ok = self.ensure_boot_ok().await;
            self.collect(&mut errors, boot_ok).await;
            let tried = self.ensure_tried_recovery_system().await;
            self.collect(&mut errors, tried).await;

            finish(errors)
        }
        .instrument(span)
        .await
    }

    async fn collect(
        &self,
        errors: &mut Vec<DeviceManagerError>,
        result: Result<(), DeviceManagerError>,
    ) {
        if let Err(err) = result {
            warn!(error = %err, "ensure step failed");
            errors.push(err);
        }
        if let Err(err) = self.checkpoint().await {
            errors.push(err);
        }
    }

    async fn ensure_cloud_init_restricted(&self) -> Result<(), DeviceManagerError> {
        if self.mode.mode != SystemMode::Run || self.lifecycle.lock().await.cloud_init_done {
            return Ok(());
        }
        {
            let st = self.state.lock().await;
            if !is_seeded(&st)? {
                return Ok(());
            }
        }
        let Some(model) = self.current_model().await? else {
            return Ok(());
        };

        let outcome = self.deps.cloud_init.restrict(model.grade).await?;
        match outcome {
            CloudInitRestriction::Disabled => info!(grade = %model.grade, "cloud-init disabled"),
            CloudInitRestriction::Restricted => info!(grade = %model.grade, "cloud-init restricted"),
            CloudInitRestriction::AlreadyRestricted => debug!("cloud-init already restricted"),
        }
        self.lifecycle.lock().await.cloud_init_done = true;
        Ok(())
    }

    async fn ensure_boot_ok(&self) -> Result<(), DeviceManagerError> {
        if self.mode.mode != SystemMode::Run || !self.mode.has_mode_record {
            return Ok(());
        }
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.boot_ok_ran {
            return Ok(());
        }
        self.deps.boot.mark_boot_successful().await?;
        lifecycle.boot_ok_ran = true;
        info!("boot marked as successful");
        Ok(())
    }

    /// Records the outcome of a recovery system tried on the previous boot.
    async fn ensure_tried_recovery_system(&self) -> Result<(), DeviceManagerError> {
        if self.mode.mode != SystemMode::Run || !self.mode.has_mode_record {
            return Ok(());
        }
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.tried_recovery_system_ran {
            return Ok(());
        }

        if let Some(outcome) = self.deps.boot.inspect_try_recovery_outcome().await? {
            if outcome.success {
                let mut st = self.state.lock().await;
                let mut tried: Vec<String> = st.get(keys::TRIED_SYSTEMS)?.unwrap_or_default();
                if !tried.contains(&outcome.label) {
                    tried.push(outcome.label.clone());
                }
                st.set(keys::TRIED_SYSTEMS, &tried)?;
                info!(label = %outcome.label, "tried recovery system was successful");
            } else {
                warn!(label = %outcome.label, "tried recovery system failed");
            }
            self.deps
                .boot
                .clear_try_recovery_system(&outcome.label)
                .await?;
        }
        lifecycle.tried_recovery_system_ran = true;
        Ok(())
    }
}

fn finish(errors: Vec<DeviceManagerError>) -> Result<(), EnsureError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(EnsureError(errors))
    }
}
