//! Remodeling: moving the device to a new model assertion.
//!
//! The change starts as `prepare-remodeling` → `set-model`. Preparation
//! asks the planner for the snaps of the new model and injects the link
//! tasks, plus the creation and test of a new recovery system for graded
//! models, between the two.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{error, info};

use dl_core::model::classify_remodel;
use dl_core::ports::{AssertionError, DeviceServiceError, RemodelContext};
use dl_core::recovery::{LocalSnap, RecoverySystemSetup};
use dl_core::snap::{InstalledSnap, SnapRegistry, SnapSetup};
use dl_core::state::keys;
use dl_core::{ChangeId, ModelAssertion, RemodelKind, TaskId, TaskSet};

use super::recovery_systems::{check_exclusive, recovery_system_tasks, remove_tried};
use super::{change_data, device_state, is_seeded, task_data, DeviceManager, DeviceManagerError};
use crate::engine::{TaskError, TaskOutcome};

const SESSION_RETRY: Duration = Duration::from_secs(60);
const PRE_IMAGE_KEY: &str = "required-pre-image";
const PREVIOUS_SNAP_KEY: &str = "previous-snap";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemodelOptions {
    /// Snap files to use instead of what the planner picks.
    pub local_snaps: Vec<LocalSnap>,
}

impl DeviceManager {
    pub async fn remodel(
        &self,
        new_model: ModelAssertion,
        opts: RemodelOptions,
    ) -> Result<ChangeId, DeviceManagerError> {
        self.require_run_mode("remodel")?;
        {
            let st = self.state.lock().await;
            if !is_seeded(&st)? {
                return Err(DeviceManagerError::NotAvailable(
                    "cannot remodel until fully seeded".into(),
                ));
            }
        }
        let old = self.current_model().await?.ok_or_else(|| {
            DeviceManagerError::NotAvailable("cannot remodel without a current model".into())
        })?;
        if old.grade != new_model.grade {
            return Err(DeviceManagerError::GradeChange {
                from: old.grade,
                to: new_model.grade,
            });
        }
        let kind = classify_remodel(&old, &new_model);
        if kind == RemodelKind::Update && new_model.revision < old.revision {
            return Err(DeviceManagerError::NotAvailable(format!(
                "cannot remodel to older revision {} of model {}",
                new_model.revision,
                new_model.identity()
            )));
        }

        let label = if new_model.has_recovery_systems() {
            Some(self.remodel_recovery_label().await?)
        } else {
            None
        };

        let summary = match kind {
            RemodelKind::Update => format!(
                "Refresh model assertion from revision {} to {}",
                old.revision, new_model.revision
            ),
            _ => format!(
                "Remodel device to {} ({})",
                new_model.identity(),
                new_model.revision
            ),
        };

        let mut st = self.state.lock().await;
        check_exclusive(&st, "remodel")?;
        let g = st.graph_mut();
        let chg = g.new_change("remodel", &summary);
        {
            let change = g.change_mut(&chg)?;
            change.set("new-model", &new_model)?;
            change.set("remodel-kind", &kind)?;
            change.set("recovery-system-label", &label)?;
            change.set("local-snaps", &opts.local_snaps)?;
        }
        let prepare = g.new_task("prepare-remodeling", "Prepare remodeling");
        let set_model = g.new_task("set-model", "Set new model assertion");
        g.add_task(&chg, &prepare)?;
        g.add_task(&chg, &set_model)?;
        g.wait_for(&set_model, &prepare)?;
        drop(st);

        self.checkpoint().await?;
        info!(change = %chg, %kind, from = %old.identity(), to = %new_model.identity(), "created remodel change");
        Ok(chg)
    }

    /// Date based label, suffixed when a system with that label exists.
    async fn remodel_recovery_label(&self) -> Result<String, DeviceManagerError> {
        let base = self.deps.clock.now().format("%Y%m%d").to_string();
        let mut label = base.clone();
        let mut n = 1;
        while self
            .deps
            .seed_writer
            .exists(&self.deps.seed_writer.system_dir(&label))
            .await?
        {
            label = format!("{base}-{n}");
            n += 1;
        }
        Ok(label)
    }

    pub(super) async fn do_prepare_remodeling(
        &self,
        task: &TaskId,
    ) -> Result<TaskOutcome, TaskError> {
        let (new_model, kind, label, local_snaps, device, installed) = {
            let st = self.state.lock().await;
            let new_model: ModelAssertion = change_data(&st, task, "new-model")?;
            let kind: RemodelKind = change_data(&st, task, "remodel-kind")?;
            let change = st.task_change(task)?;
            let label: Option<String> = change.get("recovery-system-label")?;
            let local_snaps: Vec<LocalSnap> = change.get("local-snaps")?.unwrap_or_default();
            let installed: SnapRegistry = st.get(keys::SNAPS)?.unwrap_or_default();
            (new_model, kind, label, local_snaps, device_state(&st)?, installed)
        };
        let old_model = self.require_model().await?;

        let store_session = match kind {
            RemodelKind::Update => device.session_macaroon.clone(),
            _ => match self
                .deps
                .device_service
                .open_store_session(&new_model, &device)
                .await
            {
                Ok(session) => session,
                Err(DeviceServiceError::Transient(msg)) => {
                    self.task_log(task, format!("Cannot get a store session, will retry: {msg}"))
                        .await?;
                    return Ok(TaskOutcome::Retry(SESSION_RETRY));
                }
                Err(err) => {
                    return Err(TaskError::failed(format!(
                        "cannot get a store session based on the new model assertion: {err}"
                    )))
                }
            },
        };

        let required = new_model.all_required_snaps();
        let mut setups = self
            .deps
            .planner
            .plan(&RemodelContext {
                old_model,
                new_model: new_model.clone(),
                kind,
                installed: installed.clone(),
                store_session: store_session.clone(),
            })
            .await
            .map_err(|e| TaskError::failed(format!("cannot plan remodel: {e}")))?;
        for local in &local_snaps {
            match setups.iter_mut().find(|s| s.name == local.name) {
                Some(setup) => {
                    setup.path = local.path.clone();
                    if !local.revision.is_empty() {
                        setup.revision = local.revision.clone();
                    }
                }
                None => setups.push(SnapSetup {
                    name: local.name.clone(),
                    revision: local.revision.clone(),
                    path: local.path.clone(),
                    kind: installed.get(&local.name).map(|s| s.kind).unwrap_or_default(),
                    required: required.contains(&local.name),
                }),
            }
        }

        let mut st = self.state.lock().await;
        let mut ts = TaskSet::new();
        let mut links: Vec<TaskId> = Vec::new();
        {
            let g = st.graph_mut();
            for setup in &setups {
                let id = g.new_task(
                    "link-snap",
                    &format!(
                        "Make snap {:?} (rev {}) available to the system",
                        setup.name, setup.revision
                    ),
                );
                g.task_mut(&id)?.set("snap-setup", setup)?;
                if let Some(prev) = links.last() {
                    g.wait_for(&id, prev)?;
                }
                links.push(id.clone());
                ts.add(id);
            }
        }
        if let Some(label) = &label {
            let rs = RecoverySystemSetup {
                label: label.clone(),
                directory: self.deps.seed_writer.system_dir(label),
                local_snaps,
                snap_setup_tasks: links,
                test_system: true,
                mark_default: true,
                new_files: Vec::new(),
            };
            ts.add_all(&recovery_system_tasks(&mut st, &rs)?);
        }
        if kind != RemodelKind::Update {
            let change_id = st.task_change(task)?.id.clone();
            st.graph_mut()
                .change_mut(&change_id)?
                .set("store-session", &store_session)?;
        }
        st.graph_mut().inject(task, &ts)?;
        st.task_mut(task)?.logf(format!(
            "Prepared {kind} to {} with {} snap(s)",
            new_model.identity(),
            setups.len()
        ));
        Ok(TaskOutcome::Done)
    }

    pub(super) async fn do_link_snap(&self, task: &TaskId) -> Result<TaskOutcome, TaskError> {
        let mut st = self.state.lock().await;
        let setup: SnapSetup = task_data(&st, task, "snap-setup")?;
        let mut registry: SnapRegistry = st.get(keys::SNAPS)?.unwrap_or_default();
        if !st.task(task)?.data.contains_key(PREVIOUS_SNAP_KEY) {
            let previous = registry.get(&setup.name).cloned();
            st.task_mut(task)?.set(PREVIOUS_SNAP_KEY, &previous)?;
        }
        registry.insert(setup.name.clone(), InstalledSnap::from(&setup));
        st.set(keys::SNAPS, &registry)?;
        st.task_mut(task)?.logf(format!(
            "Snap {:?} revision {} available",
            setup.name, setup.revision
        ));
        Ok(TaskOutcome::Done)
    }

    pub(super) async fn undo_link_snap(&self, task: &TaskId) -> Result<(), TaskError> {
        let mut st = self.state.lock().await;
        let setup: SnapSetup = task_data(&st, task, "snap-setup")?;
        let previous: Option<InstalledSnap> = st.task(task)?.get(PREVIOUS_SNAP_KEY)?;
        let mut registry: SnapRegistry = st.get(keys::SNAPS)?.unwrap_or_default();
        match previous {
            Some(previous) => {
                registry.insert(setup.name.clone(), previous);
            }
            None => {
                registry.remove(&setup.name);
            }
        }
        st.set(keys::SNAPS, &registry)?;
        st.task_mut(task)?
            .logf(format!("Reverted snap {:?}", setup.name));
        Ok(())
    }

    pub(super) async fn do_set_model(&self, task: &TaskId) -> Result<TaskOutcome, TaskError> {
        let (new_model, kind, label, device) = {
            let mut st = self.state.lock().await;
            let new_model: ModelAssertion = change_data(&st, task, "new-model")?;
            let kind: RemodelKind = change_data(&st, task, "remodel-kind")?;
            let label: Option<String> = st.task_change(task)?.get("recovery-system-label")?;
            let mut device = device_state(&st)?;
            device.brand = new_model.brand_id.clone();
            device.model = new_model.model.clone();
            match kind {
                RemodelKind::Update => {}
                RemodelKind::StoreSwitch => {
                    device.session_macaroon = change_data(&st, task, "store-session")?;
                }
                RemodelKind::Reregistration => {
                    device.serial.clear();
                    device.session_macaroon.clear();
                }
            }

            let mut registry: SnapRegistry = st.get(keys::SNAPS)?.unwrap_or_default();
            if !st.task(task)?.has(PRE_IMAGE_KEY) {
                let pre_image: BTreeMap<String, bool> = registry
                    .values()
                    .map(|s| (s.name.clone(), s.required))
                    .collect();
                st.task_mut(task)?.set(PRE_IMAGE_KEY, &pre_image)?;
            }
            let required = new_model.all_required_snaps();
            for snap in registry.values_mut() {
                snap.required = required.contains(&snap.name);
            }
            st.set(keys::SNAPS, &registry)?;
            (new_model, kind, label, device)
        };

        match self.deps.assertions.add_model(&new_model).await {
            Ok(()) | Err(AssertionError::SameRevision(_)) => {}
            Err(err) => {
                self.restore_required_flags(task).await?;
                return Err(TaskError::failed(format!(
                    "cannot add new model assertion: {err}"
                )));
            }
        }

        // the new model is committed, later failures are only reported
        {
            let mut st = self.state.lock().await;
            if let Err(err) = st.set(keys::DEVICE, &device) {
                error!(error = %err, "cannot record the new device identity");
            }
            if let Ok(t) = st.task_mut(task) {
                t.logf(format!(
                    "Set new model assertion {} revision {}",
                    new_model.identity(),
                    new_model.revision
                ));
            }
        }
        if kind == RemodelKind::Reregistration {
            self.lifecycle.lock().await.reset_registration_backoff();
        }
        info!(model = %new_model.identity(), revision = new_model.revision, %kind, "model changed");

        if let Some(label) = label.filter(|_| new_model.has_recovery_systems()) {
            if let Err(err) = self.promote_remodel_system(task, &label, &new_model).await {
                error!(label = %label, error = %err, "cannot promote remodel recovery system");
                if let Ok(t) = self.state.lock().await.task_mut(task) {
                    t.errorf(format!("Cannot promote recovery system {label:?}: {err}"));
                }
            }
        }
        Ok(TaskOutcome::Done)
    }

    async fn promote_remodel_system(
        &self,
        task: &TaskId,
        label: &str,
        model: &ModelAssertion,
    ) -> Result<(), TaskError> {
        let tried: Vec<String> = {
            let st = self.state.lock().await;
            st.get(keys::TRIED_SYSTEMS)?.unwrap_or_default()
        };
        if !tried.iter().any(|l| l == label) {
            return Err(TaskError::failed(format!(
                "recovery system {label:?} was not successfully tried"
            )));
        }
        self.deps
            .boot
            .promote_tried_recovery_system(label, &tried)
            .await
            .map_err(TaskError::failed)?;
        self.promote_recovery_system(task, label, model, true, true)
            .await?;
        let mut st = self.state.lock().await;
        remove_tried(&mut st, label)?;
        Ok(())
    }

    pub(super) async fn undo_set_model(&self, task: &TaskId) -> Result<(), TaskError> {
        self.restore_required_flags(task).await
    }

    async fn restore_required_flags(&self, task: &TaskId) -> Result<(), TaskError> {
        let mut st = self.state.lock().await;
        let Some(pre_image) = st.task(task)?.get::<BTreeMap<String, bool>>(PRE_IMAGE_KEY)? else {
            return Ok(());
        };
        let mut registry: SnapRegistry = st.get(keys::SNAPS)?.unwrap_or_default();
        for (name, required) in pre_image {
            if let Some(snap) = registry.get_mut(&name) {
                snap.required = required;
            }
        }
        st.set(keys::SNAPS, &registry)?;
        Ok(())
    }
}
