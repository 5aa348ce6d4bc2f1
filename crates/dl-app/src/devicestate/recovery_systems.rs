//! Recovery systems: creation, test boot, promotion and removal.
//!
//! A new system is written next to the existing ones in the seed. Every
//! file it adds is first recorded in its new-file log so that a failed or
//! undone creation removes exactly what it wrote and nothing shared with
//! other systems.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info, warn};

use dl_core::recovery::{
    new_file_log_entry, parse_new_file_log, validate_label, DefaultRecoverySystem, LocalSnap,
    RecoverySystemSetup, SeededSystem,
};
use dl_core::ports::{RestartKind, SeedError};
use dl_core::seed::SeedSnap;
use dl_core::snap::{SnapRegistry, SnapSetup};
use dl_core::state::keys;
use dl_core::{ChangeId, ModelAssertion, State, StateError, SystemMode, TaskId, TaskSet};

use super::{change_data, is_seeded, task_data, DeviceManager, DeviceManagerError};
use crate::engine::{TaskError, TaskOutcome};

const SETUP_KEY: &str = "recovery-system-setup";
const SETUP_TASK_KEY: &str = "recovery-system-setup-task";
const PREVIOUS_DEFAULT_KEY: &str = "previous-default-recovery-system";
const RESTART_PENDING_RETRY: Duration = Duration::from_secs(5);

/// Change kinds that must not run concurrently.
const EXCLUSIVE_KINDS: [&str; 3] = ["create-recovery-system", "remove-recovery-system", "remodel"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateRecoverySystemOptions {
    pub label: String,
    /// Snap files to use instead of the installed revisions.
    pub local_snaps: Vec<LocalSnap>,
    /// Reboot into the new system to test it before promoting it.
    pub test_system: bool,
    pub mark_default: bool,
}

pub(super) fn check_exclusive(st: &State, op: &str) -> Result<(), DeviceManagerError> {
    for kind in EXCLUSIVE_KINDS {
        if st.graph().live_change_of_kind(kind).is_some() {
            return Err(DeviceManagerError::Conflict {
                op: op.to_string(),
                kind: kind.to_string(),
            });
        }
    }
    Ok(())
}

/// Adds the create task, and the finalize task when the system is tested,
/// to the graph. The tasks are not attached to a change yet.
pub(super) fn recovery_system_tasks(
    st: &mut State,
    setup: &RecoverySystemSetup,
) -> Result<TaskSet, StateError> {
    let g = st.graph_mut();
    let create = g.new_task(
        "create-recovery-system",
        &format!("Create recovery system with label {:?}", setup.label),
    );
    g.task_mut(&create)?.set(SETUP_KEY, setup)?;
    for dep in &setup.snap_setup_tasks {
        g.wait_for(&create, dep)?;
    }
    let mut ts = TaskSet::from_tasks(vec![create.clone()]);

    if setup.test_system {
        let finalize = g.new_task(
            "finalize-recovery-system",
            &format!("Finalize recovery system with label {:?}", setup.label),
        );
        g.task_mut(&finalize)?.set(SETUP_TASK_KEY, &create)?;
        g.wait_for(&finalize, &create)?;
        ts.add(finalize);
    }
    Ok(ts)
}

pub(super) fn remove_tried(st: &mut State, label: &str) -> Result<(), StateError> {
    let mut tried: Vec<String> = st.get(keys::TRIED_SYSTEMS)?.unwrap_or_default();
    tried.retain(|l| l != label);
    if tried.is_empty() {
        st.remove(keys::TRIED_SYSTEMS);
        Ok(())
    } else {
        st.set(keys::TRIED_SYSTEMS, &tried)
    }
}

fn is_essential(model: &ModelAssertion, name: &str) -> bool {
    name == "snapd"
        || [&model.base, &model.kernel, &model.gadget]
            .into_iter()
            .flatten()
            .any(|n| n == name)
}

impl DeviceManager {
    pub async fn create_recovery_system(
        &self,
        opts: CreateRecoverySystemOptions,
    ) -> Result<ChangeId, DeviceManagerError> {
        validate_label(&opts.label)?;
        self.require_run_mode("create recovery system")?;

        let directory = self.deps.seed_writer.system_dir(&opts.label);
        if self.deps.seed_writer.exists(&directory).await? {
            return Err(DeviceManagerError::RecoverySystemExists(opts.label));
        }

        let mut st = self.state.lock().await;
        if !is_seeded(&st)? {
            return Err(DeviceManagerError::NotAvailable(
                "cannot create new recovery systems until fully seeded".into(),
            ));
        }
        check_exclusive(&st, "create recovery system")?;

        let setup = RecoverySystemSetup {
            label: opts.label.clone(),
            directory,
            local_snaps: opts.local_snaps,
            snap_setup_tasks: Vec::new(),
            test_system: opts.test_system,
            mark_default: opts.mark_default,
            new_files: Vec::new(),
        };
        let ts = recovery_system_tasks(&mut st, &setup)?;
        let g = st.graph_mut();
        let chg = g.new_change(
            "create-recovery-system",
            &format!("Create new recovery system with label {:?}", opts.label),
        );
        g.add_all(&chg, &ts)?;
        drop(st);

        self.checkpoint().await?;
        info!(change = %chg, label = %opts.label, test = opts.test_system, "created create-recovery-system change");
        Ok(chg)
    }

    pub async fn remove_recovery_system(&self, label: &str) -> Result<ChangeId, DeviceManagerError> {
        validate_label(label)?;
        self.require_run_mode("remove recovery system")?;

        let known = self.deps.seed.list_systems().await?;
        if !known.iter().any(|l| l == label) {
            return Err(DeviceManagerError::NoSuchRecoverySystem(label.to_string()));
        }

        let mut st = self.state.lock().await;
        check_exclusive(&st, "remove recovery system")?;

        let seeded: Vec<SeededSystem> = st.get(keys::SEEDED_SYSTEMS)?.unwrap_or_default();
        let current = seeded
            .first()
            .map(|s| s.system.clone())
            .or_else(|| self.mode.recovery_system.clone());
        if current.as_deref() == Some(label) {
            return Err(DeviceManagerError::RemoveCurrent);
        }
        let default: Option<DefaultRecoverySystem> = st.get(keys::DEFAULT_RECOVERY_SYSTEM)?;
        if default.map(|d| d.system == label).unwrap_or(false) {
            return Err(DeviceManagerError::RemoveDefault);
        }

        let summary = format!("Remove recovery system with label {label:?}");
        let g = st.graph_mut();
        let chg = g.new_change("remove-recovery-system", &summary);
        let task = g.new_task("remove-recovery-system", &summary);
        g.task_mut(&task)?.set("recovery-system-label", label)?;
        g.add_task(&chg, &task)?;
        drop(st);

        self.checkpoint().await?;
        info!(change = %chg, label, "created remove-recovery-system change");
        Ok(chg)
    }

    pub(super) fn require_run_mode(&self, op: &str) -> Result<(), DeviceManagerError> {
        if self.mode.mode != SystemMode::Run {
            return Err(DeviceManagerError::NotAvailable(format!(
                "cannot {op} in {} mode",
                self.mode.mode
            )));
        }
        Ok(())
    }

    /// The model a new recovery system is created for: the remodel target
    /// inside a remodel, the current model otherwise.
    async fn recovery_system_model(&self, task: &TaskId) -> Result<(ModelAssertion, bool), TaskError> {
        let new_model: Option<ModelAssertion> = {
            let st = self.state.lock().await;
            let change = st.task_change(task)?;
            if change.kind == "remodel" {
                Some(change_data(&st, task, "new-model")?)
            } else {
                None
            }
        };
        match new_model {
            Some(model) => Ok((model, true)),
            None => Ok((self.require_model().await?, false)),
        }
    }

    /// Writes the recovery system and either promotes it or sets it up
    /// for a test boot.
    ///
    /// Not resumable: when the task runs again after a crash, the system
    /// directory already exists, so the attempt fails and the partial
    /// system is purged through its new-file log.
    pub(super) async fn do_create_recovery_system(
        &self,
        task: &TaskId,
    ) -> Result<TaskOutcome, TaskError> {
        let (model, in_remodel) = self.recovery_system_model(task).await?;
        let (setup, pending, registry) = {
            let st = self.state.lock().await;
            let setup: RecoverySystemSetup = task_data(&st, task, SETUP_KEY)?;
            let mut pending = Vec::new();
            for dep in &setup.snap_setup_tasks {
                if let Some(snap) = st.task(dep)?.get::<SnapSetup>("snap-setup")? {
                    pending.push(snap);
                }
            }
            let registry: SnapRegistry = st.get(keys::SNAPS)?.unwrap_or_default();
            (setup, pending, registry)
        };

        if let Err(err) = self.write_recovery_system(&setup, &model, &pending, &registry).await {
            self.purge_recovery_system(&setup).await;
            return Err(err);
        }

        if !setup.test_system && !in_remodel {
            self.promote_recovery_system(task, &setup.label, &model, setup.mark_default, false)
                .await?;
            self.task_log(task, format!("Recovery system {:?} created", setup.label))
                .await?;
            return Ok(TaskOutcome::Done);
        }

        let label = &setup.label;
        let tried = async {
            self.deps.boot.set_try_recovery_system(label).await?;
            self.deps
                .boot
                .set_recovery_boot_system_and_mode(label, "recover")
                .await
        }
        .await;
        if let Err(err) = tried {
            self.purge_recovery_system(&setup).await;
            return Err(TaskError::failed(format!(
                "cannot set up recovery system {label:?} for a test boot: {err}"
            )));
        }
        self.task_log(task, format!("Restarting into candidate recovery system {label:?}"))
            .await?;
        Ok(TaskOutcome::DoneWithRestart(RestartKind::Reboot))
    }

    /// Copies the model's snaps into the seed and writes the system
    /// metadata. Snap files already in the seed are shared, not logged.
    async fn write_recovery_system(
        &self,
        setup: &RecoverySystemSetup,
        model: &ModelAssertion,
        pending: &[SnapSetup],
        registry: &SnapRegistry,
    ) -> Result<(), TaskError> {
        let writer = &self.deps.seed_writer;
        writer
            .create_system_dir(&setup.label)
            .await
            .map_err(|e| TaskError::failed(format!("cannot create recovery system directory: {e}")))?;
        let log = setup.new_file_log();

        let mut snaps = Vec::new();
        for name in model.all_required_snaps() {
            let (revision, source, kind) = if let Some(local) =
                setup.local_snaps.iter().find(|s| s.name == name)
            {
                let kind = registry.get(&name).map(|s| s.kind).unwrap_or_default();
                (local.revision.clone(), local.path.clone(), kind)
            } else if let Some(snap) = pending.iter().find(|s| s.name == name) {
                (snap.revision.clone(), snap.path.clone(), snap.kind)
            } else if let Some(snap) = registry.get(&name) {
                (snap.revision.clone(), snap.path.clone(), snap.kind)
            } else {
                return Err(TaskError::failed(format!(
                    "cannot find snap {name:?} for recovery system {:?}",
                    setup.label
                )));
            };

            let target = writer.snap_path(&name, &revision);
            let shared = writer.exists(&target).await.map_err(TaskError::failed)?;
            if !shared {
                writer
                    .append_log(&log, &new_file_log_entry(&target))
                    .await
                    .map_err(|e| TaskError::failed(format!("cannot log new seed file: {e}")))?;
                writer
                    .copy_snap(&source, &target)
                    .await
                    .map_err(|e| TaskError::failed(format!("cannot copy snap {name:?}: {e}")))?;
            }
            let essential = is_essential(model, &name);
            snaps.push(SeedSnap {
                name,
                revision,
                path: target,
                kind,
                essential,
            });
        }

        writer
            .write_system_metadata(&setup.label, model, &snaps)
            .await
            .map_err(|e| TaskError::failed(format!("cannot write recovery system metadata: {e}")))
    }

    /// Removes everything a creation attempt left behind. Failures are
    /// logged only, they must not mask the error that led here.
    async fn purge_recovery_system(&self, setup: &RecoverySystemSetup) {
        let writer = &self.deps.seed_writer;
        let log = setup.new_file_log();
        let written = match writer.read_log(&log).await {
            Ok(content) => parse_new_file_log(&content),
            Err(err) => {
                warn!(label = %setup.label, error = %err, "cannot read new-file log");
                Vec::new()
            }
        };
        for path in written.iter().rev() {
            if let Err(err) = writer.remove_file(path).await {
                warn!(path = %path.display(), error = %err, "cannot remove new seed file");
            }
        }
        if let Err(err) = writer.remove_dir_all(&setup.directory).await {
            warn!(dir = %setup.directory.display(), error = %err, "cannot remove recovery system directory");
        }
        if let Err(err) = self.deps.boot.drop_recovery_system(&setup.label).await {
            warn!(label = %setup.label, error = %err, "cannot drop recovery system from boot config");
        }

        let mut st = self.state.lock().await;
        if let Err(err) = remove_tried(&mut st, &setup.label) {
            error!(label = %setup.label, error = %err, "cannot reset tried recovery systems");
        }
    }

    pub(super) async fn undo_create_recovery_system(&self, task: &TaskId) -> Result<(), TaskError> {
        let setup: RecoverySystemSetup = {
            let st = self.state.lock().await;
            task_data(&st, task, SETUP_KEY)?
        };
        self.purge_recovery_system(&setup).await;
        self.task_log(task, format!("Removed recovery system {:?}", setup.label))
            .await
    }

    /// Drops the new-file log once the change settled.
    pub(super) async fn cleanup_create_recovery_system(&self, task: &TaskId) -> Result<(), TaskError> {
        let setup: RecoverySystemSetup = {
            let st = self.state.lock().await;
            task_data(&st, task, SETUP_KEY)?
        };
        let log = setup.new_file_log();
        if self
            .deps
            .seed_writer
            .exists(&log)
            .await
            .map_err(TaskError::failed)?
        {
            self.deps
                .seed_writer
                .remove_file(&log)
                .await
                .map_err(TaskError::failed)?;
        }
        Ok(())
    }

    pub(super) async fn do_finalize_recovery_system(
        &self,
        task: &TaskId,
    ) -> Result<TaskOutcome, TaskError> {
        if self.deps.restart.pending().is_some() {
            return Ok(TaskOutcome::Retry(RESTART_PENDING_RETRY));
        }

        let (setup, tried) = {
            let st = self.state.lock().await;
            let setup_task: TaskId = task_data(&st, task, SETUP_TASK_KEY)?;
            let setup: RecoverySystemSetup = task_data(&st, &setup_task, SETUP_KEY)?;
            let tried: Vec<String> = st.get(keys::TRIED_SYSTEMS)?.unwrap_or_default();
            (setup, tried)
        };
        let label = setup.label.clone();

        let good = self
            .deps
            .boot
            .good_recovery_systems()
            .await
            .map_err(TaskError::failed)?;
        if good.contains(&label) {
            let mut st = self.state.lock().await;
            remove_tried(&mut st, &label)?;
            st.task_mut(task)?
                .logf(format!("Recovery system {label:?} already promoted"));
            return Ok(TaskOutcome::Done);
        }

        if !tried.contains(&label) {
            let mut st = self.state.lock().await;
            remove_tried(&mut st, &label)?;
            return Err(TaskError::failed(format!(
                "tried recovery system {label:?} failed"
            )));
        }

        let (model, in_remodel) = self.recovery_system_model(task).await?;
        if in_remodel {
            self.task_log(
                task,
                format!("Recovery system {label:?} tested, promotion waits for the new model"),
            )
            .await?;
            return Ok(TaskOutcome::Done);
        }

        self.deps
            .boot
            .promote_tried_recovery_system(&label, &tried)
            .await
            .map_err(|e| TaskError::failed(format!("cannot promote recovery system {label:?}: {e}")))?;
        self.promote_recovery_system(task, &label, &model, setup.mark_default, false)
            .await?;

        let mut st = self.state.lock().await;
        remove_tried(&mut st, &label)?;
        st.task_mut(task)?
            .logf(format!("Recovery system {label:?} promoted"));
        Ok(TaskOutcome::Done)
    }

    pub(super) async fn undo_finalize_recovery_system(&self, task: &TaskId) -> Result<(), TaskError> {
        let label = {
            let st = self.state.lock().await;
            let setup_task: TaskId = task_data(&st, task, SETUP_TASK_KEY)?;
            task_data::<RecoverySystemSetup>(&st, &setup_task, SETUP_KEY)?.label
        };
        self.unpromote_recovery_system(task, &label).await
    }

    /// Marks `label` recovery capable and, when asked, makes it the default
    /// and records it as seeded. The previous default is stashed on `task`.
    pub(super) async fn promote_recovery_system(
        &self,
        task: &TaskId,
        label: &str,
        model: &ModelAssertion,
        mark_default: bool,
        record_seeded: bool,
    ) -> Result<(), TaskError> {
        self.deps
            .boot
            .mark_recovery_capable(label)
            .await
            .map_err(|e| TaskError::failed(format!("cannot mark recovery system {label:?} recovery capable: {e}")))?;

        let now = self.deps.clock.now();
        let mut st = self.state.lock().await;
        if mark_default {
            let previous: Option<DefaultRecoverySystem> = st.get(keys::DEFAULT_RECOVERY_SYSTEM)?;
            st.task_mut(task)?.set(PREVIOUS_DEFAULT_KEY, &previous)?;
            st.set(
                keys::DEFAULT_RECOVERY_SYSTEM,
                &DefaultRecoverySystem::new(label, model, now),
            )?;
        }
        if record_seeded {
            let record = SeededSystem::new(label, model, now);
            let mut seeded: Vec<SeededSystem> = st.get(keys::SEEDED_SYSTEMS)?.unwrap_or_default();
            if !seeded.iter().any(|s| s.same_as(&record)) {
                seeded.insert(0, record);
                st.set(keys::SEEDED_SYSTEMS, &seeded)?;
            }
        }
        Ok(())
    }

    /// Reverts [`Self::promote_recovery_system`] as far as state goes.
    pub(super) async fn unpromote_recovery_system(
        &self,
        task: &TaskId,
        label: &str,
    ) -> Result<(), TaskError> {
        if let Err(err) = self.deps.boot.unmark_recovery_capable(label).await {
            warn!(label, error = %err, "cannot unmark recovery capable system");
        }
        let mut st = self.state.lock().await;
        let t = st.task(task)?;
        // present, possibly null, only when the promotion replaced the default
        if t.data.contains_key(PREVIOUS_DEFAULT_KEY) {
            let previous: Option<DefaultRecoverySystem> = t.get(PREVIOUS_DEFAULT_KEY)?;
            match previous {
                Some(previous) => st.set(keys::DEFAULT_RECOVERY_SYSTEM, &previous)?,
                None => st.remove(keys::DEFAULT_RECOVERY_SYSTEM),
            }
        }
        let mut seeded: Vec<SeededSystem> = st.get(keys::SEEDED_SYSTEMS)?.unwrap_or_default();
        let before = seeded.len();
        seeded.retain(|s| s.system != label);
        if seeded.len() != before {
            st.set(keys::SEEDED_SYSTEMS, &seeded)?;
        }
        st.task_mut(task)?
            .logf(format!("Recovery system {label:?} no longer promoted"));
        Ok(())
    }

    pub(super) async fn do_remove_recovery_system(
        &self,
        task: &TaskId,
    ) -> Result<TaskOutcome, TaskError> {
        let (label, planned): (String, Option<Vec<PathBuf>>) = {
            let st = self.state.lock().await;
            (
                task_data(&st, task, "recovery-system-label")?,
                st.task(task)?.get("snaps-to-remove")?,
            )
        };

        let to_remove = match planned {
            Some(paths) => paths,
            None => {
                let paths = self.snaps_unique_to(&label).await?;
                {
                    let mut st = self.state.lock().await;
                    st.task_mut(task)?.set("snaps-to-remove", &paths)?;
                }
                // the set must survive a crash halfway through the deletion
                self.state.checkpoint().await?;
                paths
            }
        };

        let writer = &self.deps.seed_writer;
        for path in &to_remove {
            writer
                .remove_file(path)
                .await
                .map_err(|e| TaskError::failed(format!("cannot remove snap {}: {e}", path.display())))?;
        }
        writer
            .remove_dir_all(&writer.system_dir(&label))
            .await
            .map_err(|e| TaskError::failed(format!("cannot remove recovery system {label:?}: {e}")))?;
        self.deps
            .boot
            .drop_recovery_system(&label)
            .await
            .map_err(|e| TaskError::failed(format!("cannot remove recovery system {label:?} from boot: {e}")))?;

        let mut st = self.state.lock().await;
        let mut seeded: Vec<SeededSystem> = st.get(keys::SEEDED_SYSTEMS)?.unwrap_or_default();
        seeded.retain(|s| s.system != label);
        st.set(keys::SEEDED_SYSTEMS, &seeded)?;
        remove_tried(&mut st, &label)?;
        st.task_mut(task)?.logf(format!(
            "Removed recovery system {label:?} and {} snap file(s)",
            to_remove.len()
        ));
        Ok(TaskOutcome::Done)
    }

    /// Snap files referenced by `label` and by no other seed system.
    async fn snaps_unique_to(&self, label: &str) -> Result<Vec<PathBuf>, TaskError> {
        let target = match self.deps.seed.load_system(Some(label)).await {
            Ok(system) => system,
            Err(SeedError::NotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(TaskError::failed(err)),
        };
        let mut shared = BTreeSet::new();
        for other in self.deps.seed.list_systems().await.map_err(TaskError::failed)? {
            if other == label {
                continue;
            }
            let system = self
                .deps
                .seed
                .load_system(Some(&other))
                .await
                .map_err(|e| TaskError::failed(format!("cannot load recovery system {other:?}: {e}")))?;
            shared.extend(system.snaps.into_iter().map(|s| s.path));
        }
        Ok(target
            .snaps
            .into_iter()
            .map(|s| s.path)
            .filter(|p| !shared.contains(p))
            .collect())
    }
}
