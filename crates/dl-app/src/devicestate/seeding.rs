use std::time::Duration;

use tracing::info;

use dl_core::ports::AssertionError;
use dl_core::recovery::SeededSystem;
use dl_core::snap::{InstalledSnap, SnapRegistry, SnapSetup};
use dl_core::state::keys;
use dl_core::{ModelAssertion, SystemMode, TaskId};

use super::{device_state, is_seeded, task_data, DeviceManager, DeviceManagerError};
use crate::engine::{TaskError, TaskOutcome};

const PRESEED_RETRY: Duration = Duration::from_secs(60);

impl DeviceManager {
    /// Creates the `seed` change unless the system is seeded or seeding is
    /// already under way.
    pub(super) async fn ensure_seeded(&self) -> Result<(), DeviceManagerError> {
        {
            let st = self.state.lock().await;
            if is_seeded(&st)? || st.graph().live_change_of_kind("seed").is_some() {
                return Ok(());
            }
        }

        let label = self.mode.recovery_system.clone();
        let system = self.deps.seed.load_system(label.as_deref()).await?;
        let required = system.model.all_required_snaps();

        let mut st = self.state.lock().await;
        let g = st.graph_mut();
        let chg = g.new_change("seed", "Initialize system state");
        let mut ids = Vec::new();
        for snap in system.install_order() {
            let mut setup = SnapSetup::from(snap);
            setup.required = setup.required || required.contains(&snap.name);
            let id = g.new_task(
                "install-seed-snap",
                &format!("Install snap {:?} (rev {}) from seed", snap.name, snap.revision),
            );
            g.task_mut(&id)?.set("snap-setup", &setup)?;
            g.add_task(&chg, &id)?;
            ids.push(id);
        }
        let mark = g.new_task("mark-seeded", "Mark system seeded");
        {
            let task = g.task_mut(&mark)?;
            task.set("model", &system.model)?;
            if let Some(label) = &label {
                task.set("seed-system", label)?;
            }
        }
        g.add_task(&chg, &mark)?;
        ids.push(mark);
        g.chain(&ids)?;

        info!(
            change = %chg,
            system = label.as_deref().unwrap_or(""),
            snaps = ids.len() - 1,
            "created seed change"
        );
        Ok(())
    }

    pub(super) async fn do_install_seed_snap(&self, task: &TaskId) -> Result<TaskOutcome, TaskError> {
        let mut st = self.state.lock().await;
        let setup: SnapSetup = task_data(&st, task, "snap-setup")?;
        let mut registry: SnapRegistry = st.get(keys::SNAPS)?.unwrap_or_default();
        registry.insert(setup.name.clone(), InstalledSnap::from(&setup));
        st.set(keys::SNAPS, &registry)?;
        st.task_mut(task)?
            .logf(format!("Installed snap {:?} revision {}", setup.name, setup.revision));
        Ok(TaskOutcome::Done)
    }

    pub(super) async fn do_mark_seeded(&self, task: &TaskId) -> Result<TaskOutcome, TaskError> {
        let (model, label): (ModelAssertion, Option<String>) = {
            let st = self.state.lock().await;
            (
                task_data(&st, task, "model")?,
                st.task(task)?.get("seed-system")?,
            )
        };

        match self.deps.assertions.add_model(&model).await {
            Ok(()) | Err(AssertionError::SameRevision(_)) => {}
            Err(err) => {
                return Err(TaskError::failed(format!(
                    "cannot add model assertion: {err}"
                )))
            }
        }

        if self.options.preseed {
            self.task_log(task, "System preseeded, seeding finishes on first boot")
                .await?;
            return Ok(TaskOutcome::Retry(PRESEED_RETRY));
        }

        let now = self.deps.clock.now();
        let mut st = self.state.lock().await;
        let mut device = device_state(&st)?;
        if device.brand.is_empty() {
            device.brand = model.brand_id.clone();
            device.model = model.model.clone();
            st.set(keys::DEVICE, &device)?;
        }
        if st.get::<serde_json::Value>(keys::START_OF_OPERATION_TIME)?.is_none() {
            st.set(keys::START_OF_OPERATION_TIME, &now)?;
        }
        st.set(keys::SEED_TIME, &now)?;
        st.set(keys::SEEDED, &true)?;

        if let (Some(label), SystemMode::Run, true) =
            (&label, self.mode.mode, model.has_recovery_systems())
        {
            let record = SeededSystem::new(label, &model, now);
            let mut systems: Vec<SeededSystem> =
                st.get(keys::SEEDED_SYSTEMS)?.unwrap_or_default();
            if !systems.iter().any(|s| s.same_as(&record)) {
                systems.insert(0, record);
                st.set(keys::SEEDED_SYSTEMS, &systems)?;
            }
        }

        st.task_mut(task)?.logf(format!("System seeded with model {}", model.identity()));
        info!(model = %model.identity(), "system seeded");
        Ok(TaskOutcome::Done)
    }
}
