//! Device manager.
//!
//! Owns the device lifecycle: seeding, registration, installation and
//! factory reset, recovery systems and remodeling. `ensure` creates the
//! changes the current state calls for; the task handlers registered on
//! the [`TaskRunner`] carry them out.

mod encryption;
mod ensure;
mod errors;
mod factory_reset;
mod handlers;
mod hooks;
mod install_api;
mod install_mode;
mod lifecycle;
mod recovery_systems;
mod registration;
mod remodel;
mod seeding;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{info, warn};

use dl_core::encryption::EncryptionSetupData;
use dl_core::ports::{
    AssertionDbPort, BootError, BootPort, ClockPort, CloudInitPort, DeviceServicePort,
    HookRunnerPort, InstallPort, KeyPairPort, RemodelPlannerPort, RestartPort, SecbootPort,
    SeedPort, SeedWriterPort,
};
use dl_core::state::keys;
use dl_core::{DeviceState, ModelAssertion, State, StateError, SystemModeInfo, TaskId};

use crate::engine::{TaskError, TaskRunner};
use crate::state::StateHandle;

pub use errors::{DeviceManagerError, EnsureError};
pub use recovery_systems::CreateRecoverySystemOptions;
pub use registration::UnregisterOptions;
pub use remodel::RemodelOptions;

use handlers::{DeviceTaskHandler, Kind};
use lifecycle::EnsureLifecycle;

/// Collaborators of the device manager.
pub struct DeviceManagerDeps {
    pub boot: Arc<dyn BootPort>,
    pub install: Arc<dyn InstallPort>,
    pub secboot: Arc<dyn SecbootPort>,
    pub seed: Arc<dyn SeedPort>,
    pub seed_writer: Arc<dyn SeedWriterPort>,
    pub hooks: Arc<dyn HookRunnerPort>,
    pub assertions: Arc<dyn AssertionDbPort>,
    pub device_service: Arc<dyn DeviceServicePort>,
    pub keypair: Arc<dyn KeyPairPort>,
    pub restart: Arc<dyn RestartPort>,
    pub clock: Arc<dyn ClockPort>,
    pub planner: Arc<dyn RemodelPlannerPort>,
    pub cloud_init: Arc<dyn CloudInitPort>,
}

#[derive(Debug, Clone)]
pub struct DeviceManagerOptions {
    /// Image preseeding: seed, then stop before anything device specific.
    pub preseed: bool,
    pub hook_timeout: Duration,
}

impl Default for DeviceManagerOptions {
    fn default() -> Self {
        Self {
            preseed: false,
            hook_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Clone)]
pub struct DeviceManager {
    deps: Arc<DeviceManagerDeps>,
    state: StateHandle,
    mode: Arc<SystemModeInfo>,
    options: DeviceManagerOptions,
    lifecycle: Arc<Mutex<EnsureLifecycle>>,
    /// Storage encryption set up by the install API, until `install-finish`.
    encryption_cache: Arc<Mutex<HashMap<String, EncryptionSetupData>>>,
    ensure_lock: Arc<Mutex<()>>,
}

impl DeviceManager {
    /// Creates the manager. The boot mode is read once here and fixed for
    /// the lifetime of the process.
    pub async fn new(
        deps: DeviceManagerDeps,
        state: StateHandle,
        options: DeviceManagerOptions,
    ) -> Result<Self, DeviceManagerError> {
        let mode = match deps.boot.mode_info().await {
            Ok(mode) => mode,
            Err(BootError::Unavailable(reason)) => {
                warn!(reason = %reason, "no boot mode record, assuming classic run mode");
                SystemModeInfo::classic()
            }
            Err(err) => return Err(err.into()),
        };
        info!(
            mode = %mode.mode,
            recovery_system = mode.recovery_system.as_deref().unwrap_or(""),
            preseed = options.preseed,
            "device manager started"
        );
        Ok(Self::from_deps(deps, state, mode, options))
    }

    pub fn from_deps(
        deps: DeviceManagerDeps,
        state: StateHandle,
        mode: SystemModeInfo,
        options: DeviceManagerOptions,
    ) -> Self {
        Self {
            deps: Arc::new(deps),
            state,
            mode: Arc::new(mode),
            options,
            lifecycle: Arc::new(Mutex::new(EnsureLifecycle::default())),
            encryption_cache: Arc::new(Mutex::new(HashMap::new())),
            ensure_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Registers a handler for every task kind the manager owns.
    pub fn register_handlers(&self, runner: &mut TaskRunner) {
        for kind in Kind::ALL {
            runner.add_handler(
                kind.as_str(),
                Arc::new(DeviceTaskHandler::new(self.clone(), kind)),
            );
        }
    }

    pub fn mode(&self) -> &SystemModeInfo {
        &self.mode
    }

    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    /// The model the device currently runs, if it is known yet.
    pub async fn current_model(&self) -> Result<Option<ModelAssertion>, DeviceManagerError> {
        let device = {
            let st = self.state.lock().await;
            device_state(&st)?
        };
        if device.brand.is_empty() || device.model.is_empty() {
            return Ok(None);
        }
        Ok(self
            .deps
            .assertions
            .find_model(&device.brand, &device.model)
            .await?)
    }

    async fn require_model(&self) -> Result<ModelAssertion, DeviceManagerError> {
        self.current_model()
            .await?
            .ok_or_else(|| DeviceManagerError::Internal("cannot find device model".into()))
    }

    async fn checkpoint(&self) -> Result<(), DeviceManagerError> {
        self.state
            .checkpoint()
            .await
            .map_err(DeviceManagerError::Checkpoint)
    }

    /// Appends to the task log and mirrors the line as a tracing event.
    async fn task_log(&self, task: &TaskId, msg: impl Into<String>) -> Result<(), TaskError> {
        let msg = msg.into();
        let mut st = self.state.lock().await;
        st.task_mut(task)?.logf(msg.clone());
        info!(task = %task, "{msg}");
        Ok(())
    }
}

pub(crate) fn device_state(st: &State) -> Result<DeviceState, StateError> {
    Ok(st.get::<DeviceState>(keys::DEVICE)?.unwrap_or_default())
}

pub(crate) fn is_seeded(st: &State) -> Result<bool, StateError> {
    Ok(st.get::<bool>(keys::SEEDED)?.unwrap_or(false))
}

/// Reads a mandatory entry of the task's data.
pub(crate) fn task_data<T: DeserializeOwned>(
    st: &State,
    task: &TaskId,
    key: &str,
) -> Result<T, TaskError> {
    st.task(task)?
        .get::<T>(key)?
        .ok_or_else(|| TaskError::Internal(format!("task {task} has no {key:?}")))
}

/// Reads a mandatory entry of the data of the task's change.
pub(crate) fn change_data<T: DeserializeOwned>(
    st: &State,
    task: &TaskId,
    key: &str,
) -> Result<T, TaskError> {
    let change = st.task_change(task)?;
    change
        .get::<T>(key)?
        .ok_or_else(|| TaskError::Internal(format!("change {} has no {key:?}", change.id)))
}
