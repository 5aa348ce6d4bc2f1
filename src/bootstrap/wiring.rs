//! Assembly of the concrete adapters behind the device manager ports.
//!
//! The only place that depends on dl-infra and dl-app at once. No decisions
//! are taken here, only construction.

use std::sync::Arc;
use std::time::Duration;

use dl_app::DeviceManagerDeps;
use dl_core::config::DaemonConfig;
use dl_core::ports::StateStorePort;
use dl_infra::install::InstallerPaths;
use dl_infra::{
    CommandInstaller, CommandRestart, DirRemodelPlanner, FileStateRepository, FsAssertionDb,
    FsBoot, FsCloudInit, FsKeyPairStore, FsSeed, HttpDeviceService, ProcessHookRunner,
    SystemClock, TpmProbe,
};

const DEVICE_SERVICE_TIMEOUT: Duration = Duration::from_secs(60);

pub type WiringResult<T> = Result<T, WiringError>;

#[derive(Debug, thiserror::Error)]
pub enum WiringError {
    #[error("Device service client initialization failed: {0}")]
    DeviceService(String),
}

/// Everything the daemon needs besides the state itself.
pub struct DaemonDeps {
    pub manager: DeviceManagerDeps,
    pub state_store: Arc<dyn StateStorePort>,
}

pub fn wire_dependencies(config: &DaemonConfig) -> WiringResult<DaemonDeps> {
    let device_service = HttpDeviceService::new(&config.device_service_url, DEVICE_SERVICE_TIMEOUT)
        .map_err(|e| WiringError::DeviceService(e.to_string()))?;

    let seed = Arc::new(FsSeed::new(config.seed_dir.clone()));
    let installer = CommandInstaller::new(
        config.installer_command.clone(),
        InstallerPaths {
            seed_dir: config.seed_dir.clone(),
            save_dir: config.save_dir.clone(),
            target_dir: config.target_dir.clone(),
            keys_dir: config.keys_dir.clone(),
        },
    );

    let manager = DeviceManagerDeps {
        boot: Arc::new(FsBoot::new(config.boot_dir.clone())),
        install: Arc::new(installer),
        secboot: Arc::new(TpmProbe::new(config.tpm_device.clone())),
        seed: seed.clone(),
        seed_writer: seed,
        hooks: Arc::new(ProcessHookRunner::new(config.hooks_dir.clone())),
        assertions: Arc::new(FsAssertionDb::new(config.assertions_dir.clone())),
        device_service: Arc::new(device_service),
        keypair: Arc::new(FsKeyPairStore::new(config.keys_dir.clone())),
        restart: Arc::new(CommandRestart::new(config.reboot_command.clone())),
        clock: Arc::new(SystemClock),
        planner: Arc::new(DirRemodelPlanner::new(config.remodel_snaps_dir.clone())),
        cloud_init: Arc::new(FsCloudInit::new(config.cloud_init_dir.clone())),
    };

    Ok(DaemonDeps {
        manager,
        state_store: Arc::new(FileStateRepository::new(config.state_file.clone())),
    })
}
