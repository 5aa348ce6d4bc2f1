//! Port interfaces towards the collaborators of the device lifecycle.
//!
//! Everything slow or external (boot loader, installer, TPM, hooks,
//! network, disk) is reached through these traits so that handlers can
//! release the state lock around the call.

mod assertions;
mod boot;
mod clock;
mod cloud_init;
mod device_service;
mod hooks;
mod install;
mod keypair;
mod remodel;
mod restart;
mod secboot;
mod seed;
mod state_store;

pub use assertions::{AssertionDbPort, AssertionError};
pub use boot::{BootError, BootPort, MakeRunnableRequest, TryRecoveryOutcome};
pub use clock::ClockPort;
pub use cloud_init::{CloudInitError, CloudInitPort, CloudInitRestriction};
pub use device_service::{DeviceServiceError, DeviceServicePort, SerialResponse};
pub use hooks::{HookError, HookOutput, HookRequest, HookRunnerPort};
pub use install::{
    InstallError, InstallKind, InstallOptions, InstallPort, InstalledSystem, SaveContents,
    TargetConfig,
};
pub use keypair::{KeyPairError, KeyPairPort};
pub use remodel::{PlannerError, RemodelContext, RemodelPlannerPort};
pub use restart::{RestartError, RestartKind, RestartPort};
pub use secboot::{SecbootError, SecbootPort};
pub use seed::{SeedError, SeedPort, SeedWriterPort};
pub use state_store::StateStorePort;
