//! Adapters for the device lifecycle ports: files under the configured
//! directories, child processes for hooks and the installer, HTTP for the
//! device service.

pub mod boot;
pub mod cloud_init;
pub mod config;
pub mod device;
pub mod hooks;
pub mod install;
pub mod remodel;
pub mod restart;
pub mod security;
pub mod seed;
pub mod state;
pub mod time;

pub use boot::FsBoot;
pub use cloud_init::FsCloudInit;
pub use config::load_config;
pub use device::{FsAssertionDb, FsKeyPairStore, HttpDeviceService};
pub use hooks::ProcessHookRunner;
pub use install::CommandInstaller;
pub use remodel::DirRemodelPlanner;
pub use restart::CommandRestart;
pub use security::TpmProbe;
pub use seed::FsSeed;
pub use state::FileStateRepository;
pub use time::SystemClock;
