pub mod config;
pub mod run;
pub mod tracing;
pub mod wiring;

pub use config::{config_path, load_config};
pub use run::Daemon;
pub use wiring::{wire_dependencies, DaemonDeps, WiringError};
