//! Application layer: the task runner and the device manager that owns
//! every device lifecycle handler and the periodic `ensure` pass.

pub mod devicestate;
pub mod engine;
pub mod state;

pub use devicestate::{
    CreateRecoverySystemOptions, DeviceManager, DeviceManagerDeps, DeviceManagerError,
    DeviceManagerOptions, EnsureError, RemodelOptions, UnregisterOptions,
};
pub use engine::{PassSummary, TaskError, TaskHandler, TaskOutcome, TaskRunner};
pub use state::StateHandle;
