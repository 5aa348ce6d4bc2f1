//! Domain layer of the device lifecycle orchestrator.
//!
//! Holds the persisted data model, the pure decisions (encryption backend,
//! remodel classification) and the ports through which the app layer
//! reaches external collaborators. Nothing here performs I/O.

pub mod config;
pub mod device;
pub mod encryption;
pub mod mode;
pub mod model;
pub mod ports;
pub mod recovery;
pub mod seed;
pub mod snap;
pub mod state;

pub use device::{DeviceState, SerialAssertion, SerialSetup};
pub use mode::{SystemMode, SystemModeInfo};
pub use model::{Grade, ModelAssertion, RemodelKind, StorageSafety};
pub use state::{Change, ChangeId, State, StateError, Status, Task, TaskId, TaskSet};
