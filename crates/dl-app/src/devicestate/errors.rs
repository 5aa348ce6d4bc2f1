use thiserror::Error;

use dl_core::model::Grade;
use dl_core::ports::{
    AssertionError, BootError, CloudInitError, HookError, InstallError, KeyPairError, SeedError,
};
use dl_core::recovery::InvalidLabel;
use dl_core::StateError;

use crate::engine::TaskError;

/// Errors produced by the device manager API and its `ensure` steps.
#[derive(Debug, Error)]
pub enum DeviceManagerError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("cannot checkpoint state: {0}")]
    Checkpoint(#[source] anyhow::Error),

    #[error(transparent)]
    Boot(#[from] BootError),

    #[error(transparent)]
    Seed(#[from] SeedError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Assertion(#[from] AssertionError),

    #[error(transparent)]
    CloudInit(#[from] CloudInitError),

    #[error(transparent)]
    KeyPair(#[from] KeyPairError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    InvalidLabel(#[from] InvalidLabel),

    #[error("cannot {op} while {kind} is in progress")]
    Conflict { op: String, kind: String },

    #[error("recovery system {0:?} already exists")]
    RecoverySystemExists(String),

    #[error("recovery system {0:?} not found")]
    NoSuchRecoverySystem(String),

    #[error("cannot remove current recovery system")]
    RemoveCurrent,

    #[error("cannot remove default recovery system")]
    RemoveDefault,

    #[error("cannot remodel from grade {from} to grade {to}")]
    GradeChange { from: Grade, to: Grade },

    #[error("{0}")]
    NotAvailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DeviceManagerError> for TaskError {
    fn from(err: DeviceManagerError) -> Self {
        match err {
            DeviceManagerError::State(err) => TaskError::State(err),
            DeviceManagerError::Internal(msg) => TaskError::Internal(msg),
            other => TaskError::Failed(anyhow::Error::new(other)),
        }
    }
}

/// Every failure of one `ensure` pass. Steps run to completion even when
/// earlier ones fail.
#[derive(Debug, Error)]
#[error("{}", join_errors(.0))]
pub struct EnsureError(pub Vec<DeviceManagerError>);

fn join_errors(errors: &[DeviceManagerError]) -> String {
    match errors {
        [single] => single.to_string(),
        many => {
            let lines: Vec<String> = many.iter().map(|e| format!("- {e}")).collect();
            format!("multiple errors:\n{}", lines.join("\n"))
        }
    }
}
