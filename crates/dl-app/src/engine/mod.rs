//! In-process task runner.
//!
//! Executes the persisted task graph: a task runs once every task it waits
//! for is done and its retry time has passed. A failing task puts the rest
//! of its change on hold and undoes, newest first, the done tasks that have
//! an undo handler. Cleanup handlers run once the change is ready.

mod runner;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use dl_core::ports::RestartKind;
use dl_core::{StateError, TaskId};

pub use runner::{EngineError, PassSummary, TaskRunner};

/// Result of a successful handler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    /// Run the task again after the delay.
    Retry(Duration),
    /// The task is done and the system must restart before the change can
    /// continue.
    DoneWithRestart(RestartKind),
}

#[derive(Debug, Error)]
pub enum TaskError {
    /// A policy or configuration conflict; reported verbatim.
    #[error("{0}")]
    Configuration(String),

    /// A collaborator broke its contract.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("{0}")]
    Failed(#[from] anyhow::Error),
}

impl TaskError {
    pub fn failed(msg: impl std::fmt::Display) -> Self {
        TaskError::Failed(anyhow::Error::msg(msg.to_string()))
    }
}

/// Handler for one task kind.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: &TaskId) -> Result<TaskOutcome, TaskError>;

    fn has_undo(&self) -> bool {
        false
    }

    async fn undo(&self, _task: &TaskId) -> Result<(), TaskError> {
        Ok(())
    }

    async fn cleanup(&self, _task: &TaskId) -> Result<(), TaskError> {
        Ok(())
    }
}
