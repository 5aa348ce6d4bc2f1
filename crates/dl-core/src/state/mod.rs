//! Persisted daemon state: a key/value document plus the task graph.

mod graph;
mod task;

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use graph::{Change, TaskGraph, TaskSet};
pub use task::{ChangeId, Status, Task, TaskId};

/// Well-known state keys owned by the device lifecycle.
pub mod keys {
    pub const SEEDED: &str = "seeded";
    pub const SEED_TIME: &str = "seed-time";
    pub const START_OF_OPERATION_TIME: &str = "start-of-operation-time";
    pub const DEVICE: &str = "device";
    pub const TRIED_SYSTEMS: &str = "tried-systems";
    pub const DEFAULT_RECOVERY_SYSTEM: &str = "default-recovery-system";
    pub const SEEDED_SYSTEMS: &str = "seeded-systems";
    pub const SNAPS: &str = "snaps";
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot decode state entry {key:?}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot encode state entry {key:?}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("internal error: cannot find task {0}")]
    UnknownTask(TaskId),
    #[error("internal error: cannot find change {0}")]
    UnknownChange(ChangeId),
    #[error("internal error: task {0} is not part of a change")]
    Detached(TaskId),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    data: BTreeMap<String, Value>,
    #[serde(default)]
    graph: TaskGraph,
    #[serde(skip)]
    modified: bool,
}

impl State {
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        task::get_entry(&self.data, key)
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        self.modified = true;
        task::set_entry(&mut self.data, key, value)
    }

    pub fn remove(&mut self, key: &str) {
        if self.data.remove(key).is_some() {
            self.modified = true;
        }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut TaskGraph {
        self.modified = true;
        &mut self.graph
    }

    pub fn task(&self, id: &TaskId) -> Result<&Task, StateError> {
        self.graph.get_task(id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task, StateError> {
        self.modified = true;
        self.graph.task_mut(id)
    }

    /// The change the task belongs to.
    pub fn task_change(&self, id: &TaskId) -> Result<&Change, StateError> {
        let change = self
            .task(id)?
            .change
            .clone()
            .ok_or_else(|| StateError::Detached(id.clone()))?;
        self.graph
            .change(&change)
            .ok_or(StateError::UnknownChange(change))
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn mark_clean(&mut self) {
        self.modified = false;
    }

    pub fn mark_modified(&mut self) {
        self.modified = true;
    }
}
