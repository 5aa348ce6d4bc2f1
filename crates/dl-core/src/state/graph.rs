//! Persisted graph of changes and tasks.
//!
//! This is the storage half of the task engine: it records tasks, their
//! statuses and WaitFor edges. Scheduling lives in the app layer.

use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::task::{get_entry, set_entry, ChangeId, Status, Task, TaskId};
use super::StateError;

/// A persisted unit of work composed of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub kind: String,
    pub summary: String,
    #[serde(default)]
    pub task_ids: Vec<TaskId>,
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
}

impl Change {
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        get_entry(&self.data, key)
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        set_entry(&mut self.data, key, value)
    }
}

/// An ordered group of tasks handled together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSet {
    tasks: Vec<TaskId>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tasks(tasks: Vec<TaskId>) -> Self {
        Self { tasks }
    }

    pub fn add(&mut self, id: TaskId) {
        if !self.tasks.contains(&id) {
            self.tasks.push(id);
        }
    }

    pub fn add_all(&mut self, other: &TaskSet) {
        for id in &other.tasks {
            self.add(id.clone());
        }
    }

    pub fn tasks(&self) -> &[TaskId] {
        &self.tasks
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskGraph {
    #[serde(default)]
    last_id: u64,
    #[serde(default)]
    changes: BTreeMap<ChangeId, Change>,
    #[serde(default)]
    tasks: BTreeMap<TaskId, Task>,
}

impl TaskGraph {
    fn next_id(&mut self) -> String {
        self.last_id += 1;
        self.last_id.to_string()
    }

    pub fn new_change(&mut self, kind: &str, summary: &str) -> ChangeId {
        let id = ChangeId(self.next_id());
        self.changes.insert(
            id.clone(),
            Change {
                id: id.clone(),
                kind: kind.to_string(),
                summary: summary.to_string(),
                task_ids: Vec::new(),
                data: BTreeMap::new(),
            },
        );
        id
    }

    /// Creates a task not yet attached to any change.
    pub fn new_task(&mut self, kind: &str, summary: &str) -> TaskId {
        let id = TaskId(self.next_id());
        self.tasks.insert(id.clone(), Task::new(id.clone(), kind, summary));
        id
    }

    pub fn add_task(&mut self, change: &ChangeId, task: &TaskId) -> Result<(), StateError> {
        let t = self
            .tasks
            .get_mut(task)
            .ok_or_else(|| StateError::UnknownTask(task.clone()))?;
        t.change = Some(change.clone());
        let chg = self
            .changes
            .get_mut(change)
            .ok_or_else(|| StateError::UnknownChange(change.clone()))?;
        if !chg.task_ids.contains(task) {
            chg.task_ids.push(task.clone());
        }
        Ok(())
    }

    pub fn add_all(&mut self, change: &ChangeId, ts: &TaskSet) -> Result<(), StateError> {
        for id in ts.tasks() {
            self.add_task(change, id)?;
        }
        Ok(())
    }

    /// Records that `task` must wait for `dep` to be done.
    pub fn wait_for(&mut self, task: &TaskId, dep: &TaskId) -> Result<(), StateError> {
        if !self.tasks.contains_key(dep) {
            return Err(StateError::UnknownTask(dep.clone()));
        }
        let t = self
            .tasks
            .get_mut(task)
            .ok_or_else(|| StateError::UnknownTask(task.clone()))?;
        if !t.wait_for.contains(dep) {
            t.wait_for.push(dep.clone());
        }
        Ok(())
    }

    /// Makes each task in `ids` wait for the one before it.
    pub fn chain(&mut self, ids: &[TaskId]) -> Result<(), StateError> {
        for pair in ids.windows(2) {
            self.wait_for(&pair[1], &pair[0])?;
        }
        Ok(())
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task, StateError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| StateError::UnknownTask(id.clone()))
    }

    pub fn get_task(&self, id: &TaskId) -> Result<&Task, StateError> {
        self.tasks
            .get(id)
            .ok_or_else(|| StateError::UnknownTask(id.clone()))
    }

    pub fn change(&self, id: &ChangeId) -> Option<&Change> {
        self.changes.get(id)
    }

    pub fn change_mut(&mut self, id: &ChangeId) -> Result<&mut Change, StateError> {
        self.changes
            .get_mut(id)
            .ok_or_else(|| StateError::UnknownChange(id.clone()))
    }

    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.changes.values()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn change_tasks(&self, id: &ChangeId) -> Vec<&Task> {
        self.changes
            .get(id)
            .map(|chg| {
                chg.task_ids
                    .iter()
                    .filter_map(|tid| self.tasks.get(tid))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Puts tasks caught mid-handler by a process exit back into `Do` or
    /// `Undo`, so their handlers run again. Returns the requeued tasks.
    pub fn requeue_interrupted(&mut self) -> Vec<TaskId> {
        let mut requeued = Vec::new();
        for task in self.tasks.values_mut() {
            let next = match task.status {
                Status::Doing => Status::Do,
                Status::Undoing => Status::Undo,
                _ => continue,
            };
            let verb = if next == Status::Do { "run" } else { "undo" };
            task.status = next;
            task.logf(format!("Interrupted, will {verb} again"));
            requeued.push(task.id.clone());
        }
        requeued
    }

    /// Tasks of the change that wait for `id`.
    pub fn halt_tasks(&self, id: &TaskId) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.wait_for.contains(id))
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn change_is_ready(&self, id: &ChangeId) -> bool {
        self.change_tasks(id).iter().all(|t| t.status.is_ready())
    }

    /// The live (not ready) change of the given kind, if any.
    pub fn live_change_of_kind(&self, kind: &str) -> Option<&Change> {
        self.changes
            .values()
            .find(|chg| chg.kind == kind && !self.change_is_ready(&chg.id))
    }

    pub fn changes_of_kind(&self, kind: &str) -> Vec<&Change> {
        self.changes.values().filter(|c| c.kind == kind).collect()
    }

    /// Aggregated failure message of a change, if any task errored.
    pub fn change_err(&self, id: &ChangeId) -> Option<String> {
        let failed: Vec<String> = self
            .change_tasks(id)
            .iter()
            .filter(|t| t.status == Status::Error)
            .map(|t| {
                format!(
                    "- {} ({})",
                    t.summary,
                    t.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();
        if failed.is_empty() {
            return None;
        }
        Some(format!(
            "cannot perform the following tasks:\n{}",
            failed.join("\n")
        ))
    }

    /// Appends `ts` to the change of the running task `after`.
    ///
    /// Injected tasks without a predecessor inside the set wait for `after`,
    /// and every task that waited for `after` now also waits for the
    /// injected tasks.
    pub fn inject(&mut self, after: &TaskId, ts: &TaskSet) -> Result<(), StateError> {
        let change = self
            .get_task(after)?
            .change
            .clone()
            .ok_or_else(|| StateError::Detached(after.clone()))?;
        let halted = self.halt_tasks(after);
        let injected: BTreeSet<&TaskId> = ts.tasks().iter().collect();

        for id in ts.tasks() {
            self.add_task(&change, id)?;
            let has_inner_dep = self
                .get_task(id)?
                .wait_for
                .iter()
                .any(|dep| injected.contains(dep));
            if !has_inner_dep {
                self.wait_for(id, after)?;
            }
        }
        for halt in &halted {
            if injected.contains(halt) {
                continue;
            }
            for id in ts.tasks() {
                self.wait_for(halt, id)?;
            }
        }
        Ok(())
    }
}
