use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StateError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(pub String);

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task status. Retrying is not a status: a retried task stays in `Do`
/// with an `at_time` in the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Do,
    Doing,
    Done,
    Undo,
    Undoing,
    Undone,
    Hold,
    Error,
}

impl Status {
    /// Terminal statuses; a change is ready once all its tasks are.
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            Status::Done | Status::Undone | Status::Hold | Status::Error
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Do => "Do",
            Status::Doing => "Doing",
            Status::Done => "Done",
            Status::Undo => "Undo",
            Status::Undoing => "Undoing",
            Status::Undone => "Undone",
            Status::Hold => "Hold",
            Status::Error => "Error",
        };
        f.write_str(s)
    }
}

pub(crate) fn get_entry<T: DeserializeOwned>(
    data: &BTreeMap<String, Value>,
    key: &str,
) -> Result<Option<T>, StateError> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|source| StateError::Decode {
                key: key.to_string(),
                source,
            }),
    }
}

pub(crate) fn set_entry<T: Serialize + ?Sized>(
    data: &mut BTreeMap<String, Value>,
    key: &str,
    value: &T,
) -> Result<(), StateError> {
    let value = serde_json::to_value(value).map_err(|source| StateError::Encode {
        key: key.to_string(),
        source,
    })?;
    data.insert(key.to_string(), value);
    Ok(())
}

/// A unit of work in a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: String,
    pub summary: String,
    pub status: Status,
    #[serde(default)]
    pub change: Option<ChangeId>,
    #[serde(default)]
    pub wait_for: Vec<TaskId>,
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
    #[serde(default)]
    pub log: Vec<String>,
    /// Earliest time (unix ms) the task may run again after a retry.
    #[serde(default)]
    pub at_time_ms: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    /// Set once the cleanup handler ran.
    #[serde(default)]
    pub clean: bool,
}

impl Task {
    pub(crate) fn new(id: TaskId, kind: &str, summary: &str) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            status: Status::Do,
            change: None,
            wait_for: Vec::new(),
            data: BTreeMap::new(),
            log: Vec::new(),
            at_time_ms: None,
            error: None,
            clean: false,
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        get_entry(&self.data, key)
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        set_entry(&mut self.data, key, value)
    }

    pub fn has(&self, key: &str) -> bool {
        matches!(self.data.get(key), Some(v) if !v.is_null())
    }

    pub fn remove(&mut self, key: &str) {
        self.data.remove(key);
    }

    pub fn logf(&mut self, msg: impl Into<String>) {
        self.push_log("INFO", msg.into());
    }

    pub fn errorf(&mut self, msg: impl Into<String>) {
        self.push_log("ERROR", msg.into());
    }

    fn push_log(&mut self, level: &str, msg: String) {
        let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        self.log.push(format!("{ts} {level} {msg}"));
    }
}
