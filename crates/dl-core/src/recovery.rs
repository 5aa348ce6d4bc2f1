//! Recovery system records.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ModelAssertion;
use crate::state::TaskId;

/// Name of the log of files written while creating a recovery system. It
/// lives inside the system directory.
pub const NEW_FILE_LOG: &str = "snapd-new-file-log";

/// A snap file supplied explicitly for a new recovery system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSnap {
    pub name: String,
    #[serde(default)]
    pub revision: String,
    pub path: PathBuf,
}

/// Persisted setup of a recovery system being created.
///
/// Only the creating task owns this record; tasks depending on it store
/// the owner id under `recovery-system-setup-task`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySystemSetup {
    pub label: String,
    pub directory: PathBuf,
    #[serde(default, rename = "local-snaps", skip_serializing_if = "Vec::is_empty")]
    pub local_snaps: Vec<LocalSnap>,
    #[serde(default, rename = "snap-setup-tasks", skip_serializing_if = "Vec::is_empty")]
    pub snap_setup_tasks: Vec<TaskId>,
    #[serde(default, rename = "test-system")]
    pub test_system: bool,
    #[serde(default, rename = "mark-default")]
    pub mark_default: bool,
    #[serde(default, rename = "new-files", skip_serializing_if = "Vec::is_empty")]
    pub new_files: Vec<PathBuf>,
}

impl RecoverySystemSetup {
    pub fn new_file_log(&self) -> PathBuf {
        self.directory.join(NEW_FILE_LOG)
    }
}

/// The system the device falls back to by default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultRecoverySystem {
    pub system: String,
    pub model: String,
    #[serde(rename = "brand-id")]
    pub brand_id: String,
    pub revision: u32,
    pub timestamp: DateTime<Utc>,
    /// When the system became the default.
    pub time: DateTime<Utc>,
}

impl DefaultRecoverySystem {
    pub fn new(label: &str, model: &ModelAssertion, time: DateTime<Utc>) -> Self {
        Self {
            system: label.to_string(),
            model: model.model.clone(),
            brand_id: model.brand_id.clone(),
            revision: model.revision,
            timestamp: model.timestamp,
            time,
        }
    }
}

/// A system the device was seeded from, most recent first in state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeededSystem {
    pub system: String,
    pub model: String,
    #[serde(rename = "brand-id")]
    pub brand_id: String,
    pub revision: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "seed-time")]
    pub seed_time: DateTime<Utc>,
}

impl SeededSystem {
    pub fn new(label: &str, model: &ModelAssertion, seed_time: DateTime<Utc>) -> Self {
        Self {
            system: label.to_string(),
            model: model.model.clone(),
            brand_id: model.brand_id.clone(),
            revision: model.revision,
            timestamp: model.timestamp,
            seed_time,
        }
    }

    /// Same system and model identity, ignoring the seed time.
    pub fn same_as(&self, other: &SeededSystem) -> bool {
        self.system == other.system
            && self.model == other.model
            && self.brand_id == other.brand_id
            && self.revision == other.revision
            && self.timestamp == other.timestamp
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid recovery system label {0:?}")]
pub struct InvalidLabel(pub String);

/// Labels are ASCII alphanumerics separated by single dashes, at least two
/// characters long, starting and ending with an alphanumeric.
pub fn validate_label(label: &str) -> Result<(), InvalidLabel> {
    let bytes = label.as_bytes();
    let valid = bytes.len() >= 2
        && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
        && !label.contains("--");
    if valid {
        Ok(())
    } else {
        Err(InvalidLabel(label.to_string()))
    }
}

/// One line of the new-file log.
pub fn new_file_log_entry(path: &Path) -> String {
    format!("{}\n", path.display())
}

/// Paths recorded in a new-file log, in write order. Blank lines from a
/// torn final write are skipped.
pub fn parse_new_file_log(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_validated() {
        for ok in ["20240101", "1234-1", "my-system-2"] {
            assert!(validate_label(ok).is_ok(), "{ok}");
        }
        for bad in ["", "a", "-abc", "abc-", "a--b", "a/b", "a b"] {
            assert_eq!(validate_label(bad), Err(InvalidLabel(bad.to_string())));
        }
    }

    #[test]
    fn new_file_log_parses_written_entries() {
        let mut log = String::new();
        log.push_str(&new_file_log_entry(Path::new("/seed/snaps/pc_1.snap")));
        log.push_str(&new_file_log_entry(Path::new("/seed/snaps/core24_5.snap")));
        log.push('\n');
        assert_eq!(
            parse_new_file_log(&log),
            vec![
                PathBuf::from("/seed/snaps/pc_1.snap"),
                PathBuf::from("/seed/snaps/core24_5.snap")
            ]
        );
    }

    #[test]
    fn setup_serializes_with_persisted_key_names() {
        let setup = RecoverySystemSetup {
            label: "1234".into(),
            directory: PathBuf::from("/seed/systems/1234"),
            snap_setup_tasks: vec![TaskId::from("5")],
            test_system: true,
            ..Default::default()
        };
        let json = serde_json::to_value(&setup).unwrap();
        assert_eq!(json["snap-setup-tasks"], serde_json::json!(["5"]));
        assert_eq!(json["test-system"], serde_json::json!(true));
        assert!(json.get("local-snaps").is_none());
        assert_eq!(setup.new_file_log(), PathBuf::from("/seed/systems/1234/snapd-new-file-log"));
    }
}
