//! Model assertion domain types.
//!
//! The model assertion is signed elsewhere and read-only here; this module
//! only carries the fields the lifecycle decisions depend on.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Security tier of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Grade {
    /// Classic or pre-UC20 models carry no grade.
    #[default]
    Unset,
    Dangerous,
    Signed,
    Secured,
}

impl Grade {
    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::Unset => "unset",
            Grade::Dangerous => "dangerous",
            Grade::Signed => "signed",
            Grade::Secured => "secured",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Grade {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "unset" => Ok(Grade::Unset),
            "dangerous" => Ok(Grade::Dangerous),
            "signed" => Ok(Grade::Signed),
            "secured" => Ok(Grade::Secured),
            other => Err(format!("unknown model grade {other:?}")),
        }
    }
}

/// Storage-safety option of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageSafety {
    PreferUnencrypted,
    PreferEncrypted,
    Encrypted,
}

impl StorageSafety {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageSafety::PreferUnencrypted => "prefer-unencrypted",
            StorageSafety::PreferEncrypted => "prefer-encrypted",
            StorageSafety::Encrypted => "encrypted",
        }
    }
}

impl fmt::Display for StorageSafety {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validation set pinned by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSetPin {
    pub account_id: String,
    pub name: String,
    pub sequence: Option<u32>,
}

/// The subset of a model assertion used by the device lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelAssertion {
    pub brand_id: String,
    pub model: String,
    #[serde(default)]
    pub revision: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub grade: Grade,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_safety: Option<StorageSafety>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gadget: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
    #[serde(default)]
    pub required_snaps: Vec<String>,
    #[serde(default)]
    pub validation_sets: Vec<ValidationSetPin>,
    #[serde(default)]
    pub classic: bool,
}

impl ModelAssertion {
    /// Storage safety in effect, applying the grade dependent default.
    pub fn storage_safety(&self) -> StorageSafety {
        match self.storage_safety {
            Some(safety) => safety,
            None if self.grade == Grade::Secured => StorageSafety::Encrypted,
            None => StorageSafety::PreferEncrypted,
        }
    }

    /// Models with a grade are seeded from labelled recovery systems.
    pub fn has_recovery_systems(&self) -> bool {
        self.grade != Grade::Unset
    }

    /// Essential snaps followed by the model's required snaps, without duplicates.
    pub fn all_required_snaps(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let essentials = [&self.base, &self.kernel, &self.gadget];
        for name in essentials.into_iter().flatten() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        for name in &self.required_snaps {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// `brand/model` display form used in logs and errors.
    pub fn identity(&self) -> String {
        format!("{}/{}", self.brand_id, self.model)
    }
}

/// Kind of transition between two models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemodelKind {
    /// Same brand/model, same store.
    Update,
    /// Same brand/model, different store.
    StoreSwitch,
    /// Different brand or model.
    Reregistration,
}

impl fmt::Display for RemodelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RemodelKind::Update => "revision update remodel",
            RemodelKind::StoreSwitch => "store switch remodel",
            RemodelKind::Reregistration => "re-registration remodel",
        })
    }
}

pub fn classify_remodel(old: &ModelAssertion, new: &ModelAssertion) -> RemodelKind {
    if old.brand_id != new.brand_id || old.model != new.model {
        return RemodelKind::Reregistration;
    }
    if old.store != new.store {
        return RemodelKind::StoreSwitch;
    }
    RemodelKind::Update
}
