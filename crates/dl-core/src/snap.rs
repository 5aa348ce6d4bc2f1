use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::seed::{SeedSnap, SnapKind};

/// Data of a task that downloads or installs a snap, under `snap-setup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapSetup {
    pub name: String,
    pub revision: String,
    pub path: PathBuf,
    #[serde(default)]
    pub kind: SnapKind,
    #[serde(default)]
    pub required: bool,
}

impl From<&SeedSnap> for SnapSetup {
    fn from(snap: &SeedSnap) -> Self {
        Self {
            name: snap.name.clone(),
            revision: snap.revision.clone(),
            path: snap.path.clone(),
            kind: snap.kind,
            required: snap.essential,
        }
    }
}

/// An entry of the `snaps` registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledSnap {
    pub name: String,
    pub revision: String,
    pub path: PathBuf,
    #[serde(default)]
    pub kind: SnapKind,
    /// Set while the device model requires the snap.
    #[serde(default)]
    pub required: bool,
}

impl From<&SnapSetup> for InstalledSnap {
    fn from(setup: &SnapSetup) -> Self {
        Self {
            name: setup.name.clone(),
            revision: setup.revision.clone(),
            path: setup.path.clone(),
            kind: setup.kind,
            required: setup.required,
        }
    }
}

pub type SnapRegistry = BTreeMap<String, InstalledSnap>;
