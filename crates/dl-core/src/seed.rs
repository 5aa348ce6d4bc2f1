use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::encryption::StorageRole;
use crate::model::ModelAssertion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SnapKind {
    Snapd,
    Base,
    Kernel,
    Gadget,
    #[default]
    App,
}

/// A snap referenced by a seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedSnap {
    pub name: String,
    pub revision: String,
    pub path: PathBuf,
    #[serde(default)]
    pub kind: SnapKind,
    #[serde(default)]
    pub essential: bool,
}

/// The parts of the gadget the lifecycle cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GadgetInfo {
    #[serde(default)]
    pub roles: Vec<StorageRole>,
}

impl GadgetInfo {
    pub fn has_role(&self, role: StorageRole) -> bool {
        self.roles.contains(&role)
    }
}

/// A loaded seed system: its model, snaps and gadget layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedSystem {
    pub label: String,
    pub model: ModelAssertion,
    pub snaps: Vec<SeedSnap>,
    #[serde(default)]
    pub gadget: GadgetInfo,
}

impl SeedSystem {
    /// Essential snaps first, keeping seed order within each group.
    pub fn install_order(&self) -> Vec<&SeedSnap> {
        let (mut essential, rest): (Vec<&SeedSnap>, Vec<&SeedSnap>) =
            self.snaps.iter().partition(|s| s.essential);
        essential.extend(rest);
        essential
    }
}
