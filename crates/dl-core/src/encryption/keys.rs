use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::encryption::EncryptionBackend;

/// Role of a storage structure declared by the gadget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageRole {
    SystemSeed,
    SystemBoot,
    SystemData,
    SystemSave,
}

impl StorageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageRole::SystemSeed => "system-seed",
            StorageRole::SystemBoot => "system-boot",
            StorageRole::SystemData => "system-data",
            StorageRole::SystemSave => "system-save",
        }
    }
}

impl fmt::Display for StorageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key material for one encrypted structure. Wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(Vec<u8>);

impl EncryptionKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey(<{} bytes>)", self.0.len())
    }
}

/// Keys returned by the installer, per storage role.
pub type KeysForRoles = BTreeMap<StorageRole, EncryptionKey>;

/// Checks that both the data and save roles carry non-empty keys.
pub fn has_required_keys(keys: Option<&KeysForRoles>) -> bool {
    let Some(keys) = keys else {
        return false;
    };
    [StorageRole::SystemData, StorageRole::SystemSave]
        .iter()
        .all(|role| keys.get(role).map(|k| !k.is_empty()).unwrap_or(false))
}

/// Result of the "setup storage encryption" install step, kept in memory
/// only until the "finish install" step consumes it.
#[derive(Debug, Clone)]
pub struct EncryptionSetupData {
    pub label: String,
    pub backend: EncryptionBackend,
    pub keys: KeysForRoles,
    /// Device node of each encrypted structure, by role.
    pub devices: BTreeMap<StorageRole, String>,
}
