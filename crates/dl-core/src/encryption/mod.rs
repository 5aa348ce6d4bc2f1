//! Storage encryption domain: backend decision, hook reply parsing and key
//! material types.

pub mod decision;
pub mod fde_hook;
pub mod keys;

pub use decision::{
    decide_encryption, encryption_considered, BackendProbe, EncryptionBackend, EncryptionDecision,
    EncryptionDecisionError, EncryptionInputs, GADGET_MISSING_SAVE,
};
pub use fde_hook::{parse_features, FdeFeaturesError, DEVICE_SETUP_FEATURE};
pub use keys::{
    has_required_keys, EncryptionKey, EncryptionSetupData, KeysForRoles, StorageRole,
};
