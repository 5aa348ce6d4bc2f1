//! Encryption backend decision.
//!
//! Pure over the model policy and the probed backend availability. Probing
//! itself (running the hook, talking to the TPM) happens in the app layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::encryption::fde_hook::DEVICE_SETUP_FEATURE;
use crate::model::{Grade, StorageSafety};

/// Reason used when the gadget lacks a save structure.
pub const GADGET_MISSING_SAVE: &str =
    "gadget does not support encrypted data: required partition with system-save role is missing";

/// Backend used to set up encrypted storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionBackend {
    /// The kernel hook sets up the device and manages sealing itself.
    DeviceSetupHook,
    /// LUKS with key handling delegated to the kernel hook.
    LuksWithHook,
    /// LUKS with keys sealed to the TPM.
    LuksWithTpm,
}

/// What probing found out about the available backends.
///
/// When the kernel carries an `fde-setup` hook only the hook is asked; the
/// TPM is consulted only in its absence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendProbe {
    /// Outcome of the hook "features" query.
    Hook(Result<Vec<String>, String>),
    /// Outcome of the TPM sealing support check.
    Tpm(Result<(), String>),
}

impl BackendProbe {
    fn backend(&self) -> Result<EncryptionBackend, String> {
        match self {
            BackendProbe::Hook(Ok(features)) => {
                if features.iter().any(|f| f == DEVICE_SETUP_FEATURE) {
                    Ok(EncryptionBackend::DeviceSetupHook)
                } else {
                    Ok(EncryptionBackend::LuksWithHook)
                }
            }
            BackendProbe::Hook(Err(reason)) => Err(format!("cannot use hook: {reason}")),
            BackendProbe::Tpm(Ok(())) => Ok(EncryptionBackend::LuksWithTpm),
            BackendProbe::Tpm(Err(reason)) => Err(reason.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionInputs {
    pub grade: Grade,
    pub storage_safety: StorageSafety,
    pub gadget_has_save: bool,
    pub probe: BackendProbe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionDecision {
    pub backend: Option<EncryptionBackend>,
    /// Why encryption is not used although the model would have preferred it.
    pub unavailable_reason: Option<String>,
}

impl EncryptionDecision {
    pub fn unencrypted() -> Self {
        Self {
            backend: None,
            unavailable_reason: None,
        }
    }

    pub fn encrypted(&self) -> bool {
        self.backend.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncryptionDecisionError {
    #[error("cannot encrypt device storage as mandated by model grade secured: {0}")]
    MandatedByGrade(String),
    #[error("cannot encrypt device storage as mandated by encrypted storage-safety model option: {0}")]
    MandatedByStorageSafety(String),
}

/// Whether backends need probing at all. Models preferring unencrypted
/// storage are never encrypted unless their grade mandates it.
pub fn encryption_considered(grade: Grade, storage_safety: StorageSafety) -> bool {
    grade == Grade::Secured || storage_safety != StorageSafety::PreferUnencrypted
}

/// Chooses whether and how to encrypt.
pub fn decide_encryption(
    inputs: &EncryptionInputs,
) -> Result<EncryptionDecision, EncryptionDecisionError> {
    if !encryption_considered(inputs.grade, inputs.storage_safety) {
        return Ok(EncryptionDecision::unencrypted());
    }
    let mandated_by_grade = inputs.grade == Grade::Secured;

    let available = inputs.probe.backend().and_then(|backend| {
        if inputs.gadget_has_save {
            Ok(backend)
        } else {
            Err(GADGET_MISSING_SAVE.to_string())
        }
    });

    match available {
        Ok(backend) => Ok(EncryptionDecision {
            backend: Some(backend),
            unavailable_reason: None,
        }),
        Err(reason) if mandated_by_grade => Err(EncryptionDecisionError::MandatedByGrade(reason)),
        Err(reason) if inputs.storage_safety == StorageSafety::Encrypted => {
            Err(EncryptionDecisionError::MandatedByStorageSafety(reason))
        }
        Err(reason) => Ok(EncryptionDecision {
            backend: None,
            unavailable_reason: Some(reason),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(grade: Grade, safety: StorageSafety, probe: BackendProbe) -> EncryptionInputs {
        EncryptionInputs {
            grade,
            storage_safety: safety,
            gadget_has_save: true,
            probe,
        }
    }

    fn no_tpm() -> BackendProbe {
        BackendProbe::Tpm(Err("TPM not available".into()))
    }

    #[test]
    fn secured_without_tpm_or_hook_fails() {
        let err = decide_encryption(&inputs(Grade::Secured, StorageSafety::Encrypted, no_tpm()))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot encrypt device storage as mandated by model grade secured: TPM not available"
        );
    }

    #[test]
    fn secured_ignores_prefer_unencrypted() {
        let err = decide_encryption(&inputs(
            Grade::Secured,
            StorageSafety::PreferUnencrypted,
            no_tpm(),
        ))
        .unwrap_err();
        assert!(matches!(err, EncryptionDecisionError::MandatedByGrade(_)));
    }

    #[test]
    fn prefer_unencrypted_never_encrypts() {
        let decision = decide_encryption(&inputs(
            Grade::Dangerous,
            StorageSafety::PreferUnencrypted,
            BackendProbe::Tpm(Ok(())),
        ))
        .unwrap();
        assert_eq!(decision, EncryptionDecision::unencrypted());
    }

    #[test]
    fn encrypted_storage_safety_without_backend_fails() {
        let err = decide_encryption(&inputs(Grade::Dangerous, StorageSafety::Encrypted, no_tpm()))
            .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("cannot encrypt device storage as mandated by encrypted storage-safety model option: "));
    }

    #[test]
    fn prefer_encrypted_falls_back_with_reason() {
        let decision = decide_encryption(&inputs(
            Grade::Signed,
            StorageSafety::PreferEncrypted,
            no_tpm(),
        ))
        .unwrap();
        assert!(!decision.encrypted());
        assert_eq!(decision.unavailable_reason.as_deref(), Some("TPM not available"));
    }

    #[test]
    fn device_setup_feature_selects_hook_backend() {
        for grade in [Grade::Dangerous, Grade::Signed, Grade::Secured] {
            for safety in [StorageSafety::PreferEncrypted, StorageSafety::Encrypted] {
                let decision = decide_encryption(&inputs(
                    grade,
                    safety,
                    BackendProbe::Hook(Ok(vec!["device-setup".into()])),
                ))
                .unwrap();
                assert_eq!(decision.backend, Some(EncryptionBackend::DeviceSetupHook));
            }
        }
    }

    #[test]
    fn hook_without_device_setup_uses_luks() {
        let decision = decide_encryption(&inputs(
            Grade::Dangerous,
            StorageSafety::PreferEncrypted,
            BackendProbe::Hook(Ok(vec![])),
        ))
        .unwrap();
        assert_eq!(decision.backend, Some(EncryptionBackend::LuksWithHook));
    }

    #[test]
    fn tpm_selects_luks_with_tpm() {
        let decision = decide_encryption(&inputs(
            Grade::Secured,
            StorageSafety::Encrypted,
            BackendProbe::Tpm(Ok(())),
        ))
        .unwrap();
        assert_eq!(decision.backend, Some(EncryptionBackend::LuksWithTpm));
    }

    #[test]
    fn broken_hook_is_fatal_only_when_mandated() {
        let probe = BackendProbe::Hook(Err("fde-setup hook returned empty output".into()));
        let decision =
            decide_encryption(&inputs(Grade::Dangerous, StorageSafety::PreferEncrypted, probe.clone()))
                .unwrap();
        assert_eq!(
            decision.unavailable_reason.as_deref(),
            Some("cannot use hook: fde-setup hook returned empty output")
        );

        let err = decide_encryption(&inputs(Grade::Secured, StorageSafety::Encrypted, probe))
            .unwrap_err();
        assert!(err.to_string().ends_with("cannot use hook: fde-setup hook returned empty output"));
    }

    #[test]
    fn gadget_without_save_makes_encryption_unavailable() {
        let mut preferred = inputs(
            Grade::Dangerous,
            StorageSafety::PreferEncrypted,
            BackendProbe::Tpm(Ok(())),
        );
        preferred.gadget_has_save = false;
        let decision = decide_encryption(&preferred).unwrap();
        assert_eq!(decision.unavailable_reason.as_deref(), Some(GADGET_MISSING_SAVE));

        let mut secured = preferred.clone();
        secured.grade = Grade::Secured;
        assert_eq!(
            decide_encryption(&secured).unwrap_err(),
            EncryptionDecisionError::MandatedByGrade(GADGET_MISSING_SAVE.into())
        );
    }
}
