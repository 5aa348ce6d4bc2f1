//! Probing of the storage encryption backends.
//!
//! When the kernel ships an `fde-setup` hook only the hook is asked for its
//! features; the TPM is probed only in its absence.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, info};

use dl_core::encryption::{
    decide_encryption, encryption_considered, parse_features, BackendProbe, EncryptionDecision,
    EncryptionDecisionError, EncryptionInputs, StorageRole,
};
use dl_core::ports::{HookRequest, HookRunnerPort, SecbootPort};
use dl_core::seed::GadgetInfo;
use dl_core::ModelAssertion;

use super::DeviceManager;

const FDE_SETUP_HOOK: &str = "fde-setup";

pub(crate) async fn probe_backend(
    hooks: &dyn HookRunnerPort,
    secboot: &dyn SecbootPort,
    kernel: Option<&str>,
    timeout: Duration,
) -> BackendProbe {
    if let Some(kernel) = kernel {
        match hooks.has_hook(kernel, FDE_SETUP_HOOK).await {
            Ok(true) => return BackendProbe::Hook(query_fde_features(hooks, kernel, timeout).await),
            Ok(false) => {}
            Err(err) => {
                return BackendProbe::Hook(Err(format!("cannot look up fde-setup hook: {err}")))
            }
        }
    }
    BackendProbe::Tpm(
        secboot
            .check_tpm_sealing_supported()
            .await
            .map_err(|e| e.to_string()),
    )
}

async fn query_fde_features(
    hooks: &dyn HookRunnerPort,
    kernel: &str,
    timeout: Duration,
) -> Result<Vec<String>, String> {
    let request = HookRequest::new(kernel, FDE_SETUP_HOOK)
        .with("fde-setup-request", json!({"op": "features"}));
    let output = hooks
        .run_hook(&request, timeout)
        .await
        .map_err(|e| e.to_string())?;
    parse_features(&output.stdout).map_err(|e| e.to_string())
}

/// Decides whether and how to encrypt storage for `model` on `gadget`.
pub(crate) async fn decide(
    hooks: &dyn HookRunnerPort,
    secboot: &dyn SecbootPort,
    model: &ModelAssertion,
    gadget: &GadgetInfo,
    timeout: Duration,
) -> Result<EncryptionDecision, EncryptionDecisionError> {
    let storage_safety = model.storage_safety();
    if !encryption_considered(model.grade, storage_safety) {
        debug!(grade = %model.grade, %storage_safety, "storage encryption not considered");
        return Ok(EncryptionDecision::unencrypted());
    }

    let probe = probe_backend(hooks, secboot, model.kernel.as_deref(), timeout).await;
    let decision = decide_encryption(&EncryptionInputs {
        grade: model.grade,
        storage_safety,
        gadget_has_save: gadget.has_role(StorageRole::SystemSave),
        probe,
    })?;
    if let Some(reason) = &decision.unavailable_reason {
        info!(reason = %reason, "not encrypting device storage");
    }
    Ok(decision)
}

impl DeviceManager {
    pub(super) async fn decide_encryption(
        &self,
        model: &ModelAssertion,
        gadget: &GadgetInfo,
    ) -> Result<EncryptionDecision, EncryptionDecisionError> {
        decide(
            self.deps.hooks.as_ref(),
            self.deps.secboot.as_ref(),
            model,
            gadget,
            self.options.hook_timeout,
        )
        .await
    }
}
