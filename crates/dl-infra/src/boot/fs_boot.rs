//! Boot state kept as JSON documents in the boot directory.
//!
//! `modeenv.json` is the mode record written by the boot path.
//! `bootvars.json` holds the variables shared with the boot loader: the
//! try-boot handshake for recovery systems and the recovery system lists.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use dl_core::encryption::{EncryptionBackend, KeysForRoles, StorageRole};
use dl_core::ports::{BootError, BootPort, MakeRunnableRequest, TryRecoveryOutcome};
use dl_core::SystemModeInfo;

const MODEENV_FILE: &str = "modeenv.json";
const BOOTVARS_FILE: &str = "bootvars.json";
const RUN_SYSTEM_FILE: &str = "run-system.json";

const TRY_STATUS: &str = "try";
const TRIED_STATUS: &str = "tried";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct BootVars {
    try_recovery_system: String,
    /// `try` while a candidate boot is pending, `tried` once it booted.
    recovery_system_status: String,
    next_recovery_system: String,
    next_mode: String,
    current_recovery_systems: Vec<String>,
    good_recovery_systems: Vec<String>,
    boot_ok: bool,
}

impl BootVars {
    fn add_current(&mut self, label: &str) {
        if !self.current_recovery_systems.iter().any(|l| l == label) {
            self.current_recovery_systems.push(label.to_string());
        }
    }

    fn add_good(&mut self, label: &str) {
        self.add_current(label);
        if !self.good_recovery_systems.iter().any(|l| l == label) {
            self.good_recovery_systems.push(label.to_string());
        }
    }
}

/// What `make_runnable` leaves for the run system. Key material itself is
/// never written here.
#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct RunSystemRecord<'a> {
    brand_id: &'a str,
    model: &'a str,
    recovery_system: &'a str,
    backend: Option<EncryptionBackend>,
    factory_reset: bool,
    sealed_roles: Vec<StorageRole>,
}

pub struct FsBoot {
    dir: PathBuf,
    /// Serializes read-modify-write cycles of the boot variables.
    vars_lock: Mutex<()>,
}

impl FsBoot {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            vars_lock: Mutex::new(()),
        }
    }

    async fn read_vars(&self) -> Result<BootVars, BootError> {
        let path = self.dir.join(BOOTVARS_FILE);
        match fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => Ok(BootVars::default()),
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| BootError::Failed(format!("cannot parse boot variables: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BootVars::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), BootError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(name);
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| BootError::Failed(format!("cannot encode {name}: {e}")))?;
        write_synced(&path, json.as_bytes()).await?;
        Ok(())
    }

    /// Applies `edit` to the boot variables and writes them back.
    async fn update_vars<F>(&self, edit: F) -> Result<(), BootError>
    where
        F: FnOnce(&mut BootVars) -> Result<(), BootError> + Send,
    {
        let _guard = self.vars_lock.lock().await;
        let mut vars = self.read_vars().await?;
        edit(&mut vars)?;
        self.write_json(BOOTVARS_FILE, &vars).await
    }
}

async fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    fs::rename(&tmp, path).await
}

#[async_trait]
impl BootPort for FsBoot {
    async fn mode_info(&self) -> Result<SystemModeInfo, BootError> {
        let path = self.dir.join(MODEENV_FILE);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BootError::Unavailable(format!(
                    "no mode record at {}",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let mut info: SystemModeInfo = serde_json::from_str(&content)
            .map_err(|e| BootError::Failed(format!("cannot parse mode record: {e}")))?;
        info.has_mode_record = true;
        Ok(info)
    }

    async fn make_runnable(
        &self,
        request: &MakeRunnableRequest,
        keys: Option<&KeysForRoles>,
    ) -> Result<(), BootError> {
        let record = RunSystemRecord {
            brand_id: &request.model.brand_id,
            model: &request.model.model,
            recovery_system: &request.recovery_system,
            backend: request.backend,
            factory_reset: request.factory_reset,
            sealed_roles: keys.map(|k| k.keys().copied().collect()).unwrap_or_default(),
        };
        self.write_json(RUN_SYSTEM_FILE, &record).await?;
        let label = request.recovery_system.clone();
        self.update_vars(move |vars| {
            vars.add_good(&label);
            Ok(())
        })
        .await?;
        info!(recovery_system = %request.recovery_system, "run system made bootable");
        Ok(())
    }

    async fn ensure_next_boot_to_run_mode(&self, recovery_system: &str) -> Result<(), BootError> {
        let label = recovery_system.to_string();
        self.update_vars(move |vars| {
            vars.next_mode = "run".into();
            vars.next_recovery_system = label;
            Ok(())
        })
        .await
    }

    async fn set_try_recovery_system(&self, label: &str) -> Result<(), BootError> {
        let label = label.to_string();
        self.update_vars(move |vars| {
            vars.add_current(&label);
            vars.try_recovery_system = label;
            vars.recovery_system_status = TRY_STATUS.into();
            Ok(())
        })
        .await
    }

    async fn set_recovery_boot_system_and_mode(
        &self,
        label: &str,
        mode: &str,
    ) -> Result<(), BootError> {
        let (label, mode) = (label.to_string(), mode.to_string());
        self.update_vars(move |vars| {
            vars.next_recovery_system = label;
            vars.next_mode = mode;
            Ok(())
        })
        .await
    }

    async fn promote_tried_recovery_system(
        &self,
        label: &str,
        tried: &[String],
    ) -> Result<(), BootError> {
        if !tried.iter().any(|l| l == label) {
            return Err(BootError::Failed(format!(
                "system {label:?} has not been successfully tried"
            )));
        }
        let label = label.to_string();
        self.update_vars(move |vars| {
            vars.add_good(&label);
            Ok(())
        })
        .await
    }

    async fn drop_recovery_system(&self, label: &str) -> Result<(), BootError> {
        let label = label.to_string();
        self.update_vars(move |vars| {
            vars.current_recovery_systems.retain(|l| *l != label);
            vars.good_recovery_systems.retain(|l| *l != label);
            if vars.try_recovery_system == label {
                vars.try_recovery_system.clear();
                vars.recovery_system_status.clear();
            }
            Ok(())
        })
        .await
    }

    async fn mark_recovery_capable(&self, label: &str) -> Result<(), BootError> {
        let label = label.to_string();
        self.update_vars(move |vars| {
            vars.add_good(&label);
            Ok(())
        })
        .await
    }

    async fn unmark_recovery_capable(&self, label: &str) -> Result<(), BootError> {
        let label = label.to_string();
        self.update_vars(move |vars| {
            vars.good_recovery_systems.retain(|l| *l != label);
            Ok(())
        })
        .await
    }

    async fn good_recovery_systems(&self) -> Result<Vec<String>, BootError> {
        Ok(self.read_vars().await?.good_recovery_systems)
    }

    async fn mark_boot_successful(&self) -> Result<(), BootError> {
        self.update_vars(|vars| {
            vars.boot_ok = true;
            Ok(())
        })
        .await
    }

    async fn inspect_try_recovery_outcome(
        &self,
    ) -> Result<Option<TryRecoveryOutcome>, BootError> {
        let vars = self.read_vars().await?;
        if vars.try_recovery_system.is_empty() {
            return Ok(None);
        }
        let success = match vars.recovery_system_status.as_str() {
            TRIED_STATUS => true,
            TRY_STATUS => false,
            other => {
                debug!(status = other, "unexpected recovery system status");
                false
            }
        };
        Ok(Some(TryRecoveryOutcome {
            label: vars.try_recovery_system,
            success,
        }))
    }

    async fn clear_try_recovery_system(&self, label: &str) -> Result<(), BootError> {
        let label = label.to_string();
        self.update_vars(move |vars| {
            if vars.try_recovery_system == label {
                vars.try_recovery_system.clear();
                vars.recovery_system_status.clear();
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_mode_record_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let boot = FsBoot::new(dir.path().to_path_buf());

        let err = boot.mode_info().await.unwrap_err();
        assert!(matches!(err, BootError::Unavailable(_)));
    }

    #[tokio::test]
    async fn mode_record_is_read() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(MODEENV_FILE),
            r#"{"mode":"install","recovery_system":"20240101"}"#,
        )
        .unwrap();
        let boot = FsBoot::new(dir.path().to_path_buf());

        let info = boot.mode_info().await.unwrap();
        assert_eq!(info.mode, dl_core::SystemMode::Install);
        assert_eq!(info.recovery_system.as_deref(), Some("20240101"));
        assert!(info.has_mode_record);
    }

    #[tokio::test]
    async fn try_boot_outcome_follows_status() {
        let dir = TempDir::new().unwrap();
        let boot = FsBoot::new(dir.path().to_path_buf());

        assert_eq!(boot.inspect_try_recovery_outcome().await.unwrap(), None);

        boot.set_try_recovery_system("1234").await.unwrap();
        let outcome = boot.inspect_try_recovery_outcome().await.unwrap().unwrap();
        assert!(!outcome.success);

        // the boot path flips the status once the candidate came up
        boot.update_vars(|vars| {
            vars.recovery_system_status = TRIED_STATUS.into();
            Ok(())
        })
        .await
        .unwrap();
        let outcome = boot.inspect_try_recovery_outcome().await.unwrap().unwrap();
        assert_eq!(outcome.label, "1234");
        assert!(outcome.success);

        boot.clear_try_recovery_system("1234").await.unwrap();
        assert_eq!(boot.inspect_try_recovery_outcome().await.unwrap(), None);
    }

    #[tokio::test]
    async fn promotion_requires_a_tried_system() {
        let dir = TempDir::new().unwrap();
        let boot = FsBoot::new(dir.path().to_path_buf());

        let err = boot
            .promote_tried_recovery_system("1234", &[])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "system \"1234\" has not been successfully tried");

        boot.promote_tried_recovery_system("1234", &["1234".to_string()])
            .await
            .unwrap();
        assert_eq!(boot.good_recovery_systems().await.unwrap(), vec!["1234".to_string()]);

        boot.drop_recovery_system("1234").await.unwrap();
        assert!(boot.good_recovery_systems().await.unwrap().is_empty());
    }
}
