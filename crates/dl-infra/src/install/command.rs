//! Installer driven through an external command.
//!
//! Partitioning and content writing are done by the installer command,
//! invoked as `<command> <step> [--flag value]...`. Steps that produce data
//! print one JSON document on stdout; key material only ever travels on
//! stdin/stdout, never on the command line. The remaining target setup is
//! plain file work done here.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use dl_core::encryption::{
    EncryptionBackend, EncryptionKey, EncryptionSetupData, KeysForRoles, StorageRole,
};
use dl_core::model::ModelAssertion;
use dl_core::ports::{
    InstallError, InstallKind, InstallOptions, InstallPort, InstalledSystem, SaveContents,
    TargetConfig,
};
use dl_core::SerialAssertion;

const PRESEED_ARTIFACT: &str = "preseed.tgz";

/// Directories the installer works with.
#[derive(Debug, Clone)]
pub struct InstallerPaths {
    pub seed_dir: PathBuf,
    pub save_dir: PathBuf,
    pub target_dir: PathBuf,
    /// Device key store of the running system.
    pub keys_dir: PathBuf,
}

pub struct CommandInstaller {
    command: Vec<String>,
    paths: InstallerPaths,
}

#[derive(Deserialize)]
struct InstallOutput {
    #[serde(default)]
    keys: Option<BTreeMap<StorageRole, String>>,
    #[serde(default, rename = "storage-traits")]
    storage_traits: Value,
}

#[derive(Deserialize)]
struct EncryptionOutput {
    keys: BTreeMap<StorageRole, String>,
    #[serde(default)]
    devices: BTreeMap<StorageRole, String>,
}

fn decode_keys(keys: BTreeMap<StorageRole, String>) -> Result<KeysForRoles, InstallError> {
    keys.into_iter()
        .map(|(role, hex_key)| {
            hex::decode(hex_key.trim())
                .map(|bytes| (role, EncryptionKey::new(bytes)))
                .map_err(|e| InstallError::Failed(format!("invalid key for {role}: {e}")))
        })
        .collect()
}

fn backend_name(backend: EncryptionBackend) -> &'static str {
    match backend {
        EncryptionBackend::DeviceSetupHook => "device-setup-hook",
        EncryptionBackend::LuksWithHook => "luks-with-hook",
        EncryptionBackend::LuksWithTpm => "luks-with-tpm",
    }
}

impl CommandInstaller {
    pub fn new(command: Vec<String>, paths: InstallerPaths) -> Self {
        Self { command, paths }
    }

    async fn invoke(
        &self,
        step: &str,
        args: &[String],
        input: Option<Value>,
    ) -> Result<Vec<u8>, InstallError> {
        let (program, base_args) = self
            .command
            .split_first()
            .ok_or_else(|| InstallError::Failed("no installer command configured".into()))?;
        debug!(step, "running installer");

        let mut child = Command::new(program)
            .args(base_args)
            .arg(step)
            .args(args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            if let Err(e) = stdin.write_all(input.to_string().as_bytes()).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(InstallError::Failed(format!(
                "installer step {step} failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn invoke_json<T: DeserializeOwned>(
        &self,
        step: &str,
        args: &[String],
        input: Option<Value>,
    ) -> Result<T, InstallError> {
        let stdout = self.invoke(step, args, input).await?;
        serde_json::from_slice(&stdout)
            .map_err(|e| InstallError::Failed(format!("cannot parse output of installer step {step}: {e}")))
    }

    fn target_state_dir(&self) -> PathBuf {
        self.paths.target_dir.join("var/lib/devicelife")
    }

    fn save_device_dir(&self) -> PathBuf {
        self.paths.save_dir.join("device")
    }

    async fn write_target_file(&self, path: PathBuf, content: &[u8]) -> Result<(), InstallError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(&path).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        Ok(())
    }
}

fn encode(value: &impl serde::Serialize) -> Result<Vec<u8>, InstallError> {
    serde_json::to_vec_pretty(value).map_err(|e| InstallError::Failed(e.to_string()))
}

#[async_trait]
impl InstallPort for CommandInstaller {
    async fn run(&self, options: &InstallOptions) -> Result<InstalledSystem, InstallError> {
        let kind = match options.kind {
            InstallKind::Install => "install",
            InstallKind::FactoryReset => "factory-reset",
        };
        let mut args = vec![
            "--kind".to_string(),
            kind.to_string(),
            "--system".to_string(),
            options.recovery_system.clone(),
        ];
        if let Some(backend) = options.backend {
            args.extend(["--encrypt".to_string(), backend_name(backend).to_string()]);
        }
        let output: InstallOutput = self.invoke_json("install", &args, None).await?;
        let keys = output.keys.map(decode_keys).transpose()?;
        info!(kind, system = %options.recovery_system, encrypted = keys.is_some(), "installer finished");
        Ok(InstalledSystem {
            keys,
            storage_traits: output.storage_traits,
        })
    }

    async fn save_storage_traits(&self, traits: &Value) -> Result<(), InstallError> {
        let path = self.target_state_dir().join("device/disk-mapping.json");
        self.write_target_file(path, &encode(traits)?).await
    }

    async fn restore_preseed_artifact(&self, recovery_system: &str) -> Result<bool, InstallError> {
        let artifact = self
            .paths
            .seed_dir
            .join("systems")
            .join(recovery_system)
            .join(PRESEED_ARTIFACT);
        if !fs::try_exists(&artifact).await? {
            return Ok(false);
        }
        let args = vec![
            "--artifact".to_string(),
            artifact.display().to_string(),
            "--target".to_string(),
            self.paths.target_dir.display().to_string(),
        ];
        self.invoke("restore-preseed", &args, None).await?;
        Ok(true)
    }

    async fn write_model_and_clock(&self, model: &ModelAssertion) -> Result<(), InstallError> {
        let dir = self.target_state_dir();
        self.write_target_file(dir.join("model.json"), &encode(model)?)
            .await?;
        // the installed system must not boot with a clock older than now
        self.write_target_file(dir.join("clock"), Utc::now().to_rfc3339().as_bytes())
            .await
    }

    async fn configure_target(&self, config: &TargetConfig) -> Result<(), InstallError> {
        let etc = self.paths.target_dir.join("etc");
        let document = json!({
            "grade": config.grade,
            "allow-cloud-init": config.allow_cloud_init,
            "apply-gadget-defaults": config.apply_gadget_defaults,
        });
        self.write_target_file(etc.join("devicelife/target.json"), &encode(&document)?)
            .await?;
        if !config.allow_cloud_init {
            self.write_target_file(etc.join("cloud/cloud-init.disabled"), b"")
                .await?;
        }
        Ok(())
    }

    async fn setup_storage_encryption(
        &self,
        recovery_system: &str,
        backend: EncryptionBackend,
    ) -> Result<EncryptionSetupData, InstallError> {
        let args = vec![
            "--system".to_string(),
            recovery_system.to_string(),
            "--encrypt".to_string(),
            backend_name(backend).to_string(),
        ];
        let output: EncryptionOutput = self
            .invoke_json("setup-storage-encryption", &args, None)
            .await?;
        Ok(EncryptionSetupData {
            label: recovery_system.to_string(),
            backend,
            keys: decode_keys(output.keys)?,
            devices: output.devices,
        })
    }

    async fn finish_install(
        &self,
        recovery_system: &str,
        encryption: Option<&EncryptionSetupData>,
    ) -> Result<(), InstallError> {
        let args = vec!["--system".to_string(), recovery_system.to_string()];
        let input = encryption.map(|e| {
            let keys: BTreeMap<StorageRole, String> = e
                .keys
                .iter()
                .map(|(role, key)| (*role, hex::encode(key.as_bytes())))
                .collect();
            json!({
                "backend": backend_name(e.backend),
                "keys": keys,
                "devices": e.devices,
            })
        });
        self.invoke("finish", &args, Some(input.unwrap_or(Value::Null)))
            .await?;
        Ok(())
    }

    async fn inspect_save(&self) -> Result<SaveContents, InstallError> {
        let device = self.save_device_dir();
        let encrypted = match fs::read_to_string(device.join("encryption")).await {
            Ok(marker) => Some(marker.trim() != "none"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let mut serials = Vec::new();
        for path in sorted_entries(device.join("serials")).await? {
            let content = fs::read(&path).await?;
            let serial: SerialAssertion = serde_json::from_slice(&content).map_err(|e| {
                InstallError::Failed(format!("cannot parse {}: {e}", path.display()))
            })?;
            serials.push(serial);
        }

        let device_keys = sorted_entries(device.join("private-keys"))
            .await?
            .into_iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();

        Ok(SaveContents {
            encrypted,
            serials,
            device_keys,
        })
    }

    async fn restore_device_key(&self, key_id: &str) -> Result<(), InstallError> {
        if key_id.is_empty() || key_id.contains('/') {
            return Err(InstallError::Failed(format!("invalid key id {key_id:?}")));
        }
        let source = self.save_device_dir().join("private-keys").join(key_id);
        fs::create_dir_all(&self.paths.keys_dir).await?;
        fs::copy(&source, self.paths.keys_dir.join(key_id)).await?;
        Ok(())
    }
}

/// Files of a directory ordered by name; a missing directory is empty.
async fn sorted_entries(dir: PathBuf) -> Result<Vec<PathBuf>, InstallError> {
    let mut entries = match fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}
