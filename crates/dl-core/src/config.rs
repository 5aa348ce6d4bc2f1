//! Daemon configuration DTO.
//!
//! Pure data mapped from TOML. Loading lives in the infra layer; missing
//! keys take the values from [`DaemonConfig::defaults`].

use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Persisted state document.
    pub state_file: PathBuf,
    /// Root of the seed (`systems/` and `snaps/`).
    pub seed_dir: PathBuf,
    /// Boot state directory (mode record and boot variables).
    pub boot_dir: PathBuf,
    /// Hook executables, as `<snap>/<hook>`.
    pub hooks_dir: PathBuf,
    pub assertions_dir: PathBuf,
    pub keys_dir: PathBuf,
    /// Snap files offered to remodels.
    pub remodel_snaps_dir: PathBuf,
    pub cloud_init_dir: PathBuf,
    /// Save partition of a previous installation.
    pub save_dir: PathBuf,
    /// Root of the system being installed.
    pub target_dir: PathBuf,
    /// When set, a rolling log file is written here as well.
    pub log_dir: Option<PathBuf>,
    pub device_service_url: String,
    pub tpm_device: PathBuf,
    pub installer_command: Vec<String>,
    pub reboot_command: Vec<String>,
    pub preseed: bool,
    pub ensure_interval_secs: u64,
    pub hook_timeout_secs: u64,
}

impl DaemonConfig {
    /// v1 defaults, keep them stable.
    pub fn defaults() -> Self {
        let lib = PathBuf::from("/var/lib/devicelife");
        Self {
            state_file: lib.join("state.json"),
            seed_dir: PathBuf::from("/var/lib/devicelife/seed"),
            boot_dir: lib.join("boot"),
            hooks_dir: lib.join("hooks"),
            assertions_dir: lib.join("assertions"),
            keys_dir: lib.join("device/private-keys"),
            remodel_snaps_dir: lib.join("remodel-snaps"),
            cloud_init_dir: PathBuf::from("/etc/cloud/cloud.cfg.d"),
            save_dir: PathBuf::from("/run/mnt/ubuntu-save"),
            target_dir: PathBuf::from("/run/mnt/ubuntu-data"),
            log_dir: None,
            device_service_url: "https://serial-vault.example.com/request-serial/".into(),
            tpm_device: PathBuf::from("/dev/tpm0"),
            installer_command: vec!["/usr/lib/devicelife/install".into()],
            reboot_command: vec!["systemctl".into()],
            preseed: false,
            ensure_interval_secs: 300,
            hook_timeout_secs: 600,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_use_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            seed_dir = "/run/mnt/ubuntu-seed"
            preseed = true
            "#,
        )
        .unwrap();
        assert_eq!(config.seed_dir, PathBuf::from("/run/mnt/ubuntu-seed"));
        assert!(config.preseed);
        assert_eq!(config.hook_timeout_secs, 600);
        assert_eq!(config.log_dir, None);
    }

    #[test]
    fn empty_document_is_defaults() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config, DaemonConfig::defaults());
    }
}
