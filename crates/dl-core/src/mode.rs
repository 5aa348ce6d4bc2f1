use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Boot mode the system is running in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SystemMode {
    #[default]
    Run,
    Install,
    Recover,
    FactoryReset,
}

impl SystemMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemMode::Run => "run",
            SystemMode::Install => "install",
            SystemMode::Recover => "recover",
            SystemMode::FactoryReset => "factory-reset",
        }
    }
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SystemMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => Ok(SystemMode::Run),
            "install" => Ok(SystemMode::Install),
            "recover" => Ok(SystemMode::Recover),
            "factory-reset" => Ok(SystemMode::FactoryReset),
            other => Err(format!("unknown system mode {other:?}")),
        }
    }
}

/// Mode information read once from the boot collaborator at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemModeInfo {
    pub mode: SystemMode,
    /// Label of the recovery system the current boot came from.
    #[serde(default)]
    pub recovery_system: Option<String>,
    #[serde(default)]
    pub boot_flags: Vec<String>,
    /// False on classic systems without a mode record.
    #[serde(default)]
    pub has_mode_record: bool,
}

impl SystemModeInfo {
    pub fn classic() -> Self {
        Self::default()
    }
}
