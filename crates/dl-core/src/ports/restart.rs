use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RestartKind {
    #[default]
    Reboot,
    Halt,
    Poweroff,
}

impl RestartKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartKind::Reboot => "reboot",
            RestartKind::Halt => "halt",
            RestartKind::Poweroff => "poweroff",
        }
    }
}

impl fmt::Display for RestartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestartKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reboot" => Ok(RestartKind::Reboot),
            "halt" => Ok(RestartKind::Halt),
            "poweroff" => Ok(RestartKind::Poweroff),
            other => Err(format!("unknown restart mode {other:?}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum RestartError {
    #[error("cannot request {kind}: {message}")]
    Failed { kind: RestartKind, message: String },
}

#[async_trait]
pub trait RestartPort: Send + Sync {
    async fn request_restart(&self, kind: RestartKind) -> Result<(), RestartError>;

    /// The restart requested by this process, if any.
    fn pending(&self) -> Option<RestartKind>;
}
