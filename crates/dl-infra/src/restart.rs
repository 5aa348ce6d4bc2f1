use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use dl_core::ports::{RestartError, RestartKind, RestartPort};

/// Requests restarts by running the configured command with the restart
/// kind appended (`systemctl reboot`). An empty command only records the
/// request.
pub struct CommandRestart {
    command: Vec<String>,
    pending: Mutex<Option<RestartKind>>,
}

impl CommandRestart {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            pending: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RestartPort for CommandRestart {
    async fn request_restart(&self, kind: RestartKind) -> Result<(), RestartError> {
        match self.pending.lock() {
            Ok(mut pending) => *pending = Some(kind),
            Err(poisoned) => *poisoned.into_inner() = Some(kind),
        }
        info!(%kind, "restart requested");

        let Some((program, args)) = self.command.split_first() else {
            return Ok(());
        };
        let status = Command::new(program)
            .args(args)
            .arg(kind.as_str())
            .status()
            .await
            .map_err(|e| RestartError::Failed {
                kind,
                message: e.to_string(),
            })?;
        if !status.success() {
            return Err(RestartError::Failed {
                kind,
                message: format!("{program} exited with {status}"),
            });
        }
        Ok(())
    }

    fn pending(&self) -> Option<RestartKind> {
        match self.pending.lock() {
            Ok(pending) => *pending,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
