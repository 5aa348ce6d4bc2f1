//! Runs hooks as child processes.
//!
//! A hook is the executable `<hooks_dir>/<snap>/<hook>`. It receives its
//! context as a JSON object on stdin and may leave an updated context as a
//! JSON object in the file named by `DEVICELIFE_HOOK_CONTEXT_OUT`. One hook
//! runs at a time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

use dl_core::ports::{HookError, HookOutput, HookRequest, HookRunnerPort};

pub const CONTEXT_OUT_ENV: &str = "DEVICELIFE_HOOK_CONTEXT_OUT";

pub struct ProcessHookRunner {
    dir: PathBuf,
    running: Mutex<()>,
}

impl ProcessHookRunner {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            running: Mutex::new(()),
        }
    }

    fn hook_path(&self, snap: &str, hook: &str) -> PathBuf {
        self.dir.join(snap).join(hook)
    }

    async fn read_context(
        path: &Path,
        hook: &str,
    ) -> Result<Option<BTreeMap<String, Value>>, HookError> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let _ = fs::remove_file(path).await;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| HookError::Failed {
                hook: hook.to_string(),
                message: format!("cannot parse hook context: {e}"),
            })
    }

    async fn spawn(
        &self,
        request: &HookRequest,
        context_out: &Path,
    ) -> Result<std::process::Output, HookError> {
        let input = serde_json::to_vec(&request.context).map_err(|e| HookError::Failed {
            hook: request.hook.clone(),
            message: format!("cannot encode hook context: {e}"),
        })?;

        let mut child = Command::new(self.hook_path(&request.snap, &request.hook))
            .env("DEVICELIFE_SNAP", &request.snap)
            .env("DEVICELIFE_HOOK", &request.hook)
            .env(CONTEXT_OUT_ENV, context_out)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            // hooks are free to ignore their input
            if let Err(e) = stdin.write_all(&input).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }
        Ok(child.wait_with_output().await?)
    }
}

#[async_trait]
impl HookRunnerPort for ProcessHookRunner {
    async fn has_hook(&self, snap: &str, hook: &str) -> Result<bool, HookError> {
        Ok(fs::try_exists(self.hook_path(snap, hook)).await?)
    }

    async fn run_hook(
        &self,
        request: &HookRequest,
        timeout: Duration,
    ) -> Result<HookOutput, HookError> {
        let Ok(_running) = self.running.try_lock() else {
            return Err(HookError::Busy(format!(
                "cannot run {:?} while another hook is running",
                request.hook
            )));
        };

        let context_out = std::env::temp_dir().join(format!(
            "devicelife-hook-{}.json",
            rand::random::<u64>()
        ));
        let span = info_span!("hook.run", snap = %request.snap, hook = %request.hook);
        let output = match tokio::time::timeout(timeout, self.spawn(request, &context_out))
            .instrument(span)
            .await
        {
            Ok(output) => output?,
            Err(_) => {
                let _ = fs::remove_file(&context_out).await;
                return Err(HookError::Timeout {
                    hook: request.hook.clone(),
                    timeout,
                });
            }
        };

        if !output.status.success() {
            let _ = fs::remove_file(&context_out).await;
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                output.status.to_string()
            } else {
                stderr
            };
            return Err(HookError::Failed {
                hook: request.hook.clone(),
                message,
            });
        }

        let context = Self::read_context(&context_out, &request.hook)
            .await?
            .unwrap_or_else(|| request.context.clone());
        debug!(snap = %request.snap, hook = %request.hook, "hook finished");
        Ok(HookOutput {
            stdout: output.stdout,
            context,
        })
    }
}
