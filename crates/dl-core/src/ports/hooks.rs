use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookError {
    /// The runner cannot take the hook right now; the caller may retry.
    #[error("hook runner is busy: {0}")]
    Busy(String),

    #[error("run hook {hook:?}: timeout after {timeout:?}")]
    Timeout { hook: String, timeout: Duration },

    #[error("run hook {hook:?}: {message}")]
    Failed { hook: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HookRequest {
    pub snap: String,
    pub hook: String,
    /// Key/value context handed to the hook.
    pub context: BTreeMap<String, Value>,
}

impl HookRequest {
    pub fn new(snap: &str, hook: &str) -> Self {
        Self {
            snap: snap.to_string(),
            hook: hook.to_string(),
            context: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookOutput {
    pub stdout: Vec<u8>,
    /// Context as left by the hook.
    pub context: BTreeMap<String, Value>,
}

/// Runs snap hooks synchronously with a timeout.
#[async_trait]
pub trait HookRunnerPort: Send + Sync {
    async fn has_hook(&self, snap: &str, hook: &str) -> Result<bool, HookError>;

    async fn run_hook(
        &self,
        request: &HookRequest,
        timeout: Duration,
    ) -> Result<HookOutput, HookError>;
}
