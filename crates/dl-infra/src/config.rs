//! TOML loading of [`DaemonConfig`].

use std::path::Path;

use anyhow::Context;
use dl_core::config::DaemonConfig;
use tracing::info;

/// Reads the daemon configuration. A missing file yields the defaults.
pub async fn load_config(path: &Path) -> anyhow::Result<DaemonConfig> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(DaemonConfig::defaults());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("read config failed: {}", path.display()))
        }
    };
    toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {e}", path.display()))
}
