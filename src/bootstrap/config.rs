//! Locating and loading the daemon configuration.
//!
//! Loading is pure data mapping; missing keys fall back to
//! [`DaemonConfig::defaults`] and a missing file is not an error.

use std::path::{Path, PathBuf};

use dl_core::config::DaemonConfig;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/devicelife/devicelife.toml";

/// Picks the configuration file: `DEVICELIFE_CONFIG` first, then the first
/// command line argument, then [`DEFAULT_CONFIG_PATH`].
pub fn config_path(env: Option<String>, args: impl IntoIterator<Item = String>) -> PathBuf {
    if let Some(path) = env.filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    args.into_iter()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub async fn load_config(path: &Path) -> anyhow::Result<DaemonConfig> {
    dl_infra::load_config(path).await
}
