//! File-based state store
//!
//! Persists the daemon state document as pretty JSON. Writes go to a
//! sibling temporary file which is synced and renamed over the target.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use dl_core::ports::StateStorePort;
use dl_core::State;

pub struct FileStateRepository {
    path: PathBuf,
}

impl FileStateRepository {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn ensure_parent_dir(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStorePort for FileStateRepository {
    async fn load(&self) -> anyhow::Result<State> {
        if !self.path.exists() {
            return Ok(State::default());
        }

        let content = fs::read_to_string(&self.path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read state file: {e}"))?;
        if content.trim().is_empty() {
            return Ok(State::default());
        }

        let state: State = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse state: {e}"))?;
        Ok(state)
    }

    async fn save(&self, state: &State) -> anyhow::Result<()> {
        self.ensure_parent_dir().await?;

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| anyhow::anyhow!("Failed to serialize state: {e}"))?;

        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create state file: {e}"))?;
        file.write_all(json.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write state file: {e}"))?;
        file.sync_all()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to sync state file: {e}"))?;

        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to replace state file: {e}"))?;
        Ok(())
    }
}
