//! Assertion database as JSON files.
//!
//! ```text
//! <dir>/models/<brand>/<model>/<revision>.json
//! <dir>/serials/<brand>/<model>/<device-key-id>/<serial>.json
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use dl_core::model::ModelAssertion;
use dl_core::ports::{AssertionDbPort, AssertionError};
use dl_core::SerialAssertion;

pub struct FsAssertionDb {
    dir: PathBuf,
}

impl FsAssertionDb {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn model_dir(&self, brand_id: &str, model: &str) -> Result<PathBuf, AssertionError> {
        Ok(self
            .dir
            .join("models")
            .join(component(brand_id)?)
            .join(component(model)?))
    }

    fn serial_dir(
        &self,
        brand_id: &str,
        model: &str,
        key_id: &str,
    ) -> Result<PathBuf, AssertionError> {
        Ok(self
            .dir
            .join("serials")
            .join(component(brand_id)?)
            .join(component(model)?)
            .join(component(key_id)?))
    }

    /// Writes a new assertion file; an existing one is a same-revision add.
    async fn add<T: Serialize>(path: &Path, value: &T, what: String) -> Result<(), AssertionError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| AssertionError::Invalid(format!("cannot encode {what}: {e}")))?;
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(AssertionError::SameRevision(what))
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&json).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Reads every JSON file of a directory, ordered by file name.
    async fn read_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<(String, T)>, AssertionError> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let content = fs::read(&path).await?;
            let value = serde_json::from_slice(&content).map_err(|e| {
                AssertionError::Invalid(format!("cannot parse {}: {e}", path.display()))
            })?;
            found.push((name, value));
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }
}

/// A path component taken from assertion headers.
fn component(value: &str) -> Result<&str, AssertionError> {
    if value.is_empty() || value.contains('/') || value == "." || value == ".." {
        return Err(AssertionError::Invalid(format!(
            "invalid assertion header value {value:?}"
        )));
    }
    Ok(value)
}

#[async_trait]
impl AssertionDbPort for FsAssertionDb {
    async fn find_model(
        &self,
        brand_id: &str,
        model: &str,
    ) -> Result<Option<ModelAssertion>, AssertionError> {
        let models: Vec<(String, ModelAssertion)> =
            Self::read_all(&self.model_dir(brand_id, model)?).await?;
        Ok(models
            .into_iter()
            .map(|(_, m)| m)
            .max_by_key(|m| m.revision))
    }

    async fn add_model(&self, model: &ModelAssertion) -> Result<(), AssertionError> {
        let path = self
            .model_dir(&model.brand_id, &model.model)?
            .join(format!("{}.json", model.revision));
        Self::add(
            &path,
            model,
            format!("model {} revision {}", model.identity(), model.revision),
        )
        .await
    }

    async fn find_serials(
        &self,
        brand_id: &str,
        model: &str,
        device_key_id: &str,
    ) -> Result<Vec<SerialAssertion>, AssertionError> {
        let dir = self.serial_dir(brand_id, model, device_key_id)?;
        let serials: Vec<(String, SerialAssertion)> = Self::read_all(&dir).await?;
        Ok(serials.into_iter().map(|(_, s)| s).collect())
    }

    async fn add_serial(&self, serial: &SerialAssertion) -> Result<(), AssertionError> {
        let path = self
            .serial_dir(&serial.brand_id, &serial.model, &serial.device_key_id)?
            .join(format!("{}.json", component(&serial.serial)?));
        Self::add(&path, serial, format!("serial {}", serial.serial)).await
    }
}
