//! Seed on a local directory.
//!
//! ```text
//! <seed>/systems/<label>/model.json
//! <seed>/systems/<label>/snaps.json
//! <seed>/systems/<label>/gadget.json   (optional)
//! <seed>/snaps/<name>_<revision>.snap  (shared by all systems)
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use dl_core::model::ModelAssertion;
use dl_core::ports::{SeedError, SeedPort, SeedWriterPort};
use dl_core::seed::{GadgetInfo, SeedSnap, SeedSystem};

const MODEL_FILE: &str = "model.json";
const SNAPS_FILE: &str = "snaps.json";
const GADGET_FILE: &str = "gadget.json";

pub struct FsSeed {
    root: PathBuf,
}

impl FsSeed {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn systems_dir(&self) -> PathBuf {
        self.root.join("systems")
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, SeedError> {
        let content = fs::read_to_string(path).await?;
        serde_json::from_str(&content)
            .map_err(|e| SeedError::Invalid(format!("cannot parse {}: {e}", path.display())))
    }

    async fn write_json<T: serde::Serialize + ?Sized>(
        path: &Path,
        value: &T,
    ) -> Result<(), SeedError> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| SeedError::Invalid(format!("cannot encode {}: {e}", path.display())))?;
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn load_labelled(&self, label: &str) -> Result<SeedSystem, SeedError> {
        let dir = self.system_dir(label);
        if !fs::try_exists(dir.join(MODEL_FILE)).await? {
            return Err(SeedError::NotFound(label.to_string()));
        }
        let model: ModelAssertion = Self::read_json(&dir.join(MODEL_FILE)).await?;
        let snaps: Vec<SeedSnap> = Self::read_json(&dir.join(SNAPS_FILE)).await?;
        let gadget_path = dir.join(GADGET_FILE);
        let gadget: GadgetInfo = if fs::try_exists(&gadget_path).await? {
            Self::read_json(&gadget_path).await?
        } else {
            GadgetInfo::default()
        };
        Ok(SeedSystem {
            label: label.to_string(),
            model,
            snaps,
            gadget,
        })
    }
}

#[async_trait]
impl SeedPort for FsSeed {
    async fn load_system(&self, label: Option<&str>) -> Result<SeedSystem, SeedError> {
        if let Some(label) = label {
            return self.load_labelled(label).await;
        }
        let labels = self.list_systems().await?;
        match labels.as_slice() {
            [only] => self.load_labelled(only).await,
            [] => Err(SeedError::NotFound(String::new())),
            _ => Err(SeedError::Invalid(format!(
                "seed has {} systems, a label is required",
                labels.len()
            ))),
        }
    }

    async fn list_systems(&self) -> Result<Vec<String>, SeedError> {
        let mut entries = match fs::read_dir(self.systems_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut labels = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !fs::try_exists(entry.path().join(MODEL_FILE)).await? {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                labels.push(name.to_string());
            }
        }
        labels.sort();
        Ok(labels)
    }
}

#[async_trait]
impl SeedWriterPort for FsSeed {
    fn system_dir(&self, label: &str) -> PathBuf {
        self.systems_dir().join(label)
    }

    fn snap_path(&self, name: &str, revision: &str) -> PathBuf {
        self.root.join("snaps").join(format!("{name}_{revision}.snap"))
    }

    async fn exists(&self, path: &Path) -> Result<bool, SeedError> {
        Ok(fs::try_exists(path).await?)
    }

    async fn create_system_dir(&self, label: &str) -> Result<PathBuf, SeedError> {
        let dir = self.system_dir(label);
        fs::create_dir_all(self.systems_dir()).await?;
        match fs::create_dir(&dir).await {
            Ok(()) => Ok(dir),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(SeedError::AlreadyExists(label.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn append_log(&self, log: &Path, line: &str) -> Result<(), SeedError> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .await?;
        file.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            file.write_all(b"\n").await?;
        }
        file.sync_all().await?;
        Ok(())
    }

    async fn read_log(&self, log: &Path) -> Result<String, SeedError> {
        match fs::read_to_string(log).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn copy_snap(&self, from: &Path, to: &Path) -> Result<(), SeedError> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(from, to).await?;
        debug!(from = %from.display(), to = %to.display(), "copied snap into seed");
        Ok(())
    }

    async fn write_system_metadata(
        &self,
        label: &str,
        model: &ModelAssertion,
        snaps: &[SeedSnap],
    ) -> Result<(), SeedError> {
        let dir = self.system_dir(label);
        Self::write_json(&dir.join(SNAPS_FILE), snaps).await?;
        // model.json last: a system without it is not listed
        Self::write_json(&dir.join(MODEL_FILE), model).await
    }

    async fn remove_file(&self, path: &Path) -> Result<(), SeedError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_dir_all(&self, dir: &Path) -> Result<(), SeedError> {
        match fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use dl_core::model::Grade;
    use dl_core::seed::SnapKind;
    use tempfile::TempDir;

    fn model() -> ModelAssertion {
        ModelAssertion {
            brand_id: "canonical".into(),
            model: "pc".into(),
            revision: 1,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            grade: Grade::Dangerous,
            storage_safety: None,
            gadget: Some("pc".into()),
            kernel: Some("pc-kernel".into()),
            base: Some("core22".into()),
            store: None,
            required_snaps: vec![],
            validation_sets: vec![],
            classic: false,
        }
    }

    fn seed_snap(seed: &FsSeed, name: &str) -> SeedSnap {
        SeedSnap {
            name: name.into(),
            revision: "1".into(),
            path: seed.snap_path(name, "1"),
            kind: SnapKind::App,
            essential: true,
        }
    }

    #[tokio::test]
    async fn written_system_is_listed_and_loaded() {
        let dir = TempDir::new().unwrap();
        let seed = FsSeed::new(dir.path().to_path_buf());

        seed.create_system_dir("20240101").await.unwrap();
        seed.write_system_metadata("20240101", &model(), &[seed_snap(&seed, "pc")])
            .await
            .unwrap();

        assert_eq!(seed.list_systems().await.unwrap(), vec!["20240101".to_string()]);
        let system = seed.load_system(None).await.unwrap();
        assert_eq!(system.label, "20240101");
        assert_eq!(system.snaps.len(), 1);
        assert_eq!(system.gadget, GadgetInfo::default());
    }

    #[tokio::test]
    async fn directory_without_model_is_not_a_system() {
        let dir = TempDir::new().unwrap();
        let seed = FsSeed::new(dir.path().to_path_buf());

        seed.create_system_dir("half-written").await.unwrap();

        assert!(seed.list_systems().await.unwrap().is_empty());
        let err = seed.load_system(Some("half-written")).await.unwrap_err();
        assert!(matches!(err, SeedError::NotFound(label) if label == "half-written"));
    }

    #[tokio::test]
    async fn create_system_dir_refuses_existing_label() {
        let dir = TempDir::new().unwrap();
        let seed = FsSeed::new(dir.path().to_path_buf());

        seed.create_system_dir("1234").await.unwrap();
        let err = seed.create_system_dir("1234").await.unwrap_err();
        assert!(matches!(err, SeedError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn log_lines_are_appended_and_missing_files_tolerated() {
        let dir = TempDir::new().unwrap();
        let seed = FsSeed::new(dir.path().to_path_buf());
        let log = dir.path().join("new-file-log");

        assert_eq!(seed.read_log(&log).await.unwrap(), "");
        seed.append_log(&log, "/seed/snaps/a_1.snap\n").await.unwrap();
        seed.append_log(&log, "/seed/snaps/b_1.snap").await.unwrap();
        assert_eq!(
            seed.read_log(&log).await.unwrap(),
            "/seed/snaps/a_1.snap\n/seed/snaps/b_1.snap\n"
        );

        seed.remove_file(&dir.path().join("absent")).await.unwrap();
        seed.remove_dir_all(&dir.path().join("absent-dir")).await.unwrap();
    }

    #[tokio::test]
    async fn legacy_lookup_needs_a_single_system() {
        let dir = TempDir::new().unwrap();
        let seed = FsSeed::new(dir.path().to_path_buf());
        for label in ["1111", "2222"] {
            seed.create_system_dir(label).await.unwrap();
            seed.write_system_metadata(label, &model(), &[]).await.unwrap();
        }

        let err = seed.load_system(None).await.unwrap_err();
        assert!(matches!(err, SeedError::Invalid(_)));
    }
}
