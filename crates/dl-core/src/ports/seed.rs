use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::model::ModelAssertion;
use crate::seed::{SeedSnap, SeedSystem};

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("seed system {0:?} not found")]
    NotFound(String),

    #[error("recovery system {0:?} already exists")]
    AlreadyExists(String),

    #[error("invalid seed: {0}")]
    Invalid(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read access to seed systems.
#[async_trait]
pub trait SeedPort: Send + Sync {
    /// Loads a labelled system, or the only system of a legacy seed when
    /// `label` is `None`.
    async fn load_system(&self, label: Option<&str>) -> Result<SeedSystem, SeedError>;

    async fn list_systems(&self) -> Result<Vec<String>, SeedError>;
}

/// Write access used to create and remove recovery systems.
///
/// Writes are split into individual file operations so that callers can
/// log each new file before it is written.
#[async_trait]
pub trait SeedWriterPort: Send + Sync {
    fn system_dir(&self, label: &str) -> PathBuf;

    /// Where a snap file lives in the shared seed snaps directory.
    fn snap_path(&self, name: &str, revision: &str) -> PathBuf;

    async fn exists(&self, path: &Path) -> Result<bool, SeedError>;

    /// Creates the system directory, failing if it already exists.
    async fn create_system_dir(&self, label: &str) -> Result<PathBuf, SeedError>;

    /// Appends one line to a log file, flushing it to disk.
    async fn append_log(&self, log: &Path, line: &str) -> Result<(), SeedError>;

    /// Reads a log file; a missing file reads as empty.
    async fn read_log(&self, log: &Path) -> Result<String, SeedError>;

    async fn copy_snap(&self, from: &Path, to: &Path) -> Result<(), SeedError>;

    /// Writes the model and snap list of a system into its directory.
    async fn write_system_metadata(
        &self,
        label: &str,
        model: &ModelAssertion,
        snaps: &[SeedSnap],
    ) -> Result<(), SeedError>;

    /// Removes a file; a missing file is not an error.
    async fn remove_file(&self, path: &Path) -> Result<(), SeedError>;

    /// Removes a directory tree; a missing directory is not an error.
    async fn remove_dir_all(&self, dir: &Path) -> Result<(), SeedError>;
}
