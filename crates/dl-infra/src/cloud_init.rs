//! cloud-init restriction through configuration drop-ins.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use dl_core::model::Grade;
use dl_core::ports::{CloudInitError, CloudInitPort, CloudInitRestriction};

const DISABLED_MARKER: &str = "cloud-init.disabled";
const RESTRICT_FILE: &str = "zzzz_devicelife.cfg";

const RESTRICT_CONFIG: &str = "\
# written by devicelife: only local datasources after the first boot
datasource_list: [NoCloud, None]
manual_cache_clean: true
";

/// Secured models get cloud-init disabled; other grades keep it with
/// local datasources only.
pub struct FsCloudInit {
    dir: PathBuf,
}

impl FsCloudInit {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

fn failed(e: std::io::Error) -> CloudInitError {
    CloudInitError::Failed(e.to_string())
}

#[async_trait]
impl CloudInitPort for FsCloudInit {
    async fn restrict(&self, grade: Grade) -> Result<CloudInitRestriction, CloudInitError> {
        let disabled = self.dir.join(DISABLED_MARKER);
        let restricted = self.dir.join(RESTRICT_FILE);
        if fs::try_exists(&disabled).await.map_err(failed)?
            || fs::try_exists(&restricted).await.map_err(failed)?
        {
            debug!(dir = %self.dir.display(), "cloud-init already restricted");
            return Ok(CloudInitRestriction::AlreadyRestricted);
        }

        fs::create_dir_all(&self.dir).await.map_err(failed)?;
        if grade == Grade::Secured {
            fs::write(&disabled, b"").await.map_err(failed)?;
            return Ok(CloudInitRestriction::Disabled);
        }
        fs::write(&restricted, RESTRICT_CONFIG).await.map_err(failed)?;
        Ok(CloudInitRestriction::Restricted)
    }
}
