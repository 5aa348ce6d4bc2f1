use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;

use dl_core::ports::{SecbootError, SecbootPort};

/// Checks that a TPM resource manager device is present and usable.
pub struct TpmProbe {
    device: PathBuf,
}

impl TpmProbe {
    pub fn new(device: PathBuf) -> Self {
        Self { device }
    }
}

#[async_trait]
impl SecbootPort for TpmProbe {
    async fn check_tpm_sealing_supported(&self) -> Result<(), SecbootError> {
        let meta = match fs::metadata(&self.device).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SecbootError::Unavailable(format!(
                    "no {}",
                    self.device.display()
                )))
            }
            Err(e) => {
                return Err(SecbootError::Unavailable(format!(
                    "cannot access {}: {e}",
                    self.device.display()
                )))
            }
        };
        if !is_char_device(&meta) {
            return Err(SecbootError::Unsupported(format!(
                "{} is not a character device",
                self.device.display()
            )));
        }
        fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.device)
            .await
            .map_err(|e| SecbootError::Unsupported(format!("cannot open {}: {e}", self.device.display())))?;
        Ok(())
    }
}

#[cfg(unix)]
fn is_char_device(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_char_device()
}

#[cfg(not(unix))]
fn is_char_device(_meta: &std::fs::Metadata) -> bool {
    false
}
