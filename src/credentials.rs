use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::error::CredentialError;

pub const CREDENTIALS_PATH: &str = "CREDENTIALS_PATH";
pub const CREDENTIALS_JSON: &str = "CREDENTIALS_JSON";

/// Makes sure the service-account file named by `CREDENTIALS_PATH` exists,
/// materializing it from `CREDENTIALS_JSON` when needed.
#[derive(Debug, Default)]
pub struct CredentialResolver {
    resolved: Mutex<Option<PathBuf>>,
}

impl CredentialResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Ok(false)` when no credential is configured. Only a failed
    /// write is an error.
    pub fn resolve(&self) -> Result<bool, CredentialError> {
        let cwd = std::env::current_dir().unwrap_or_default();
        let resolved = self.resolve_from(
            std::env::var(CREDENTIALS_PATH).ok(),
            || std::env::var(CREDENTIALS_JSON).ok(),
            &cwd,
        )?;

        match resolved {
            Some(path) => {
                std::env::set_var(CREDENTIALS_PATH, &path);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn resolve_from(
        &self,
        path_var: Option<String>,
        json_var: impl FnOnce() -> Option<String>,
        cwd: &Path,
    ) -> Result<Option<PathBuf>, CredentialError> {
        let Some(raw_path) = path_var else {
            warn!("{CREDENTIALS_PATH} is not set, no warehouse credentials configured");
            return Ok(None);
        };

        let path = absolutize(Path::new(&raw_path), cwd);

        let mut memo = self.resolved.lock().unwrap_or_else(|e| e.into_inner());
        if memo.as_deref() == Some(path.as_path()) {
            debug!(path = %path.display(), "credentials already resolved");
            return Ok(Some(path));
        }

        if !path.exists() {
            let Some(payload) = json_var() else {
                warn!(
                    path = %path.display(),
                    "credential file missing and {CREDENTIALS_JSON} is not set"
                );
                return Ok(None);
            };

            std::fs::write(&path, payload).map_err(|source| CredentialError::Write {
                path: path.display().to_string(),
                source,
            })?;
            info!(path = %path.display(), "credential file written");
        }

        *memo = Some(path.clone());
        Ok(Some(path))
    }
}

fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}
