//! Local filesystem secrets backend. Each secret maps to one file under the
//! base directory; the reporter key is stored as readable hex.

use super::{SecretsError, SecretsManager, REPORTER_KEY};
use std::path::{Path, PathBuf};

/// On-disk file name of the reporter key.
const REPORTER_KEY_FILE: &str = "reporter.key";

#[derive(Debug)]
pub struct LocalSecretsManager {
    base_dir: PathBuf,
}

impl LocalSecretsManager {
    /// Create the backend, making sure the base directory exists.
    pub fn new(base_dir: &Path) -> Result<Self, SecretsError> {
        std::fs::create_dir_all(base_dir)?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
        })
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, SecretsError> {
        match name {
            REPORTER_KEY => Ok(self.base_dir.join(REPORTER_KEY_FILE)),
            other => Err(SecretsError::UnknownName(other.to_string())),
        }
    }
}

impl SecretsManager for LocalSecretsManager {
    fn get_secret(&self, name: &str) -> Result<Vec<u8>, SecretsError> {
        let path = self.path_for(name)?;
        if !path.exists() {
            return Err(SecretsError::NotFound(name.to_string()));
        }
        Ok(std::fs::read(path)?)
    }

    fn set_secret(&self, name: &str, value: &[u8]) -> Result<(), SecretsError> {
        let path = self.path_for(name)?;
        std::fs::write(path, value)?;
        Ok(())
    }

    fn has_secret(&self, name: &str) -> bool {
        self.path_for(name).map(|p| p.exists()).unwrap_or(false)
    }

    fn remove_secret(&self, name: &str) -> Result<(), SecretsError> {
        let path = self.path_for(name)?;
        if !path.exists() {
            return Err(SecretsError::NotFound(name.to_string()));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }
}
