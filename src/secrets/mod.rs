//! Secrets backend interface.
//!
//! The reporter consumes a single well-known secret: the hex-encoded
//! secp256k1 scalar stored under [`REPORTER_KEY`]. Backends implement
//! [`SecretsManager`]; the local filesystem backend ships here, and the
//! JSON backend-selection config keeps the seam open for managed stores.

pub mod local;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Well-known secret name of the reporter's private key.
pub const REPORTER_KEY: &str = "reporter-key";

#[derive(Error, Debug)]
pub enum SecretsError {
    #[error("secret not found: {0}")]
    NotFound(String),
    #[error("secret '{0}' has already been initialized")]
    AlreadyExists(String),
    #[error("unknown secret name: {0}")]
    UnknownName(String),
    #[error("invalid reporter key: {0}")]
    InvalidKey(String),
    #[error("failed to read secrets config: {0}")]
    Config(String),
    #[error("unsupported secrets manager type '{0}'")]
    UnsupportedBackend(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Base interface every secrets backend provides.
pub trait SecretsManager: Send + Sync + std::fmt::Debug {
    /// Retrieve a secret by name.
    fn get_secret(&self, name: &str) -> Result<Vec<u8>, SecretsError>;
    /// Store a secret under a name, overwriting any previous value.
    fn set_secret(&self, name: &str, value: &[u8]) -> Result<(), SecretsError>;
    /// Whether a secret with the given name is present.
    fn has_secret(&self, name: &str) -> bool;
    /// Delete a secret from the backend.
    fn remove_secret(&self, name: &str) -> Result<(), SecretsError>;
}

/// Backend kinds selectable through the secrets config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecretsManagerType {
    /// Local filesystem store rooted at the data directory.
    Local,
    /// AWS SSM parameter store. Recognized but not bundled in this build.
    AwsSsm,
}

/// Secrets-manager selection config, read from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsManagerConfig {
    #[serde(rename = "type")]
    pub kind: SecretsManagerType,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

impl SecretsManagerConfig {
    pub fn read(path: &Path) -> Result<Self, SecretsError> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| SecretsError::Config(e.to_string()))
    }
}

/// Instantiate the backend selected by `config`, defaulting to the local
/// filesystem store under `data_dir`.
pub fn new_secrets_manager(
    config: Option<&SecretsManagerConfig>,
    data_dir: &Path,
) -> Result<Box<dyn SecretsManager>, SecretsError> {
    match config.map(|c| c.kind) {
        None | Some(SecretsManagerType::Local) => {
            Ok(Box::new(local::LocalSecretsManager::new(data_dir)?))
        }
        Some(SecretsManagerType::AwsSsm) => {
            Err(SecretsError::UnsupportedBackend("aws-ssm".into()))
        }
    }
}

/// Generate a fresh reporter key, store it hex-encoded, and return the
/// derived address. Refuses to overwrite an existing key.
pub fn init_reporter_key(manager: &dyn SecretsManager) -> Result<Address, SecretsError> {
    if manager.has_secret(REPORTER_KEY) {
        return Err(SecretsError::AlreadyExists(REPORTER_KEY.into()));
    }

    let signer = PrivateKeySigner::random();
    let encoded = alloy::hex::encode(signer.to_bytes());
    manager.set_secret(REPORTER_KEY, encoded.as_bytes())?;

    Ok(signer.address())
}

/// Load the reporter address from the stored key; zero when no key exists.
pub fn load_reporter_address(manager: &dyn SecretsManager) -> Result<Address, SecretsError> {
    if !manager.has_secret(REPORTER_KEY) {
        return Ok(Address::ZERO);
    }

    let raw = manager.get_secret(REPORTER_KEY)?;
    let signer =
        crate::chain::signer_from_secret(&raw).map_err(|e| SecretsError::InvalidKey(e.to_string()))?;

    Ok(signer.address())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_config_roundtrip() {
        let json = r#"{"type": "local", "name": "reporter-1"}"#;
        let config: SecretsManagerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.kind, SecretsManagerType::Local);
        assert_eq!(config.name, "reporter-1");
    }

    #[test]
    fn test_aws_ssm_backend_is_rejected() {
        let config = SecretsManagerConfig {
            kind: SecretsManagerType::AwsSsm,
            token: String::new(),
            server_url: String::new(),
            name: String::new(),
            namespace: String::new(),
        };
        let err = new_secrets_manager(Some(&config), Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, SecretsError::UnsupportedBackend(_)));
    }
}
