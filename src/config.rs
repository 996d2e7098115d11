//! Engine configuration
//!
//! Plain serde structs with sensible defaults. A config file only needs the
//! fields it wants to override; everything else falls back to `Default`.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub enclave: EnclaveConfig,
    pub verifier: VerifierConfig,
    pub storage: StorageConfig,
}

/// How enclave sessions are loaded and measured
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnclaveConfig {
    /// Enclave image to measure. `None` uses the built-in image.
    pub image_path: Option<PathBuf>,
    /// Identity of the image signer (hashed into MRSIGNER)
    pub signer: String,
    pub product_id: u16,
    pub isv_svn: u16,
    /// Debug enclaves are measured with the debug attribute set
    pub debug: bool,
    /// Hex SEC1 public key of the CA whose certificates sessions accept
    pub trusted_ca_key: Option<String>,
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        Self {
            image_path: None,
            signer: "trusted-psi-signer-v1".into(),
            product_id: 1,
            isv_svn: 1,
            debug: false,
            trusted_ca_key: None,
        }
    }
}

/// Relying-party policy for quote verification and certificate issuance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Where the vendor collateral document is fetched from
    pub collateral_url: String,
    /// Allowed MRENCLAVE values (hex). Must not be empty in production.
    pub allowed_measurements: Vec<String>,
    /// Allowed MRSIGNER values (hex, empty = any signer)
    pub allowed_signers: Vec<String>,
    pub min_isv_svn: u16,
    pub max_quote_age_secs: i64,
    pub certificate_validity_days: i64,
    /// Accept enclaves built with the debug attribute
    pub allow_debug: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            collateral_url: "https://collateral.local/v1/root".into(),
            allowed_measurements: Vec::new(),
            allowed_signers: Vec::new(),
            min_isv_svn: 1,
            max_quote_age_secs: 300,
            certificate_validity_days: 30,
            allow_debug: false,
        }
    }
}

/// Sealed file layout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Plaintext bytes per sealed frame when streaming whole files
    pub chunk_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { chunk_size: 64 * 1024 }
    }
}

impl EngineConfig {
    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| EngineError::from_io(path, e))?;
        let config: EngineConfig = serde_json::from_str(&json)
            .map_err(|e| EngineError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        log::info!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| EngineError::from_io(path, e))
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.chunk_size == 0 {
            return Err(EngineError::InvalidConfig("storage.chunk_size must be > 0".into()));
        }
        if self.verifier.certificate_validity_days <= 0 {
            return Err(EngineError::InvalidConfig(
                "verifier.certificate_validity_days must be > 0".into(),
            ));
        }
        if self.verifier.max_quote_age_secs <= 0 {
            return Err(EngineError::InvalidConfig(
                "verifier.max_quote_age_secs must be > 0".into(),
            ));
        }
        if let Some(key) = &self.enclave.trusted_ca_key {
            hex::decode(key).map_err(|e| {
                EngineError::InvalidConfig(format!("enclave.trusted_ca_key is not hex: {}", e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.chunk_size, 64 * 1024);
        assert!(config.enclave.image_path.is_none());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "storage": { "chunk_size": 16 } }"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.storage.chunk_size, 16);
        assert_eq!(config.verifier.min_isv_svn, 1);
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let mut config = EngineConfig::default();
        config.verifier.allowed_measurements.push("ab".repeat(32));
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.verifier.allowed_measurements, config.verifier.allowed_measurements);
    }

    #[test]
    fn test_rejects_zero_chunk() {
        let mut config = EngineConfig::default();
        config.storage.chunk_size = 0;
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
