//! P-256 identity keys and signature helpers
//!
//! Public keys travel as hex-encoded uncompressed SEC1 points, signatures as
//! 64-byte fixed-width ECDSA (r || s).

use crate::error::{EngineError, Result};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use std::path::Path;
use zeroize::Zeroizing;

/// A signing key that never leaves its owner
pub struct IdentityKey {
    key: SigningKey,
}

impl IdentityKey {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    /// Parse a big-endian scalar
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key = SigningKey::from_slice(bytes)
            .map_err(|_| EngineError::SigningFailure("invalid P-256 private key".into()))?;
        Ok(Self { key })
    }

    /// Load a hex-encoded private key file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = Zeroizing::new(
            std::fs::read_to_string(path).map_err(|e| EngineError::from_io(path, e))?,
        );
        let bytes = Zeroizing::new(hex::decode(text.trim()).map_err(|_| {
            EngineError::SigningFailure(format!("{} is not a hex private key", path.display()))
        })?);
        Self::from_bytes(&bytes)
    }

    /// Write the private key as hex. Used when provisioning CA material.
    pub fn store(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let encoded = Zeroizing::new(hex::encode(self.key.to_bytes()));
        std::fs::write(path, encoded.as_bytes()).map_err(|e| EngineError::from_io(path, e))
    }

    pub fn public_hex(&self) -> String {
        encode_public(self.key.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let sig: Signature = self
            .key
            .try_sign(message)
            .map_err(|e| EngineError::SigningFailure(e.to_string()))?;
        Ok(sig.to_bytes().to_vec())
    }
}

pub fn encode_public(key: &VerifyingKey) -> String {
    hex::encode(key.as_affine().to_encoded_point(false).as_bytes())
}

pub fn decode_public(hex_key: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(hex_key)
        .map_err(|_| EngineError::Malformed("public key is not hex".into()))?;
    VerifyingKey::from_sec1_bytes(&bytes)
        .map_err(|_| EngineError::Malformed("invalid P-256 public key".into()))
}

/// Check `signature` over `message` by `public_hex`. Any failure is `false`.
pub fn signature_valid(public_hex: &str, message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = decode_public(public_hex) else {
        return false;
    };
    let Ok(sig) = Signature::try_from(signature) else {
        return false;
    };
    key.verify(message, &sig).is_ok()
}
