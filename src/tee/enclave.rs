//! Enclave session: one isolated execution context and its keystore
//!
//! The session is a state machine:
//!
//! ```text
//! Closed -> Initializing -> Attested -> KeyEstablished -> Ready -> Closed
//! ```
//!
//! Keys never leave the session in plaintext. Everything that needs key
//! material (sealing, frame I/O, operators) runs against the session while
//! its lock is held by the engine.

use super::attestation::{build_quote, Quote};
use super::certificate::{Certificate, CertificateRequest};
use super::exchange::{self, ExchangeKey, KeyEnvelope};
use super::identity::IdentityKey;
use super::platform::SimulatedPlatform;
use super::sealing::{self, FrameSlot, Sealed, SessionKey};
use crate::config::{EnclaveConfig, StorageConfig};
use crate::error::{EngineError, Result};
use crate::storage::{EncryptedStore, OpenMode};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, Zeroizing};

/// Image measured when no enclave image path is configured
const BUILTIN_IMAGE: &[u8] = concat!("trusted-psi-enclave/", env!("CARGO_PKG_VERSION")).as_bytes();

/// Identity of the code loaded into an enclave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveMeasurement {
    /// MRENCLAVE: hash of the enclave image
    pub mrenclave: String,
    /// MRSIGNER: hash of the signer identity
    pub mrsigner: String,
    pub product_id: u16,
    pub isv_svn: u16,
    pub debug: bool,
}

impl EnclaveMeasurement {
    pub fn compute(image: &[u8], signer: &str, product_id: u16, isv_svn: u16, debug: bool) -> Self {
        let mrenclave = {
            let mut h = Sha256::new();
            h.update(image);
            h.update(b"mrenclave-v1");
            hex::encode(h.finalize())
        };
        let mrsigner = {
            let mut h = Sha256::new();
            h.update(signer.as_bytes());
            h.update(b"mrsigner-v1");
            hex::encode(h.finalize())
        };
        Self {
            mrenclave,
            mrsigner,
            product_id,
            isv_svn,
            debug,
        }
    }

    /// Measure the image an `EnclaveConfig` points at
    pub fn for_config(config: &EnclaveConfig) -> Result<Self> {
        let image = match &config.image_path {
            Some(path) => std::fs::read(path).map_err(|e| {
                EngineError::EnclaveLoadFailure(format!("{}: {}", path.display(), e))
            })?,
            None => BUILTIN_IMAGE.to_vec(),
        };
        if image.is_empty() {
            return Err(EngineError::EnclaveLoadFailure("enclave image is empty".into()));
        }
        Ok(Self::compute(
            &image,
            &config.signer,
            config.product_id,
            config.isv_svn,
            config.debug,
        ))
    }
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionState {
    Closed,
    Initializing,
    Attested,
    KeyEstablished,
    Ready,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Closed => "Closed",
            SessionState::Initializing => "Initializing",
            SessionState::Attested => "Attested",
            SessionState::KeyEstablished => "KeyEstablished",
            SessionState::Ready => "Ready",
        };
        f.write_str(name)
    }
}

/// Which key signs a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignWith {
    /// The enclave identity key (ECDSA P-256)
    Enclave,
    /// A session key slot (HMAC-SHA256)
    SessionKey(String),
    /// A hex private key file on disk (ECDSA P-256), read only to sign
    KeyFile(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureScheme {
    EcdsaP256,
    HmacSha256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub scheme: SignatureScheme,
    pub bytes: Vec<u8>,
}

/// Snapshot of a session for introspection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub state: SessionState,
    pub measurement: EnclaveMeasurement,
    pub key_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub signing_key: String,
    pub exchange_key: String,
}

/// One enclave and its keystore
pub struct EnclaveSession {
    id: String,
    state: SessionState,
    measurement: EnclaveMeasurement,
    identity: IdentityKey,
    exchange: ExchangeKey,
    keys: HashMap<String, SessionKey>,
    trusted_ca: Option<String>,
    last_quote: Option<String>,
    chunk_size: usize,
    created_at: DateTime<Utc>,
}

impl EnclaveSession {
    /// Load and measure the enclave image. `Closed -> Initializing`.
    pub fn open(config: &EnclaveConfig, storage: &StorageConfig) -> Result<Self> {
        let measurement = EnclaveMeasurement::for_config(config)?;
        let id = uuid::Uuid::new_v4().to_string();

        log::info!(
            "Enclave session opened: id={}, mrenclave={}..",
            &id[..8],
            &measurement.mrenclave[..16]
        );

        Ok(Self {
            id,
            state: SessionState::Initializing,
            measurement,
            identity: IdentityKey::generate(),
            exchange: ExchangeKey::generate(),
            keys: HashMap::new(),
            trusted_ca: config.trusted_ca_key.clone(),
            last_quote: None,
            chunk_size: storage.chunk_size.max(1),
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn measurement(&self) -> &EnclaveMeasurement {
        &self.measurement
    }

    pub fn status(&self) -> SessionStatus {
        let mut key_ids: Vec<String> = self
            .keys
            .iter()
            .filter(|(_, key)| !key.is_cleared())
            .map(|(id, _)| id.clone())
            .collect();
        key_ids.sort();
        SessionStatus {
            session_id: self.id.clone(),
            state: self.state,
            measurement: self.measurement.clone(),
            key_ids,
            created_at: self.created_at,
            signing_key: self.identity.public_hex(),
            exchange_key: self.exchange.public_hex(),
        }
    }

    /// Hardware quote binding `nonce`. `Initializing -> Attested`.
    pub fn generate_quote(&mut self, platform: &SimulatedPlatform, nonce: &[u8]) -> Result<Quote> {
        self.require_open()?;
        let quote = build_quote(
            platform,
            &self.measurement,
            nonce,
            self.identity.public_hex(),
            self.exchange.public_hex(),
        )
        .and_then(|q| q.digest().map(|d| (q, d)));
        let (quote, digest) = match quote {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("Quote generation failed in session {}: {}", &self.id[..8], e);
                self.close();
                return Err(EngineError::AttestationFailure(e.to_string()));
            }
        };
        self.last_quote = Some(digest);
        if self.state == SessionState::Initializing {
            self.state = SessionState::Attested;
        }
        Ok(quote)
    }

    /// Signing request for the keys attested by the latest quote
    pub fn create_csr(&self, subject: &str) -> Result<CertificateRequest> {
        self.require_attested("create_csr")?;
        let digest = self
            .last_quote
            .clone()
            .ok_or_else(|| self.not_ready("create_csr"))?;
        CertificateRequest::new_signed(subject, &self.identity, self.exchange.public_hex(), digest)
    }

    /// Create a fresh sharekey inside the enclave under `key_id`
    pub fn generate_key(&mut self, key_id: &str) -> Result<()> {
        self.require_attested("generate_key")?;
        self.install_key(key_id, SessionKey::generate());
        Ok(())
    }

    /// Export `key_id` wrapped for a certified recipient
    pub fn wrap_key_for(&mut self, key_id: &str, recipient: &Certificate) -> Result<KeyEnvelope> {
        let ca = self.trusted_ca()?;
        recipient
            .verify(&ca, Utc::now())
            .map_err(|e| EngineError::KeyExchangeFailure(format!("recipient: {}", e)))?;
        let key = self.key(key_id)?;
        let envelope = exchange::wrap_key(key, key_id, recipient, &self.identity)?;
        self.mark_used();
        Ok(envelope)
    }

    /// Unwrap a counterparty's sharekey under `key_id`.
    /// `Attested -> KeyEstablished`; independent per key id.
    pub fn establish_key(
        &mut self,
        key_id: &str,
        counterparty: &Certificate,
        envelope: &KeyEnvelope,
    ) -> Result<()> {
        self.require_attested("establish_key")?;
        if envelope.key_id != key_id {
            return Err(EngineError::KeyExchangeFailure(format!(
                "envelope carries key '{}', expected '{}'",
                envelope.key_id, key_id
            )));
        }
        let ca = self.trusted_ca()?;
        counterparty
            .verify(&ca, Utc::now())
            .map_err(|e| EngineError::KeyExchangeFailure(format!("counterparty: {}", e)))?;
        let key = exchange::unwrap_key(envelope, &self.exchange, counterparty)?;
        self.install_key(key_id, key);
        log::info!(
            "Session {} established key '{}' with '{}'",
            &self.id[..8],
            key_id,
            counterparty.subject
        );
        Ok(())
    }

    pub fn sign(&mut self, with: &SignWith, message: &[u8]) -> Result<Signature> {
        match with {
            SignWith::Enclave => {
                self.require_open()?;
                Ok(Signature {
                    scheme: SignatureScheme::EcdsaP256,
                    bytes: self.identity.sign(message)?,
                })
            }
            SignWith::KeyFile(path) => {
                self.require_open()?;
                let key = IdentityKey::load(path)?;
                Ok(Signature {
                    scheme: SignatureScheme::EcdsaP256,
                    bytes: key.sign(message)?,
                })
            }
            SignWith::SessionKey(key_id) => {
                let key = self.key(key_id)?;
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key.as_bytes())
                    .map_err(|e| EngineError::SigningFailure(e.to_string()))?;
                mac.update(message);
                let bytes = mac.finalize().into_bytes().to_vec();
                self.mark_used();
                Ok(Signature {
                    scheme: SignatureScheme::HmacSha256,
                    bytes,
                })
            }
        }
    }

    pub fn encrypt(&mut self, key_id: &str, plaintext: &[u8]) -> Result<Sealed> {
        let sealed = sealing::seal(self.key(key_id)?, plaintext, key_id.as_bytes())?;
        self.mark_used();
        Ok(sealed)
    }

    /// Fails closed on tag mismatch; the session stays usable.
    pub fn decrypt(&mut self, key_id: &str, sealed: &Sealed) -> Result<Zeroizing<Vec<u8>>> {
        let plain = sealing::open(self.key(key_id)?, sealed, key_id.as_bytes())?;
        self.mark_used();
        Ok(plain)
    }

    /// Seal `plaintext` as one self-contained final frame at `offset` of `filename`
    pub fn encrypt_at(
        &mut self,
        store: &EncryptedStore,
        key_id: &str,
        filename: impl AsRef<Path>,
        offset: u64,
        plaintext: &[u8],
    ) -> Result<usize> {
        let key = self.key(key_id)?;
        let name = frame_name(filename.as_ref());
        let mut handle = store.open(filename, OpenMode::Update)?;
        let slot = FrameSlot::new(key_id, &name, offset);
        let written = sealing::write_frame(&mut handle, key, slot, plaintext, true)?;
        handle.close()?;
        self.mark_used();
        Ok(written)
    }

    /// Open the frame at `offset` of `filename`. Returns plaintext and frame length.
    pub fn decrypt_at(
        &mut self,
        store: &EncryptedStore,
        key_id: &str,
        filename: impl AsRef<Path>,
        offset: u64,
    ) -> Result<(Zeroizing<Vec<u8>>, usize)> {
        let key = self.key(key_id)?;
        let name = frame_name(filename.as_ref());
        let mut handle = store.open(filename, OpenMode::Read)?;
        let frame = sealing::read_frame(&mut handle, key, FrameSlot::new(key_id, &name, offset))?;
        handle.close()?;
        self.mark_used();
        Ok((frame.plaintext, frame.frame_len))
    }

    /// Seal `data` into `destination` as consecutive frames. Returns bytes written.
    pub fn seal_bytes(
        &mut self,
        store: &EncryptedStore,
        key_id: &str,
        destination: impl AsRef<Path>,
        data: &[u8],
    ) -> Result<u64> {
        let key = self.key(key_id)?;
        let name = frame_name(destination.as_ref());
        let mut handle = store.open(destination, OpenMode::Write)?;
        let written = sealing::write_stream(&mut handle, key, key_id, &name, data, self.chunk_size)?;
        handle.close()?;
        self.mark_used();
        Ok(written)
    }

    /// Read a plaintext file from the store and seal it into `destination`
    pub fn seal_file(
        &mut self,
        store: &EncryptedStore,
        key_id: &str,
        source: impl AsRef<Path>,
        destination: impl AsRef<Path>,
    ) -> Result<u64> {
        self.key(key_id)?;
        let data = Zeroizing::new(store.read_all(source)?);
        self.seal_bytes(store, key_id, destination, &data)
    }

    /// Open every frame of a file written by `seal_bytes` and concatenate the
    /// plaintext. A file cut short or with bytes appended is `Malformed`.
    pub fn open_sealed_frames(
        &mut self,
        store: &EncryptedStore,
        key_id: &str,
        source: impl AsRef<Path>,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let key = self.key(key_id)?;
        let name = frame_name(source.as_ref());
        let mut handle = store.open(source, OpenMode::Read)?;
        let out = sealing::read_stream(&mut handle, key, key_id, &name)?;
        handle.close()?;
        self.mark_used();
        Ok(out)
    }

    /// Wipe all keys and release the enclave. Returns how many keys were
    /// wiped; closing again wipes nothing and returns 0.
    ///
    /// The wiped slots stay allocated until the session is dropped.
    pub fn close(&mut self) -> usize {
        if self.state == SessionState::Closed {
            return 0;
        }
        let mut wiped = 0;
        for key in self.keys.values_mut() {
            if !key.is_cleared() {
                key.zeroize();
                wiped += 1;
            }
        }
        self.last_quote = None;
        self.state = SessionState::Closed;
        log::info!("Enclave session {} closed, {} keys wiped", &self.id[..8], wiped);
        wiped
    }

    /// True when every key slot holds only zeroes
    pub fn keys_cleared(&self) -> bool {
        self.keys.values().all(SessionKey::is_cleared)
    }

    /// Number of key slots, wiped or not
    pub fn key_slots(&self) -> usize {
        self.keys.len()
    }

    // --- internal helpers ---

    fn install_key(&mut self, key_id: &str, key: SessionKey) {
        if let Some(mut old) = self.keys.insert(key_id.to_string(), key) {
            old.zeroize();
        }
        if self.state == SessionState::Attested {
            self.state = SessionState::KeyEstablished;
        }
    }

    fn key(&self, key_id: &str) -> Result<&SessionKey> {
        match self.state {
            SessionState::Closed => Err(EngineError::SessionClosed),
            SessionState::Initializing | SessionState::Attested => Err(self.not_ready("key access")),
            SessionState::KeyEstablished | SessionState::Ready => self
                .keys
                .get(key_id)
                .ok_or_else(|| EngineError::UnknownKey(key_id.to_string())),
        }
    }

    fn mark_used(&mut self) {
        if self.state == SessionState::KeyEstablished {
            self.state = SessionState::Ready;
        }
    }

    fn trusted_ca(&self) -> Result<String> {
        self.trusted_ca.clone().ok_or_else(|| {
            EngineError::KeyExchangeFailure("no trusted CA configured for this enclave".into())
        })
    }

    fn require_open(&self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(EngineError::SessionClosed);
        }
        Ok(())
    }

    fn require_attested(&self, op: &'static str) -> Result<()> {
        match self.state {
            SessionState::Closed => Err(EngineError::SessionClosed),
            SessionState::Initializing => Err(self.not_ready(op)),
            _ => Ok(()),
        }
    }

    fn not_ready(&self, op: &'static str) -> EngineError {
        EngineError::NotReady {
            op,
            state: self.state.to_string(),
        }
    }
}

/// Name a frame is bound to: the path as the caller gave it
fn frame_name(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl Drop for EnclaveSession {
    fn drop(&mut self) {
        self.close();
    }
}
