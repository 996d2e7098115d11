//! Enclave engine: the live-session table behind opaque handles
//!
//! Callers never hold an `EnclaveSession` directly. `open` returns an
//! [`EnclaveHandle`]; every other call looks the handle up in the live table
//! and runs against the session under its own mutex, so one session executes
//! one call at a time while independent sessions run in parallel.

use super::attestation::Quote;
use super::certificate::{Certificate, CertificateRequest};
use super::enclave::{EnclaveSession, SessionStatus, SignWith, Signature};
use super::exchange::KeyEnvelope;
use super::platform::SimulatedPlatform;
use super::sealing::Sealed;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::storage::EncryptedStore;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use zeroize::Zeroizing;

/// Opaque name of a live enclave session. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnclaveHandle(u64);

impl EnclaveHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EnclaveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "enclave#{}", self.0)
    }
}

type SharedSession = Arc<Mutex<EnclaveSession>>;

pub struct EnclaveEngine {
    config: EngineConfig,
    platform: Arc<SimulatedPlatform>,
    store: EncryptedStore,
    sessions: RwLock<HashMap<EnclaveHandle, SharedSession>>,
    next_handle: AtomicU64,
}

impl EnclaveEngine {
    pub fn new(config: EngineConfig, platform: Arc<SimulatedPlatform>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            platform,
            store: EncryptedStore::new(),
            sessions: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    /// Resolve relative file names against `store`'s root
    pub fn with_store(mut self, store: EncryptedStore) -> Self {
        self.store = store;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &EncryptedStore {
        &self.store
    }

    pub fn platform(&self) -> &Arc<SimulatedPlatform> {
        &self.platform
    }

    /// Load and measure a new enclave
    pub fn open(&self) -> Result<EnclaveHandle> {
        let session = EnclaveSession::open(&self.config.enclave, &self.config.storage)?;
        let handle = EnclaveHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.sessions
            .write()
            .insert(handle, Arc::new(Mutex::new(session)));
        log::debug!("Registered {}", handle);
        Ok(handle)
    }

    fn session(&self, handle: EnclaveHandle) -> Result<SharedSession> {
        self.sessions
            .read()
            .get(&handle)
            .cloned()
            .ok_or(EngineError::InvalidHandle(handle))
    }

    /// Run `f` against the live session named by `handle`
    pub(crate) fn enter<T>(
        &self,
        handle: EnclaveHandle,
        f: impl FnOnce(&mut EnclaveSession) -> Result<T>,
    ) -> Result<T> {
        let session = self.session(handle)?;
        let mut guard = session.lock();
        f(&mut guard)
    }

    pub fn generate_quote(&self, handle: EnclaveHandle, nonce: &[u8]) -> Result<Quote> {
        let platform = self.platform.clone();
        self.enter(handle, |s| s.generate_quote(&platform, nonce))
    }

    pub fn create_csr(&self, handle: EnclaveHandle, subject: &str) -> Result<CertificateRequest> {
        self.enter(handle, |s| s.create_csr(subject))
    }

    pub fn generate_key(&self, handle: EnclaveHandle, key_id: &str) -> Result<()> {
        self.enter(handle, |s| s.generate_key(key_id))
    }

    pub fn wrap_key_for(
        &self,
        handle: EnclaveHandle,
        key_id: &str,
        recipient: &Certificate,
    ) -> Result<KeyEnvelope> {
        self.enter(handle, |s| s.wrap_key_for(key_id, recipient))
    }

    pub fn establish_key(
        &self,
        handle: EnclaveHandle,
        key_id: &str,
        counterparty: &Certificate,
        envelope: &KeyEnvelope,
    ) -> Result<()> {
        self.enter(handle, |s| s.establish_key(key_id, counterparty, envelope))
    }

    pub fn sign(&self, handle: EnclaveHandle, with: &SignWith, message: &[u8]) -> Result<Signature> {
        self.enter(handle, |s| s.sign(with, message))
    }

    pub fn encrypt(&self, handle: EnclaveHandle, key_id: &str, plaintext: &[u8]) -> Result<Sealed> {
        self.enter(handle, |s| s.encrypt(key_id, plaintext))
    }

    pub fn decrypt(
        &self,
        handle: EnclaveHandle,
        key_id: &str,
        sealed: &Sealed,
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.enter(handle, |s| s.decrypt(key_id, sealed))
    }

    pub fn encrypt_at(
        &self,
        handle: EnclaveHandle,
        key_id: &str,
        filename: impl AsRef<Path>,
        offset: u64,
        plaintext: &[u8],
    ) -> Result<usize> {
        self.enter(handle, |s| {
            s.encrypt_at(&self.store, key_id, filename, offset, plaintext)
        })
    }

    pub fn decrypt_at(
        &self,
        handle: EnclaveHandle,
        key_id: &str,
        filename: impl AsRef<Path>,
        offset: u64,
    ) -> Result<(Zeroizing<Vec<u8>>, usize)> {
        self.enter(handle, |s| s.decrypt_at(&self.store, key_id, filename, offset))
    }

    /// Seal a plaintext file into consecutive frames
    pub fn seal_file(
        &self,
        handle: EnclaveHandle,
        key_id: &str,
        source: impl AsRef<Path>,
        destination: impl AsRef<Path>,
    ) -> Result<u64> {
        self.enter(handle, |s| {
            s.seal_file(&self.store, key_id, source, destination)
        })
    }

    /// Seal in-memory bytes into consecutive frames
    pub fn seal_bytes(
        &self,
        handle: EnclaveHandle,
        key_id: &str,
        destination: impl AsRef<Path>,
        data: &[u8],
    ) -> Result<u64> {
        self.enter(handle, |s| s.seal_bytes(&self.store, key_id, destination, data))
    }

    pub fn open_sealed_frames(
        &self,
        handle: EnclaveHandle,
        key_id: &str,
        source: impl AsRef<Path>,
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.enter(handle, |s| s.open_sealed_frames(&self.store, key_id, source))
    }

    pub fn status(&self, handle: EnclaveHandle) -> Result<SessionStatus> {
        self.enter(handle, |s| Ok(s.status()))
    }

    /// Zeroize the session's keys and drop it from the live table. Returns
    /// the number of keys wiped.
    ///
    /// Closing an unknown or already closed handle is a no-op returning 0.
    pub fn close(&self, handle: EnclaveHandle) -> usize {
        let removed = self.sessions.write().remove(&handle);
        match removed {
            Some(session) => {
                let wiped = session.lock().close();
                log::debug!("Released {}", handle);
                wiped
            }
            None => 0,
        }
    }

    pub fn live_sessions(&self) -> Vec<EnclaveHandle> {
        let mut handles: Vec<EnclaveHandle> = self.sessions.read().keys().copied().collect();
        handles.sort();
        handles
    }

    /// Close every live session
    pub fn shutdown(&self) {
        let drained: Vec<(EnclaveHandle, SharedSession)> =
            self.sessions.write().drain().collect();
        let count = drained.len();
        for (_, session) in drained {
            session.lock().close();
        }
        log::info!("Enclave engine shut down ({} sessions closed)", count);
    }
}

impl Drop for EnclaveEngine {
    fn drop(&mut self) {
        for session in self.sessions.get_mut().values() {
            session.lock().close();
        }
    }
}
