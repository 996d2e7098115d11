//! Engine errors
//!
//! One error enum for the whole crate. Every variant belongs to exactly one
//! [`ErrorKind`], which is what callers match on to decide between retrying,
//! re-attesting, re-uploading or aborting.

use crate::tee::EnclaveHandle;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Coarse failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Unsupported operator, bad party count, invalid settings. Never retried.
    Configuration,
    /// Bad quote, untrusted measurement, expired collateral. Fatal to the session.
    Attestation,
    /// Tag mismatch, signing failure. Fatal to the call only.
    Crypto,
    /// Storage or transport failure. The caller may retry with backoff.
    Io,
    /// Operation invoked in the wrong session state.
    State,
    /// Caller-supplied data is malformed.
    Input,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // --- configuration ---
    #[error("unsupported operator: {name} with {parties} parties")]
    UnsupportedOperator { name: String, parties: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("enclave load failure: {0}")]
    EnclaveLoadFailure(String),

    #[error("operator init failed: {0}")]
    InitFailure(String),

    #[error("access denied: {owner} may not {action} {dataset}")]
    AccessDenied {
        dataset: String,
        owner: String,
        action: &'static str,
    },

    // --- attestation ---
    #[error("bad quote: {0}")]
    BadQuote(String),

    #[error("untrusted enclave: {0}")]
    UntrustedEnclave(String),

    #[error("expired collateral: {0}")]
    ExpiredCollateral(String),

    #[error("attestation failure: {0}")]
    AttestationFailure(String),

    #[error("invalid certificate signing request: {0}")]
    InvalidCsr(String),

    #[error("certificate rejected: {0}")]
    CertificateRejected(String),

    // --- crypto ---
    #[error("authentication failure: ciphertext or tag was modified")]
    AuthenticationFailure,

    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    #[error("signing failure: {0}")]
    SigningFailure(String),

    #[error("key exchange failure: {0}")]
    KeyExchangeFailure(String),

    // --- io ---
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("offset {offset} out of range for {size} byte file")]
    OutOfRange { offset: u64, size: u64 },

    #[error("storage full: {0}")]
    StorageFull(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("io error on {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // --- state ---
    #[error("{op} not allowed in state {state}")]
    NotReady { op: &'static str, state: String },

    #[error("no live enclave session for handle {0}")]
    InvalidHandle(EnclaveHandle),

    #[error("enclave session is closed")]
    SessionClosed,

    #[error("no key established under id '{0}'")]
    UnknownKey(String),

    #[error("operator must be initialised before run")]
    InitRequired,

    #[error("file handle is closed")]
    HandleClosed,

    // --- input ---
    #[error("input mismatch: {0}")]
    InputMismatch(String),

    #[error("malformed data: {0}")]
    Malformed(String),

    // --- wrapper ---
    #[error("operator {operator} failed: {source}")]
    RunFailure {
        operator: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        use EngineError::*;
        match self {
            UnsupportedOperator { .. }
            | InvalidConfig(_)
            | EnclaveLoadFailure(_)
            | InitFailure(_)
            | AccessDenied { .. } => ErrorKind::Configuration,
            BadQuote(_)
            | UntrustedEnclave(_)
            | ExpiredCollateral(_)
            | AttestationFailure(_)
            | InvalidCsr(_)
            | CertificateRejected(_) => ErrorKind::Attestation,
            AuthenticationFailure | CryptoFailure(_) | SigningFailure(_) | KeyExchangeFailure(_) => {
                ErrorKind::Crypto
            }
            NotFound(_)
            | PermissionDenied(_)
            | OutOfRange { .. }
            | StorageFull(_)
            | NetworkError(_)
            | Io { .. } => ErrorKind::Io,
            NotReady { .. }
            | InvalidHandle(_)
            | SessionClosed
            | UnknownKey(_)
            | InitRequired
            | HandleClosed => ErrorKind::State,
            InputMismatch(_) | Malformed(_) => ErrorKind::Input,
            RunFailure { source, .. } => source.kind(),
        }
    }

    /// Only storage and transport failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Io
    }

    /// Map an `std::io::Error` on `path` to the matching storage variant.
    pub fn from_io(path: &Path, err: std::io::Error) -> Self {
        let shown = path.display().to_string();
        match err.kind() {
            std::io::ErrorKind::NotFound => EngineError::NotFound(shown),
            std::io::ErrorKind::PermissionDenied => EngineError::PermissionDenied(shown),
            std::io::ErrorKind::StorageFull => EngineError::StorageFull(shown),
            _ => EngineError::Io {
                context: shown,
                source: err,
            },
        }
    }

    pub(crate) fn run_failure(operator: &str, source: EngineError) -> Self {
        match source {
            already @ EngineError::RunFailure { .. } => already,
            other => EngineError::RunFailure {
                operator: operator.to_string(),
                source: Box::new(other),
            },
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Malformed(err.to_string())
    }
}
