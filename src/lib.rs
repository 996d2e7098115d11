//! Trusted PSI: attested enclave sessions for two-party private set intersection
//!
//! Parties attest an enclave, exchange sharekeys with it over certified
//! channels, upload sealed datasets, and receive a sealed intersection. Only
//! matching records ever leave the enclave, and only under the owning party's
//! key.

pub mod config;
pub mod error;
pub mod operator;
pub mod storage;
pub mod tee;

pub use config::EngineConfig;
pub use error::{EngineError, ErrorKind, Result};
pub use operator::{AllowAll, AllowList, DatasetAuthFilter, Operator, OperatorRegistry};
pub use storage::{EncryptedStore, FileHandle, OpenMode};
pub use tee::{AttestationVerifier, EnclaveEngine, EnclaveHandle};
