//! TEE (Trusted Execution Environment): enclave sessions and remote attestation
//!
//! - **Platform**: simulated quoting hardware and vendor collateral
//! - **Attestation**: quote generation, verification and certificate issuance
//! - **Enclave**: the per-session state machine and keystore
//! - **Engine**: live-session table addressed by opaque handles
//! - **Exchange**: sharekey envelopes between attested enclaves
//! - **Sealing**: AES-GCM sealing and the on-disk frame format

pub mod attestation;
pub mod certificate;
pub mod enclave;
pub mod engine;
pub mod exchange;
pub mod identity;
pub mod platform;
pub mod sealing;

pub use attestation::{
    AttestationVerifier, CollateralFetcher, LocalCollateral, Quote, QuoteBody, VerifiedQuote,
};
pub use certificate::{Certificate, CertificateAuthority, CertificateRequest};
pub use enclave::{
    EnclaveMeasurement, EnclaveSession, SessionState, SessionStatus, SignWith, Signature,
    SignatureScheme,
};
pub use engine::{EnclaveEngine, EnclaveHandle};
pub use exchange::{ExchangeKey, KeyEnvelope};
pub use identity::IdentityKey;
pub use platform::{Collateral, PlatformCertificate, SimulatedPlatform};
pub use sealing::{Sealed, SessionKey};
