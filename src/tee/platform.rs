//! Simulated quoting platform
//!
//! Stands in for the hardware that signs quotes. A vendor root key certifies
//! a per-platform attestation key (the PCK); the PCK signs quote bodies. The
//! vendor publishes collateral (root key, revocations, next update) that
//! verifiers fetch over the network.

use super::identity::{signature_valid, IdentityKey};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Vendor statement binding a PCK to a platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCertificate {
    pub platform_id: String,
    /// Hex SEC1 public key of the platform attestation key
    pub pck_key: String,
    /// Vendor root signature over `platform_id || pck_key` (hex)
    pub signature: String,
}

impl PlatformCertificate {
    fn tbs(platform_id: &str, pck_key: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(platform_id.len() + pck_key.len() + 16);
        out.extend_from_slice(b"pck-cert-v1");
        out.extend_from_slice(platform_id.as_bytes());
        out.push(0);
        out.extend_from_slice(pck_key.as_bytes());
        out
    }

    /// Check the vendor root signature
    pub fn verify(&self, root_key: &str) -> bool {
        let Ok(sig) = hex::decode(&self.signature) else {
            return false;
        };
        signature_valid(
            root_key,
            &Self::tbs(&self.platform_id, &self.pck_key),
            &sig,
        )
    }
}

/// Vendor collateral document served to verifiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collateral {
    pub root_public_key: String,
    pub issued_at: DateTime<Utc>,
    pub next_update: DateTime<Utc>,
    #[serde(default)]
    pub revoked_platforms: Vec<String>,
}

impl Collateral {
    /// Parse a fetched collateral body (JSON key/value document)
    pub fn parse(body: &str) -> Result<Self> {
        serde_json::from_str(body)
            .map_err(|e| EngineError::AttestationFailure(format!("unreadable collateral: {}", e)))
    }

    pub fn render(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.next_update
    }

    pub fn is_revoked(&self, platform_id: &str) -> bool {
        self.revoked_platforms.iter().any(|p| p == platform_id)
    }
}

/// Software model of quoting hardware
pub struct SimulatedPlatform {
    root: IdentityKey,
    pck: IdentityKey,
    certificate: PlatformCertificate,
    collateral_lifetime: Duration,
    revoked: Vec<String>,
}

impl SimulatedPlatform {
    pub fn new() -> Result<Self> {
        let root = IdentityKey::generate();
        let pck = IdentityKey::generate();
        let platform_id = uuid::Uuid::new_v4().to_string();
        let pck_key = pck.public_hex();
        let signature = hex::encode(root.sign(&PlatformCertificate::tbs(&platform_id, &pck_key))?);

        log::info!("Simulated quoting platform ready: id={}", &platform_id[..8]);

        Ok(Self {
            root,
            pck,
            certificate: PlatformCertificate {
                platform_id,
                pck_key,
                signature,
            },
            collateral_lifetime: Duration::days(30),
            revoked: Vec::new(),
        })
    }

    /// How long published collateral stays valid (negative = already stale)
    pub fn with_collateral_lifetime(mut self, lifetime: Duration) -> Self {
        self.collateral_lifetime = lifetime;
        self
    }

    /// Publish this platform's own PCK as revoked
    pub fn with_self_revoked(mut self) -> Self {
        self.revoked.push(self.certificate.platform_id.clone());
        self
    }

    pub fn platform_id(&self) -> &str {
        &self.certificate.platform_id
    }

    pub fn certificate(&self) -> &PlatformCertificate {
        &self.certificate
    }

    pub fn root_public_key(&self) -> String {
        self.root.public_hex()
    }

    /// Sign a report body with the platform attestation key
    pub fn sign_report(&self, body: &[u8]) -> Result<Vec<u8>> {
        self.pck
            .sign(body)
            .map_err(|e| EngineError::AttestationFailure(format!("quote signing: {}", e)))
    }

    pub fn collateral(&self) -> Collateral {
        let now = Utc::now();
        Collateral {
            root_public_key: self.root.public_hex(),
            issued_at: now,
            next_update: now + self.collateral_lifetime,
            revoked_platforms: self.revoked.clone(),
        }
    }

    /// The collateral document as served over the wire
    pub fn collateral_body(&self) -> Result<String> {
        self.collateral().render()
    }
}
