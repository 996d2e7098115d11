//! Certificates binding enclave keys to a verified identity
//!
//! A certificate is a JSON document signed with ECDSA P-256 by a CA key.
//! Enclaves create self-signed signing requests that reference the quote
//! they were attested with; the verifier turns them into certificates.

use super::identity::{signature_valid, IdentityKey};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Certificate signing request produced inside an enclave
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRequest {
    pub subject: String,
    /// Hex SEC1 key used for signatures
    pub signing_key: String,
    /// Hex SEC1 key used for key agreement
    pub exchange_key: String,
    /// Digest of the quote this identity was attested with
    pub quote_digest: String,
    /// Proof of possession by `signing_key` (hex)
    pub signature: String,
}

impl CertificateRequest {
    fn tbs(subject: &str, signing_key: &str, exchange_key: &str, quote_digest: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"csr-v1");
        for field in [subject, signing_key, exchange_key, quote_digest] {
            out.extend_from_slice(&(field.len() as u32).to_le_bytes());
            out.extend_from_slice(field.as_bytes());
        }
        out
    }

    pub(crate) fn new_signed(
        subject: &str,
        identity: &IdentityKey,
        exchange_key: String,
        quote_digest: String,
    ) -> Result<Self> {
        let signing_key = identity.public_hex();
        let signature = hex::encode(identity.sign(&Self::tbs(
            subject,
            &signing_key,
            &exchange_key,
            &quote_digest,
        ))?);
        Ok(Self {
            subject: subject.to_string(),
            signing_key,
            exchange_key,
            quote_digest,
            signature,
        })
    }

    pub fn verify_self_signature(&self) -> bool {
        let Ok(sig) = hex::decode(&self.signature) else {
            return false;
        };
        signature_valid(
            &self.signing_key,
            &Self::tbs(
                &self.subject,
                &self.signing_key,
                &self.exchange_key,
                &self.quote_digest,
            ),
            &sig,
        )
    }
}

/// An issued certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub serial: String,
    pub subject: String,
    pub issuer: String,
    pub signing_key: String,
    pub exchange_key: String,
    /// MRENCLAVE of the attested enclave, `None` for CA roots
    pub measurement: Option<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// CA signature over every other field (hex)
    pub signature: String,
}

#[derive(Serialize)]
struct CertificateTbs<'a> {
    serial: &'a str,
    subject: &'a str,
    issuer: &'a str,
    signing_key: &'a str,
    exchange_key: &'a str,
    measurement: &'a Option<String>,
    not_before: &'a DateTime<Utc>,
    not_after: &'a DateTime<Utc>,
}

impl Certificate {
    fn tbs(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&CertificateTbs {
            serial: &self.serial,
            subject: &self.subject,
            issuer: &self.issuer,
            signing_key: &self.signing_key,
            exchange_key: &self.exchange_key,
            measurement: &self.measurement,
            not_before: &self.not_before,
            not_after: &self.not_after,
        })?)
    }

    fn sign_with(mut self, key: &IdentityKey) -> Result<Self> {
        self.signature = hex::encode(key.sign(&self.tbs()?)?);
        Ok(self)
    }

    /// Check the CA signature and the validity window at `now`
    pub fn verify(&self, ca_key: &str, now: DateTime<Utc>) -> Result<()> {
        let sig = hex::decode(&self.signature)
            .map_err(|_| EngineError::CertificateRejected("signature is not hex".into()))?;
        if !signature_valid(ca_key, &self.tbs()?, &sig) {
            return Err(EngineError::CertificateRejected(format!(
                "signature on '{}' does not verify",
                self.subject
            )));
        }
        if now < self.not_before || now > self.not_after {
            return Err(EngineError::CertificateRejected(format!(
                "'{}' is outside its validity window",
                self.subject
            )));
        }
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| EngineError::from_io(path, e))?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| EngineError::from_io(path, e))
    }
}

/// CA key plus its self-signed root certificate
pub struct CertificateAuthority {
    key: IdentityKey,
    root: Certificate,
}

impl CertificateAuthority {
    /// Create a fresh CA
    pub fn generate(name: &str, validity_days: i64) -> Result<Self> {
        let key = IdentityKey::generate();
        let now = Utc::now();
        let root = Certificate {
            serial: uuid::Uuid::new_v4().to_string(),
            subject: name.to_string(),
            issuer: name.to_string(),
            signing_key: key.public_hex(),
            exchange_key: String::new(),
            measurement: None,
            not_before: now,
            not_after: now + Duration::days(validity_days),
            signature: String::new(),
        }
        .sign_with(&key)?;
        Ok(Self { key, root })
    }

    /// Load a CA from its private key file and root certificate file
    pub fn load(private_key_path: impl AsRef<Path>, root_ca_path: impl AsRef<Path>) -> Result<Self> {
        let key = IdentityKey::load(private_key_path)?;
        let root = Certificate::load(root_ca_path)?;
        if root.signing_key != key.public_hex() {
            return Err(EngineError::SigningFailure(
                "CA private key does not match root certificate".into(),
            ));
        }
        root.verify(&root.signing_key, Utc::now())?;
        Ok(Self { key, root })
    }

    pub fn write_files(
        &self,
        private_key_path: impl AsRef<Path>,
        root_ca_path: impl AsRef<Path>,
    ) -> Result<()> {
        self.key.store(private_key_path)?;
        self.root.save(root_ca_path)
    }

    pub fn root(&self) -> &Certificate {
        &self.root
    }

    pub fn public_key(&self) -> String {
        self.root.signing_key.clone()
    }

    /// Sign a certificate for an already-validated request
    pub(crate) fn issue(
        &self,
        request: &CertificateRequest,
        measurement: Option<String>,
        validity_days: i64,
    ) -> Result<Certificate> {
        let now = Utc::now();
        Certificate {
            serial: uuid::Uuid::new_v4().to_string(),
            subject: request.subject.clone(),
            issuer: self.root.subject.clone(),
            signing_key: request.signing_key.clone(),
            exchange_key: request.exchange_key.clone(),
            measurement,
            not_before: now,
            not_after: now + Duration::days(validity_days),
            signature: String::new(),
        }
        .sign_with(&self.key)
    }
}
