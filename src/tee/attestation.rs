//! Remote attestation: quotes, verification and certificate issuance
//!
//! Protocol:
//! 1. Challenger sends a nonce
//! 2. Enclave produces a quote: measurement + report data binding the nonce
//!    and the enclave's public keys, signed by the platform attestation key
//! 3. Verifier checks the signature chain up to the vendor root published in
//!    the fetched collateral, then checks freshness and the trust policy
//! 4. Enclave submits a signing request referencing the verified quote and
//!    receives a certificate for its keys
//!
//! Every failed check is a hard rejection. Collateral fetches are not
//! retried here.

use super::certificate::{Certificate, CertificateAuthority, CertificateRequest};
use super::enclave::EnclaveMeasurement;
use super::identity::IdentityKey;
use super::platform::{Collateral, PlatformCertificate, SimulatedPlatform};
use crate::config::VerifierConfig;
use crate::error::{EngineError, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub const QUOTE_VERSION: u16 = 1;

/// Signed portion of a quote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteBody {
    pub version: u16,
    pub measurement: EnclaveMeasurement,
    /// SHA-256(nonce || signing_key || exchange_key), hex
    pub report_data: String,
    pub signing_key: String,
    pub exchange_key: String,
    pub timestamp: DateTime<Utc>,
}

/// Hardware-signed attestation evidence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub body: QuoteBody,
    pub pck: PlatformCertificate,
    /// PCK signature over the serialized body (hex)
    pub signature: String,
}

impl Quote {
    /// Stable identifier for this exact quote
    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| EngineError::BadQuote(e.to_string()))
    }
}

/// Bind a challenger nonce to the enclave's public keys
pub fn report_data(nonce: &[u8], signing_key: &str, exchange_key: &str) -> String {
    let mut h = Sha256::new();
    h.update((nonce.len() as u64).to_le_bytes());
    h.update(nonce);
    h.update(signing_key.as_bytes());
    h.update(exchange_key.as_bytes());
    h.update(b"quote-report-data-v1");
    hex::encode(h.finalize())
}

/// Produce a quote on the platform for an enclave's measurement and keys
pub(crate) fn build_quote(
    platform: &SimulatedPlatform,
    measurement: &EnclaveMeasurement,
    nonce: &[u8],
    signing_key: String,
    exchange_key: String,
) -> Result<Quote> {
    let body = QuoteBody {
        version: QUOTE_VERSION,
        measurement: measurement.clone(),
        report_data: report_data(nonce, &signing_key, &exchange_key),
        signing_key,
        exchange_key,
        timestamp: Utc::now(),
    };
    let signature = hex::encode(platform.sign_report(&serde_json::to_vec(&body)?)?);
    Ok(Quote {
        body,
        pck: platform.certificate().clone(),
        signature,
    })
}

/// Transport used to fetch vendor collateral
pub trait CollateralFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<String>;
}

impl<F> CollateralFetcher for F
where
    F: Fn(&str) -> Result<String> + Send + Sync,
{
    fn fetch(&self, url: &str) -> Result<String> {
        self(url)
    }
}

/// Serves collateral straight from a platform, no network involved
pub struct LocalCollateral(pub Arc<SimulatedPlatform>);

impl CollateralFetcher for LocalCollateral {
    fn fetch(&self, _url: &str) -> Result<String> {
        self.0.collateral_body()
    }
}

/// Outcome of a successful verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedQuote {
    pub quote_digest: String,
    pub measurement: EnclaveMeasurement,
    pub signing_key: String,
    pub exchange_key: String,
    pub verified_at: DateTime<Utc>,
    /// Verifier signature over `quote_digest || nonce` (hex)
    pub signature: String,
}

/// The relying party
pub struct AttestationVerifier {
    config: VerifierConfig,
    fetcher: Arc<dyn CollateralFetcher>,
    identity: IdentityKey,
    verified: Mutex<HashMap<String, VerifiedQuote>>,
}

impl AttestationVerifier {
    pub fn new(config: VerifierConfig, fetcher: Arc<dyn CollateralFetcher>) -> Self {
        Self {
            config,
            fetcher,
            identity: IdentityKey::generate(),
            verified: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Public key that signs verification receipts
    pub fn public_key(&self) -> String {
        self.identity.public_hex()
    }

    /// Verify `quote` against the challenge `nonce`
    pub fn verify_quote(&self, quote: &Quote, nonce: &[u8]) -> Result<VerifiedQuote> {
        let body = self.fetcher.fetch(&self.config.collateral_url)?;
        let collateral = Collateral::parse(&body)?;
        let now = Utc::now();

        // 1. Collateral freshness
        if collateral.is_expired(now) {
            return Err(EngineError::ExpiredCollateral(format!(
                "collateral expired at {}",
                collateral.next_update
            )));
        }

        // 2. Platform certificate chains to the vendor root and is not revoked
        if !quote.pck.verify(&collateral.root_public_key) {
            return Err(EngineError::BadQuote(
                "platform certificate does not chain to vendor root".into(),
            ));
        }
        if collateral.is_revoked(&quote.pck.platform_id) {
            return Err(EngineError::BadQuote(format!(
                "platform {} is revoked",
                quote.pck.platform_id
            )));
        }

        // 3. Quote signature
        let sig = hex::decode(&quote.signature)
            .map_err(|_| EngineError::BadQuote("signature is not hex".into()))?;
        if !super::identity::signature_valid(
            &quote.pck.pck_key,
            &serde_json::to_vec(&quote.body)?,
            &sig,
        ) {
            return Err(EngineError::BadQuote("quote signature mismatch".into()));
        }
        if quote.body.version != QUOTE_VERSION {
            return Err(EngineError::BadQuote(format!(
                "unsupported quote version {}",
                quote.body.version
            )));
        }

        // 4. Nonce binding (replay protection)
        let expected =
            report_data(nonce, &quote.body.signing_key, &quote.body.exchange_key);
        if quote.body.report_data != expected {
            return Err(EngineError::BadQuote(
                "report data does not bind the challenge nonce".into(),
            ));
        }

        // 5. Quote age
        let age = now - quote.body.timestamp;
        if age > Duration::seconds(self.config.max_quote_age_secs) {
            return Err(EngineError::BadQuote(format!(
                "quote is {}s old, limit {}s",
                age.num_seconds(),
                self.config.max_quote_age_secs
            )));
        }

        // 6. Trust policy
        self.check_policy(&quote.body.measurement)?;

        let quote_digest = quote.digest()?;
        let mut receipt_msg = quote_digest.as_bytes().to_vec();
        receipt_msg.extend_from_slice(nonce);
        let signature = hex::encode(self.identity.sign(&receipt_msg)?);

        let verified = VerifiedQuote {
            quote_digest: quote_digest.clone(),
            measurement: quote.body.measurement.clone(),
            signing_key: quote.body.signing_key.clone(),
            exchange_key: quote.body.exchange_key.clone(),
            verified_at: now,
            signature,
        };
        {
            let mut table = self.verified.lock();
            table.retain(|_, v| self.is_fresh(v, now));
            table.insert(quote_digest, verified.clone());
        }

        log::info!(
            "Quote verified: mrenclave={}.. platform={}",
            &verified.measurement.mrenclave[..8.min(verified.measurement.mrenclave.len())],
            &quote.pck.platform_id[..8.min(quote.pck.platform_id.len())]
        );
        Ok(verified)
    }

    fn check_policy(&self, m: &EnclaveMeasurement) -> Result<()> {
        if !self.config.allowed_measurements.contains(&m.mrenclave) {
            return Err(EngineError::UntrustedEnclave(format!(
                "MRENCLAVE {}.. not in allow-list",
                &m.mrenclave[..8.min(m.mrenclave.len())]
            )));
        }
        if !self.config.allowed_signers.is_empty()
            && !self.config.allowed_signers.contains(&m.mrsigner)
        {
            return Err(EngineError::UntrustedEnclave("MRSIGNER not in allow-list".into()));
        }
        if m.isv_svn < self.config.min_isv_svn {
            return Err(EngineError::UntrustedEnclave(format!(
                "SVN {} below minimum {}",
                m.isv_svn, self.config.min_isv_svn
            )));
        }
        if m.debug && !self.config.allow_debug {
            return Err(EngineError::UntrustedEnclave("debug enclave not allowed".into()));
        }
        Ok(())
    }

    /// Whether this verifier holds an unspent, unexpired acceptance of `digest`
    pub fn has_verified(&self, digest: &str) -> bool {
        let now = Utc::now();
        self.verified
            .lock()
            .get(digest)
            .is_some_and(|v| self.is_fresh(v, now))
    }

    /// Number of acceptances waiting for a certificate request
    pub fn pending_verifications(&self) -> usize {
        self.verified.lock().len()
    }

    fn is_fresh(&self, verified: &VerifiedQuote, now: DateTime<Utc>) -> bool {
        now - verified.verified_at <= Duration::seconds(self.config.max_quote_age_secs)
    }

    /// Sign `csr` with the CA at `private_key_path` / `root_ca_path`.
    ///
    /// The request must reference a quote this verifier accepted no longer
    /// than `max_quote_age_secs` ago, and its keys must be the ones that quote
    /// attested. Otherwise nothing is issued. A verification backs at most
    /// one certificate.
    pub fn issue_certificate(
        &self,
        private_key_path: impl AsRef<Path>,
        root_ca_path: impl AsRef<Path>,
        csr: &CertificateRequest,
    ) -> Result<Certificate> {
        if !csr.verify_self_signature() {
            return Err(EngineError::InvalidCsr("self-signature does not verify".into()));
        }
        if csr.subject.trim().is_empty() {
            return Err(EngineError::InvalidCsr("empty subject".into()));
        }

        // Removed while issuing; put back if issuance fails.
        let verified = self.verified.lock().remove(&csr.quote_digest).ok_or_else(|| {
            EngineError::AttestationFailure(
                "no successful quote verification backs this request".into(),
            )
        })?;
        if !self.is_fresh(&verified, Utc::now()) {
            return Err(EngineError::AttestationFailure(format!(
                "quote verification from {} has expired",
                verified.verified_at
            )));
        }

        match self.issue_for(private_key_path, root_ca_path, csr, &verified) {
            Ok(cert) => {
                log::info!(
                    "Issued certificate {} for '{}' (valid until {})",
                    &cert.serial[..8],
                    cert.subject,
                    cert.not_after
                );
                Ok(cert)
            }
            Err(e) => {
                self.verified
                    .lock()
                    .insert(verified.quote_digest.clone(), verified);
                Err(e)
            }
        }
    }

    fn issue_for(
        &self,
        private_key_path: impl AsRef<Path>,
        root_ca_path: impl AsRef<Path>,
        csr: &CertificateRequest,
        verified: &VerifiedQuote,
    ) -> Result<Certificate> {
        if verified.signing_key != csr.signing_key || verified.exchange_key != csr.exchange_key {
            return Err(EngineError::InvalidCsr(
                "request keys differ from the attested keys".into(),
            ));
        }
        let ca = CertificateAuthority::load(private_key_path, root_ca_path)?;
        ca.issue(
            csr,
            Some(verified.measurement.mrenclave.clone()),
            self.config.certificate_validity_days,
        )
    }
}
