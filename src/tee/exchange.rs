//! Sharekey exchange envelopes
//!
//! A sharekey travels between parties only wrapped for a recipient's
//! certified exchange key:
//! 1. Sender derives a wrapping key via ephemeral ECDH + HKDF-SHA256
//! 2. Sharekey is sealed with AES-256-GCM under the wrapping key
//! 3. Sender signs the envelope with its certified identity key
//!
//! The recipient checks the sender signature before touching the ciphertext.

use super::certificate::Certificate;
use super::identity::{signature_valid, IdentityKey};
use super::sealing::{self, Sealed, SessionKey, IV_LEN, KEY_LEN, MAC_LEN};
use crate::error::{EngineError, Result};
use hkdf::Hkdf;
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

const WRAP_INFO: &[u8] = b"sharekey-wrap";

/// Static key-agreement key held by an enclave
pub struct ExchangeKey {
    secret: SecretKey,
}

impl ExchangeKey {
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    pub fn public_hex(&self) -> String {
        encode_point(&self.secret.public_key())
    }
}

fn encode_point(key: &PublicKey) -> String {
    hex::encode(key.to_encoded_point(false).as_bytes())
}

fn decode_point(hex_key: &str) -> Result<PublicKey> {
    let bytes = hex::decode(hex_key)
        .map_err(|_| EngineError::KeyExchangeFailure("exchange key is not hex".into()))?;
    PublicKey::from_sec1_bytes(&bytes)
        .map_err(|_| EngineError::KeyExchangeFailure("invalid exchange key".into()))
}

/// A sharekey wrapped for one recipient
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEnvelope {
    pub key_id: String,
    /// Sender's certified signing key (hex)
    pub sender: String,
    /// Recipient's exchange key the envelope is wrapped for (hex)
    pub recipient: String,
    pub ephemeral_key: String,
    pub iv: String,
    pub wrapped_key: String,
    pub mac: String,
    pub signature: String,
}

impl KeyEnvelope {
    fn transcript(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"key-envelope-v1");
        for field in [
            &self.key_id,
            &self.sender,
            &self.recipient,
            &self.ephemeral_key,
            &self.iv,
            &self.wrapped_key,
            &self.mac,
        ] {
            out.extend_from_slice(&(field.len() as u32).to_le_bytes());
            out.extend_from_slice(field.as_bytes());
        }
        out
    }

    fn sealed(&self) -> Result<Sealed> {
        let bad = |what: &str| EngineError::KeyExchangeFailure(format!("envelope {} malformed", what));
        let iv: [u8; IV_LEN] = hex::decode(&self.iv)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| bad("iv"))?;
        let mac: [u8; MAC_LEN] = hex::decode(&self.mac)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| bad("mac"))?;
        let ciphertext = hex::decode(&self.wrapped_key).map_err(|_| bad("ciphertext"))?;
        Ok(Sealed {
            ciphertext,
            iv,
            mac,
        })
    }
}

fn wrapping_key(shared: &[u8], ephemeral: &str, key_id: &str) -> Result<SessionKey> {
    let hk = Hkdf::<Sha256>::new(Some(ephemeral.as_bytes()), shared);
    let mut info = WRAP_INFO.to_vec();
    info.extend_from_slice(key_id.as_bytes());
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(&info, &mut okm[..])
        .map_err(|e| EngineError::KeyExchangeFailure(format!("hkdf: {}", e)))?;
    Ok(SessionKey::from_bytes(*okm))
}

fn wrap_aad(key_id: &str, recipient: &str) -> Vec<u8> {
    let mut aad = key_id.as_bytes().to_vec();
    aad.push(0);
    aad.extend_from_slice(recipient.as_bytes());
    aad
}

/// Wrap `sharekey` for the holder of `recipient`'s exchange key
pub fn wrap_key(
    sharekey: &SessionKey,
    key_id: &str,
    recipient: &Certificate,
    sender: &IdentityKey,
) -> Result<KeyEnvelope> {
    let recipient_key = decode_point(&recipient.exchange_key)?;
    let ephemeral = SecretKey::random(&mut OsRng);
    let ephemeral_hex = encode_point(&ephemeral.public_key());

    let shared = diffie_hellman(ephemeral.to_nonzero_scalar(), recipient_key.as_affine());
    let wrap = wrapping_key(shared.raw_secret_bytes(), &ephemeral_hex, key_id)?;
    let sealed = sealing::seal(
        &wrap,
        sharekey.as_bytes(),
        &wrap_aad(key_id, &recipient.exchange_key),
    )?;

    let mut envelope = KeyEnvelope {
        key_id: key_id.to_string(),
        sender: sender.public_hex(),
        recipient: recipient.exchange_key.clone(),
        ephemeral_key: ephemeral_hex,
        iv: hex::encode(sealed.iv),
        wrapped_key: hex::encode(&sealed.ciphertext),
        mac: hex::encode(sealed.mac),
        signature: String::new(),
    };
    envelope.signature = hex::encode(sender.sign(&envelope.transcript())?);
    Ok(envelope)
}

/// Verify the sender signature and unwrap with the recipient's exchange key
pub fn unwrap_key(
    envelope: &KeyEnvelope,
    recipient: &ExchangeKey,
    sender_cert: &Certificate,
) -> Result<SessionKey> {
    if envelope.sender != sender_cert.signing_key {
        return Err(EngineError::KeyExchangeFailure(
            "envelope sender does not match counterparty certificate".into(),
        ));
    }
    let signature = hex::decode(&envelope.signature)
        .map_err(|_| EngineError::KeyExchangeFailure("envelope signature is not hex".into()))?;
    if !signature_valid(&envelope.sender, &envelope.transcript(), &signature) {
        return Err(EngineError::KeyExchangeFailure(
            "envelope signature does not verify".into(),
        ));
    }
    let own = recipient.public_hex();
    if envelope.recipient != own {
        return Err(EngineError::KeyExchangeFailure(
            "envelope was wrapped for a different enclave".into(),
        ));
    }

    let ephemeral = decode_point(&envelope.ephemeral_key)?;
    let shared = diffie_hellman(recipient.secret.to_nonzero_scalar(), ephemeral.as_affine());
    let wrap = wrapping_key(shared.raw_secret_bytes(), &envelope.ephemeral_key, &envelope.key_id)?;
    let plain = sealing::open(&wrap, &envelope.sealed()?, &wrap_aad(&envelope.key_id, &own))
        .map_err(|_| EngineError::KeyExchangeFailure("wrapped key failed authentication".into()))?;
    SessionKey::from_slice(&plain)
}

#[cfg(test)]
mod tests {
    use super::super::certificate::{CertificateAuthority, CertificateRequest};
    use super::*;

    fn party(ca: &CertificateAuthority, name: &str) -> (IdentityKey, ExchangeKey, Certificate) {
        let identity = IdentityKey::generate();
        let exchange = ExchangeKey::generate();
        let csr = CertificateRequest::new_signed(
            name,
            &identity,
            exchange.public_hex(),
            "digest".into(),
        )
        .unwrap();
        let cert = ca.issue(&csr, None, 1).unwrap();
        (identity, exchange, cert)
    }

    #[test]
    fn test_wrap_unwrap() {
        let ca = CertificateAuthority::generate("ca", 1).unwrap();
        let (alice_id, _, alice_cert) = party(&ca, "alice");
        let (_, bob_ex, bob_cert) = party(&ca, "bob");

        let sharekey = SessionKey::generate();
        let envelope = wrap_key(&sharekey, "k1", &bob_cert, &alice_id).unwrap();
        assert!(!envelope.wrapped_key.contains(&hex::encode(sharekey.as_bytes())));

        let got = unwrap_key(&envelope, &bob_ex, &alice_cert).unwrap();
        assert_eq!(got.as_bytes(), sharekey.as_bytes());
    }

    #[test]
    fn test_wrong_recipient() {
        let ca = CertificateAuthority::generate("ca", 1).unwrap();
        let (alice_id, _, alice_cert) = party(&ca, "alice");
        let (_, _, bob_cert) = party(&ca, "bob");
        let (_, carol_ex, _) = party(&ca, "carol");

        let envelope = wrap_key(&SessionKey::generate(), "k1", &bob_cert, &alice_id).unwrap();
        assert!(matches!(
            unwrap_key(&envelope, &carol_ex, &alice_cert),
            Err(EngineError::KeyExchangeFailure(_))
        ));
    }

    #[test]
    fn test_tampered_envelope() {
        let ca = CertificateAuthority::generate("ca", 1).unwrap();
        let (alice_id, _, alice_cert) = party(&ca, "alice");
        let (_, bob_ex, bob_cert) = party(&ca, "bob");

        let mut envelope = wrap_key(&SessionKey::generate(), "k1", &bob_cert, &alice_id).unwrap();
        envelope.key_id = "k2".into();
        assert!(unwrap_key(&envelope, &bob_ex, &alice_cert).is_err());
    }

    #[test]
    fn test_sender_must_match_certificate() {
        let ca = CertificateAuthority::generate("ca", 1).unwrap();
        let (alice_id, _, _) = party(&ca, "alice");
        let (_, bob_ex, bob_cert) = party(&ca, "bob");
        let (_, _, mallory_cert) = party(&ca, "mallory");

        let envelope = wrap_key(&SessionKey::generate(), "k1", &bob_cert, &alice_id).unwrap();
        assert!(unwrap_key(&envelope, &bob_ex, &mallory_cert).is_err());
    }
}
