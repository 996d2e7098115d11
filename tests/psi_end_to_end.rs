//! Full flow: attest three enclaves, certify them, hand both parties'
//! sharekeys to the compute enclave, run PSI, read the sealed results back.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use trusted_psi_core::config::EngineConfig;
use trusted_psi_core::operator::{AllowList, OperatorContext, OperatorRegistry};
use trusted_psi_core::storage::EncryptedStore;
use trusted_psi_core::tee::{
    AttestationVerifier, Certificate, CertificateAuthority, EnclaveEngine, EnclaveHandle,
    EnclaveMeasurement, EnclaveSession, LocalCollateral, SessionState, SimulatedPlatform,
};
use trusted_psi_core::{EngineError, ErrorKind};

/// Logger that keeps every formatted record
struct CaptureLogger {
    lines: Mutex<Vec<String>>,
}

impl log::Log for CaptureLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(format!("{} {} {}", record.level(), record.target(), record.args()));
        }
    }

    fn flush(&self) {}
}

static CAPTURE: CaptureLogger = CaptureLogger {
    lines: Mutex::new(Vec::new()),
};

fn install_capture() {
    // Only the first test to get here installs it; the rest share it.
    if log::set_logger(&CAPTURE).is_ok() {
        log::set_max_level(log::LevelFilter::Trace);
    }
}

fn captured() -> String {
    CAPTURE.lines.lock().unwrap().join("\n")
}

struct Deployment {
    dir: tempfile::TempDir,
    engine: Arc<EnclaveEngine>,
    verifier: AttestationVerifier,
    ca: CertificateAuthority,
}

impl Deployment {
    fn new() -> Self {
        install_capture();
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::generate("psi-test-ca", 30).unwrap();
        ca.write_files(dir.path().join("ca.key"), dir.path().join("ca.json"))
            .unwrap();

        let mut config = EngineConfig::default();
        config.enclave.trusted_ca_key = Some(ca.public_key());
        let measurement = EnclaveMeasurement::for_config(&config.enclave).unwrap();
        config.verifier.allowed_measurements = vec![measurement.mrenclave];

        let platform = Arc::new(SimulatedPlatform::new().unwrap());
        let verifier = AttestationVerifier::new(
            config.verifier.clone(),
            Arc::new(LocalCollateral(platform.clone())),
        );
        let engine = EnclaveEngine::new(config, platform)
            .unwrap()
            .with_store(EncryptedStore::with_root(dir.path().join("data")));

        Self {
            dir,
            engine: Arc::new(engine),
            verifier,
            ca,
        }
    }

    fn ca_key(&self) -> PathBuf {
        self.dir.path().join("ca.key")
    }

    fn ca_root(&self) -> PathBuf {
        self.dir.path().join("ca.json")
    }

    fn data(&self, name: &str) -> PathBuf {
        self.dir.path().join("data").join(name)
    }

    /// Open, attest and certify a fresh enclave
    fn attested_enclave(&self, subject: &str) -> (EnclaveHandle, Certificate) {
        let handle = self.engine.open().unwrap();
        let nonce = uuid::Uuid::new_v4();
        let quote = self.engine.generate_quote(handle, nonce.as_bytes()).unwrap();
        self.verifier.verify_quote(&quote, nonce.as_bytes()).unwrap();
        let csr = self.engine.create_csr(handle, subject).unwrap();
        let cert = self
            .verifier
            .issue_certificate(self.ca_key(), self.ca_root(), &csr)
            .unwrap();
        assert!(cert.verify(&self.ca.public_key(), chrono::Utc::now()).is_ok());
        (handle, cert)
    }
}

fn records(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Ways a record could end up in a log line
fn renderings(bytes: &[u8]) -> Vec<String> {
    vec![
        hex::encode(bytes),
        hex::encode_upper(bytes),
        format!("{:?}", bytes),
        format!("{:x?}", bytes),
        format!("{:?}", bytes.to_vec()),
    ]
}

fn raw(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

#[test]
fn test_two_party_psi_end_to_end() {
    let d = Deployment::new();
    let (party_a, cert_a) = d.attested_enclave("party-a");
    let (party_b, cert_b) = d.attested_enclave("party-b");
    let (compute, cert_c) = d.attested_enclave("compute");

    // Each party creates a sharekey and hands it to the compute enclave
    for (party, cert, key_id) in [(party_a, &cert_a, "key-a"), (party_b, &cert_b, "key-b")] {
        d.engine.generate_key(party, key_id).unwrap();
        let envelope = d.engine.wrap_key_for(party, key_id, &cert_c).unwrap();
        d.engine
            .establish_key(compute, key_id, cert, &envelope)
            .unwrap();
    }
    assert_eq!(
        d.engine.status(compute).unwrap().state,
        SessionState::KeyEstablished
    );

    // Uploads
    d.engine
        .seal_bytes(party_a, "key-a", "a.in", &records(&[1, 2, 3, 4]))
        .unwrap();
    d.engine
        .seal_bytes(party_b, "key-b", "b.in", &records(&[3, 4, 5, 6]))
        .unwrap();

    let auth = AllowList::new()
        .allow_read("compute", "a.in")
        .allow_read("compute", "b.in")
        .allow_write("compute", "a.out")
        .allow_write("compute", "b.out");
    let ctx = OperatorContext::new(d.engine.clone(), compute, "compute").with_auth(Arc::new(auth));
    let registry = OperatorRegistry::with_builtin();
    let mut psi = registry
        .prepare("psi", 2, ctx, &["key-a:8".to_string(), "key-b:8".to_string()])
        .unwrap();

    let files: Vec<String> = ["a.in", "b.in", "a.out", "b.out"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(psi.run(&files).unwrap(), 2);

    // Each party reads the intersection under its own key
    let expected = records(&[3, 4]);
    let out_a = d.engine.open_sealed_frames(party_a, "key-a", "a.out").unwrap();
    let out_b = d.engine.open_sealed_frames(party_b, "key-b", "b.out").unwrap();
    assert_eq!(out_a.as_slice(), expected.as_slice());
    assert_eq!(out_b.as_slice(), expected.as_slice());

    // Nothing observable outside the enclaves carries a record in the clear
    let logs = captured();
    for value in [1u64, 2, 3, 4, 5, 6] {
        let bytes = value.to_be_bytes();
        for rendering in renderings(&bytes) {
            assert!(
                !logs.contains(&rendering),
                "record {} leaked to logs as {}",
                value,
                rendering
            );
        }
        for file in ["a.in", "b.in", "a.out", "b.out"] {
            assert!(
                !contains(&raw(&d.data(file)), &bytes),
                "record {} visible in {}",
                value,
                file
            );
        }
    }

    d.engine.shutdown();
}

#[test]
fn test_key_use_before_establish_is_not_ready() {
    let d = Deployment::new();
    let (handle, _) = d.attested_enclave("early");

    let err = d.engine.encrypt(handle, "k", b"too soon").unwrap_err();
    assert!(matches!(err, EngineError::NotReady { .. }));
    assert_eq!(err.kind(), ErrorKind::State);

    let err = d
        .engine
        .encrypt_at(handle, "k", "early.psf", 0, b"too soon")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert!(!d.data("early.psf").exists());
}

#[test]
fn test_tampered_nonce_rejected() {
    let d = Deployment::new();
    let handle = d.engine.open().unwrap();
    let quote = d.engine.generate_quote(handle, b"challenge-1").unwrap();

    let err = d.verifier.verify_quote(&quote, b"challenge-2").unwrap_err();
    assert!(matches!(err, EngineError::BadQuote(_)));
    assert_eq!(err.kind(), ErrorKind::Attestation);

    // the rejected quote cannot back a certificate
    let csr = d.engine.create_csr(handle, "replayed").unwrap();
    assert!(d
        .verifier
        .issue_certificate(d.ca_key(), d.ca_root(), &csr)
        .is_err());
}

#[test]
fn test_uncertified_counterparty_cannot_deliver_keys() {
    let d = Deployment::new();
    let (party, _) = d.attested_enclave("party");
    let (compute, cert_c) = d.attested_enclave("compute");

    let rogue_ca = CertificateAuthority::generate("rogue", 1).unwrap();
    let csr = d.engine.create_csr(party, "party").unwrap();
    let rogue_cert = rogue_ca.root().clone();
    assert_ne!(rogue_cert.signing_key, csr.signing_key);

    d.engine.generate_key(party, "k").unwrap();
    let envelope = d.engine.wrap_key_for(party, "k", &cert_c).unwrap();
    let err = d
        .engine
        .establish_key(compute, "k", &rogue_cert, &envelope)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Crypto);
    assert_eq!(d.engine.status(compute).unwrap().state, SessionState::Attested);
}

#[test]
fn test_close_is_idempotent() {
    let d = Deployment::new();
    let (handle, _) = d.attested_enclave("short-lived");
    d.engine.generate_key(handle, "k").unwrap();

    assert_eq!(d.engine.close(handle), 1);
    assert_eq!(d.engine.close(handle), 0);
    assert!(matches!(
        d.engine.encrypt(handle, "k", b"x"),
        Err(EngineError::InvalidHandle(_))
    ));
    assert!(!d.engine.live_sessions().contains(&handle));
}

#[test]
fn test_session_keys_cleared_on_close() {
    install_capture();
    let config = EngineConfig::default();
    let platform = SimulatedPlatform::new().unwrap();
    let mut session = EnclaveSession::open(&config.enclave, &config.storage).unwrap();
    session.generate_quote(&platform, b"n").unwrap();
    session.generate_key("k1").unwrap();
    session.generate_key("k2").unwrap();
    assert!(!session.keys_cleared());

    assert_eq!(session.close(), 2);
    assert_eq!(session.close(), 0);
    assert_eq!(session.key_slots(), 2);
    assert!(session.keys_cleared());
    assert!(session.status().key_ids.is_empty());
    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(
        session.encrypt("k1", b"x"),
        Err(EngineError::SessionClosed)
    ));
}
