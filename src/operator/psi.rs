//! Two-party private set intersection
//!
//! Each party uploads a sealed file of fixed-width records under its own
//! sharekey. Inside the enclave session both files are opened, joined on
//! exact record equality, and the intersection is re-sealed once per party.
//! Non-matching records exist only in zeroized buffers for the duration of
//! the call.

use super::{Operator, OperatorContext};
use crate::error::{EngineError, Result};
use std::collections::{BTreeSet, HashSet};
use zeroize::Zeroizing;

const PARTIES: usize = 2;

/// Per-party parameters fixed at `init`
#[derive(Debug, Clone, PartialEq, Eq)]
struct PartySpec {
    key_id: String,
    record_size: usize,
}

pub struct TwoPartyPsi {
    ctx: OperatorContext,
    parties: Option<[PartySpec; PARTIES]>,
}

impl TwoPartyPsi {
    pub fn new(ctx: OperatorContext) -> Self {
        Self { ctx, parties: None }
    }

    /// Record width agreed at `init`
    pub fn record_size(&self) -> Option<usize> {
        self.parties.as_ref().map(|p| p[0].record_size)
    }

    fn parse_entry(entry: &str) -> Result<PartySpec> {
        let (key_id, size) = entry.rsplit_once(':').ok_or_else(|| {
            EngineError::InitFailure(format!("expected '<key_id>:<record_size>', got '{}'", entry))
        })?;
        if key_id.is_empty() {
            return Err(EngineError::InitFailure(format!("empty key id in '{}'", entry)));
        }
        let record_size = size.trim().parse::<usize>().map_err(|_| {
            EngineError::InitFailure(format!("record size '{}' is not a number", size))
        })?;
        Ok(PartySpec {
            key_id: key_id.to_string(),
            record_size,
        })
    }

    fn execute(&self, parties: &[PartySpec; PARTIES], files: &[String]) -> Result<usize> {
        if files.len() != 2 * PARTIES {
            return Err(EngineError::InputMismatch(format!(
                "expected {} files (inputs then outputs), got {}",
                2 * PARTIES,
                files.len()
            )));
        }
        let (inputs, outputs) = files.split_at(PARTIES);
        for name in inputs {
            self.ctx.check_read(name)?;
        }
        for name in outputs {
            self.ctx.check_write(name)?;
        }

        let engine = &self.ctx.engine;
        let store = engine.store();
        let record_size = parties[0].record_size;

        engine.enter(self.ctx.handle, |session| {
            let mut plain: Vec<Zeroizing<Vec<u8>>> = Vec::with_capacity(PARTIES);
            for (party, name) in parties.iter().zip(inputs) {
                let data = session.open_sealed_frames(store, &party.key_id, name)?;
                if data.len() % record_size != 0 {
                    return Err(EngineError::InputMismatch(format!(
                        "{} holds {} bytes, not a multiple of record size {}",
                        name,
                        data.len(),
                        record_size
                    )));
                }
                plain.push(data);
            }

            let left: HashSet<&[u8]> = plain[0].chunks_exact(record_size).collect();
            let matched: BTreeSet<&[u8]> = plain[1]
                .chunks_exact(record_size)
                .filter(|r| left.contains(r))
                .collect();

            let mut result = Zeroizing::new(Vec::with_capacity(matched.len() * record_size));
            for record in &matched {
                result.extend_from_slice(record);
            }
            for (party, name) in parties.iter().zip(outputs) {
                session.seal_bytes(store, &party.key_id, name, &result)?;
            }

            log::info!(
                "PSI complete in session {}: {} + {} records -> {} matches",
                &session.id()[..8],
                plain[0].len() / record_size,
                plain[1].len() / record_size,
                matched.len()
            );
            Ok(matched.len())
        })
    }
}

impl Operator for TwoPartyPsi {
    fn name(&self) -> &str {
        "psi"
    }

    /// `extra_info`: one `"<key_id>:<record_size>"` entry per party
    fn init(&mut self, extra_info: &[String]) -> Result<()> {
        if extra_info.len() != PARTIES {
            return Err(EngineError::InitFailure(format!(
                "expected {} party entries, got {}",
                PARTIES,
                extra_info.len()
            )));
        }
        let first = Self::parse_entry(&extra_info[0])?;
        let second = Self::parse_entry(&extra_info[1])?;

        if first.record_size == 0 || second.record_size == 0 {
            return Err(EngineError::InitFailure("record size must be non-zero".into()));
        }
        if first.record_size != second.record_size {
            return Err(EngineError::InitFailure(format!(
                "record sizes differ: {} vs {}",
                first.record_size, second.record_size
            )));
        }

        let status = self.ctx.engine.status(self.ctx.handle)?;
        for party in [&first, &second] {
            if !status.key_ids.contains(&party.key_id) {
                return Err(EngineError::InitFailure(format!(
                    "no key established under '{}'",
                    party.key_id
                )));
            }
        }

        log::debug!(
            "PSI initialised: keys ({}, {}), record size {}",
            first.key_id,
            second.key_id,
            first.record_size
        );
        self.parties = Some([first, second]);
        Ok(())
    }

    /// `files`: `[input_0, input_1, output_0, output_1]`
    fn run(&mut self, files: &[String]) -> Result<usize> {
        let parties = self
            .parties
            .clone()
            .ok_or_else(|| EngineError::run_failure("psi", EngineError::InitRequired))?;
        self.execute(&parties, files)
            .map_err(|e| EngineError::run_failure("psi", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::ErrorKind;
    use crate::operator::AllowList;
    use crate::storage::EncryptedStore;
    use crate::tee::{EnclaveEngine, SimulatedPlatform};
    use std::sync::Arc;

    struct Setup {
        _dir: tempfile::TempDir,
        ctx: OperatorContext,
    }

    fn setup() -> Setup {
        setup_with(EngineConfig::default())
    }

    fn setup_with(config: EngineConfig) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let platform = Arc::new(SimulatedPlatform::new().unwrap());
        let engine = Arc::new(
            EnclaveEngine::new(config, platform)
                .unwrap()
                .with_store(EncryptedStore::with_root(dir.path())),
        );
        let handle = engine.open().unwrap();
        engine.generate_quote(handle, b"n").unwrap();
        engine.generate_key(handle, "a").unwrap();
        engine.generate_key(handle, "b").unwrap();
        Setup {
            _dir: dir,
            ctx: OperatorContext::new(engine, handle, "operator"),
        }
    }

    fn records(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    fn files() -> Vec<String> {
        ["a.in", "b.in", "a.out", "b.out"].iter().map(|s| s.to_string()).collect()
    }

    fn info(a: &str, b: &str) -> Vec<String> {
        vec![a.to_string(), b.to_string()]
    }

    #[test]
    fn test_init_validation() {
        let s = setup();
        let mut psi = TwoPartyPsi::new(s.ctx.clone());

        let bad = [
            info("a:4", "b:8"),
            info("a:0", "b:0"),
            info("a", "b:4"),
            info("a:x", "b:4"),
            info("a:4", "missing:4"),
            vec!["a:4".to_string()],
        ];
        for extra in bad {
            assert!(matches!(psi.init(&extra), Err(EngineError::InitFailure(_))));
        }
        assert_eq!(psi.record_size(), None);

        psi.init(&info("a:4", "b:4")).unwrap();
        assert_eq!(psi.record_size(), Some(4));
    }

    #[test]
    fn test_run_requires_init() {
        let s = setup();
        let mut psi = TwoPartyPsi::new(s.ctx.clone());
        let err = psi.run(&files()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
    }

    #[test]
    fn test_intersection() {
        let s = setup();
        let engine = &s.ctx.engine;
        engine
            .seal_bytes(s.ctx.handle, "a", "a.in", &records(&[7, 1, 2, 3, 3]))
            .unwrap();
        engine
            .seal_bytes(s.ctx.handle, "b", "b.in", &records(&[3, 9, 7, 3]))
            .unwrap();

        let mut psi = TwoPartyPsi::new(s.ctx.clone());
        psi.init(&info("a:4", "b:4")).unwrap();
        assert_eq!(psi.run(&files()).unwrap(), 2);

        let expected = records(&[3, 7]);
        let a_out = engine.open_sealed_frames(s.ctx.handle, "a", "a.out").unwrap();
        let b_out = engine.open_sealed_frames(s.ctx.handle, "b", "b.out").unwrap();
        assert_eq!(a_out.as_slice(), expected.as_slice());
        assert_eq!(b_out.as_slice(), expected.as_slice());

        // party B's output is not readable under party A's key
        assert!(engine.open_sealed_frames(s.ctx.handle, "a", "b.out").is_err());
    }

    #[test]
    fn test_empty_intersection() {
        let s = setup();
        let engine = &s.ctx.engine;
        engine.seal_bytes(s.ctx.handle, "a", "a.in", &records(&[1])).unwrap();
        engine.seal_bytes(s.ctx.handle, "b", "b.in", &records(&[2])).unwrap();

        let mut psi = TwoPartyPsi::new(s.ctx.clone());
        psi.init(&info("a:4", "b:4")).unwrap();
        assert_eq!(psi.run(&files()).unwrap(), 0);
        assert!(engine
            .open_sealed_frames(s.ctx.handle, "a", "a.out")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_ragged_input_is_input_error() {
        let s = setup();
        let engine = &s.ctx.engine;
        engine.seal_bytes(s.ctx.handle, "a", "a.in", &[1, 2, 3, 4, 5]).unwrap();
        engine.seal_bytes(s.ctx.handle, "b", "b.in", &records(&[1])).unwrap();

        let mut psi = TwoPartyPsi::new(s.ctx.clone());
        psi.init(&info("a:4", "b:4")).unwrap();
        let err = psi.run(&files()).unwrap_err();
        assert!(matches!(err, EngineError::RunFailure { .. }));
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[test]
    fn test_wrong_key_is_crypto_error() {
        let s = setup();
        let engine = &s.ctx.engine;
        // party A's file sealed under B's key
        engine.seal_bytes(s.ctx.handle, "b", "a.in", &records(&[1])).unwrap();
        engine.seal_bytes(s.ctx.handle, "b", "b.in", &records(&[1])).unwrap();

        let mut psi = TwoPartyPsi::new(s.ctx.clone());
        psi.init(&info("a:4", "b:4")).unwrap();
        assert_eq!(psi.run(&files()).unwrap_err().kind(), ErrorKind::Crypto);
    }

    #[test]
    fn test_truncated_input_fails_run() {
        let mut config = EngineConfig::default();
        config.storage.chunk_size = 4;
        let s = setup_with(config);
        let engine = &s.ctx.engine;
        engine
            .seal_bytes(s.ctx.handle, "a", "a.in", &records(&[1, 2, 3, 4]))
            .unwrap();
        engine
            .seal_bytes(s.ctx.handle, "b", "b.in", &records(&[3, 4, 5, 6]))
            .unwrap();

        // one record per frame: dropping the last frame drops record 4
        let path = engine.store().resolve("a.in");
        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() / 4 * 3]).unwrap();

        let mut psi = TwoPartyPsi::new(s.ctx.clone());
        psi.init(&info("a:4", "b:4")).unwrap();
        let err = psi.run(&files()).unwrap_err();
        assert!(matches!(err, EngineError::RunFailure { .. }));
        assert_eq!(err.kind(), ErrorKind::Input);
        assert!(!engine.store().exists("a.out"));
    }

    #[test]
    fn test_input_swapped_with_output_fails_run() {
        let s = setup();
        let engine = &s.ctx.engine;
        engine.seal_bytes(s.ctx.handle, "a", "a.in", &records(&[1, 2])).unwrap();
        engine.seal_bytes(s.ctx.handle, "b", "b.in", &records(&[2, 3])).unwrap();

        let mut psi = TwoPartyPsi::new(s.ctx.clone());
        psi.init(&info("a:4", "b:4")).unwrap();
        assert_eq!(psi.run(&files()).unwrap(), 1);

        // replay party A's result file as its next upload
        let store = engine.store();
        std::fs::copy(store.resolve("a.out"), store.resolve("a.in")).unwrap();
        assert_eq!(psi.run(&files()).unwrap_err().kind(), ErrorKind::Crypto);
    }

    #[test]
    fn test_missing_input_is_io_error() {
        let s = setup();
        let mut psi = TwoPartyPsi::new(s.ctx.clone());
        psi.init(&info("a:4", "b:4")).unwrap();
        let err = psi.run(&files()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unauthorized_output() {
        let s = setup();
        let auth = AllowList::new()
            .allow_read("operator", "a.in")
            .allow_read("operator", "b.in")
            .allow_write("operator", "a.out");
        let mut psi = TwoPartyPsi::new(s.ctx.clone().with_auth(Arc::new(auth)));
        psi.init(&info("a:4", "b:4")).unwrap();
        let err = psi.run(&files()).unwrap_err();
        match err {
            EngineError::RunFailure { source, .. } => assert!(matches!(
                *source,
                EngineError::AccessDenied { action: "write", .. }
            )),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_wrong_file_count() {
        let s = setup();
        let mut psi = TwoPartyPsi::new(s.ctx.clone());
        psi.init(&info("a:4", "b:4")).unwrap();
        let err = psi.run(&files()[..3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }
}
