//! Secure computations run inside an enclave session
//!
//! An [`Operator`] is created from the registry by exact `(name, parties)`
//! match, initialised once with per-party parameters, then run over a list of
//! sealed files. Adding a computation means implementing `Operator` and
//! registering a factory; call sites never change.

pub mod psi;

pub use psi::TwoPartyPsi;

use crate::error::{EngineError, Result};
use crate::tee::{EnclaveEngine, EnclaveHandle};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A computation bound to one enclave session
pub trait Operator: Send {
    fn name(&self) -> &str;

    /// One-time setup from caller-supplied parameters. Must succeed before `run`.
    fn init(&mut self, extra_info: &[String]) -> Result<()>;

    /// Run over `files`. Returns the result size.
    fn run(&mut self, files: &[String]) -> Result<usize>;
}

/// Authorization for dataset paths
pub trait DatasetAuthFilter: Send + Sync {
    fn is_read_auth(&self, dataset: &str, owner: &str) -> bool;
    fn is_write_auth(&self, dataset: &str, owner: &str) -> bool;
}

/// Authorizes everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl DatasetAuthFilter for AllowAll {
    fn is_read_auth(&self, _dataset: &str, _owner: &str) -> bool {
        true
    }

    fn is_write_auth(&self, _dataset: &str, _owner: &str) -> bool {
        true
    }
}

/// Explicit per-owner grants
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    read: HashMap<String, HashSet<String>>,
    write: HashMap<String, HashSet<String>>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_read(mut self, owner: &str, dataset: &str) -> Self {
        self.read
            .entry(owner.to_string())
            .or_default()
            .insert(dataset.to_string());
        self
    }

    pub fn allow_write(mut self, owner: &str, dataset: &str) -> Self {
        self.write
            .entry(owner.to_string())
            .or_default()
            .insert(dataset.to_string());
        self
    }
}

impl DatasetAuthFilter for AllowList {
    fn is_read_auth(&self, dataset: &str, owner: &str) -> bool {
        self.read.get(owner).is_some_and(|set| set.contains(dataset))
    }

    fn is_write_auth(&self, dataset: &str, owner: &str) -> bool {
        self.write.get(owner).is_some_and(|set| set.contains(dataset))
    }
}

/// Everything an operator needs from its environment
#[derive(Clone)]
pub struct OperatorContext {
    pub engine: Arc<EnclaveEngine>,
    pub handle: EnclaveHandle,
    pub auth: Arc<dyn DatasetAuthFilter>,
    /// Principal on whose behalf datasets are read and written
    pub owner: String,
}

impl OperatorContext {
    pub fn new(engine: Arc<EnclaveEngine>, handle: EnclaveHandle, owner: &str) -> Self {
        Self {
            engine,
            handle,
            auth: Arc::new(AllowAll),
            owner: owner.to_string(),
        }
    }

    pub fn with_auth(mut self, auth: Arc<dyn DatasetAuthFilter>) -> Self {
        self.auth = auth;
        self
    }

    pub(crate) fn check_read(&self, dataset: &str) -> Result<()> {
        if self.auth.is_read_auth(dataset, &self.owner) {
            Ok(())
        } else {
            Err(EngineError::AccessDenied {
                dataset: dataset.to_string(),
                owner: self.owner.clone(),
                action: "read",
            })
        }
    }

    pub(crate) fn check_write(&self, dataset: &str) -> Result<()> {
        if self.auth.is_write_auth(dataset, &self.owner) {
            Ok(())
        } else {
            Err(EngineError::AccessDenied {
                dataset: dataset.to_string(),
                owner: self.owner.clone(),
                action: "write",
            })
        }
    }
}

pub type OperatorFactory = Arc<dyn Fn(OperatorContext) -> Box<dyn Operator> + Send + Sync>;

/// Operators keyed by `(name, parties)`
#[derive(Clone, Default)]
pub struct OperatorRegistry {
    factories: HashMap<(String, usize), OperatorFactory>,
}

impl OperatorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in operators: `("psi", 2)`
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            "psi",
            2,
            Arc::new(|ctx: OperatorContext| Box::new(TwoPartyPsi::new(ctx)) as Box<dyn Operator>),
        );
        registry
    }

    /// Add or replace the factory for `(name, parties)`
    pub fn register(&mut self, name: &str, parties: usize, factory: OperatorFactory) {
        log::debug!("Registered operator {}/{}", name, parties);
        self.factories.insert((name.to_string(), parties), factory);
    }

    pub fn lookup(&self, name: &str, parties: usize) -> Option<&OperatorFactory> {
        self.factories.get(&(name.to_string(), parties))
    }

    /// Registered `(name, parties)` pairs, sorted
    pub fn descriptors(&self) -> Vec<(String, usize)> {
        let mut out: Vec<(String, usize)> = self.factories.keys().cloned().collect();
        out.sort();
        out
    }

    /// Instantiate an operator for a live session. Nothing runs yet.
    pub fn create(
        &self,
        name: &str,
        parties: usize,
        ctx: OperatorContext,
    ) -> Result<Box<dyn Operator>> {
        let factory = self
            .lookup(name, parties)
            .ok_or_else(|| EngineError::UnsupportedOperator {
                name: name.to_string(),
                parties,
            })?;
        ctx.engine.status(ctx.handle)?;
        Ok(factory(ctx))
    }

    /// `create` followed by `init`
    pub fn prepare(
        &self,
        name: &str,
        parties: usize,
        ctx: OperatorContext,
        extra_info: &[String],
    ) -> Result<Box<dyn Operator>> {
        let mut op = self.create(name, parties, ctx)?;
        op.init(extra_info)?;
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::ErrorKind;
    use crate::tee::SimulatedPlatform;

    fn context() -> OperatorContext {
        let platform = Arc::new(SimulatedPlatform::new().unwrap());
        let engine = Arc::new(EnclaveEngine::new(EngineConfig::default(), platform).unwrap());
        let handle = engine.open().unwrap();
        OperatorContext::new(engine, handle, "alice")
    }

    struct Echo;

    impl Operator for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn init(&mut self, _extra_info: &[String]) -> Result<()> {
            Ok(())
        }

        fn run(&mut self, files: &[String]) -> Result<usize> {
            Ok(files.len())
        }
    }

    #[test]
    fn test_builtin_psi() {
        let registry = OperatorRegistry::with_builtin();
        assert_eq!(registry.descriptors(), vec![("psi".to_string(), 2)]);
        let op = registry.create("psi", 2, context()).unwrap();
        assert_eq!(op.name(), "psi");
    }

    #[test]
    fn test_unsupported_party_count() {
        let registry = OperatorRegistry::with_builtin();
        let err = registry.create("psi", 3, context()).err().unwrap();
        assert!(matches!(
            err,
            EngineError::UnsupportedOperator { ref name, parties: 3 } if name == "psi"
        ));
        assert_eq!(err.kind(), ErrorKind::Configuration);

        assert!(registry.create("PSI", 2, context()).is_err());
        assert!(registry.create("join", 2, context()).is_err());
    }

    #[test]
    fn test_custom_operator() {
        let mut registry = OperatorRegistry::new();
        registry.register("echo", 1, Arc::new(|_: OperatorContext| Box::new(Echo) as Box<dyn Operator>));
        let mut op = registry
            .prepare("echo", 1, context(), &[])
            .unwrap();
        assert_eq!(op.run(&["a".into(), "b".into()]).unwrap(), 2);
    }

    #[test]
    fn test_create_needs_live_handle() {
        let registry = OperatorRegistry::with_builtin();
        let ctx = context();
        ctx.engine.close(ctx.handle);
        assert!(matches!(
            registry.create("psi", 2, ctx).err(),
            Some(EngineError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_allow_list() {
        let auth = AllowList::new()
            .allow_read("alice", "in.psf")
            .allow_write("alice", "out.psf");
        assert!(auth.is_read_auth("in.psf", "alice"));
        assert!(!auth.is_write_auth("in.psf", "alice"));
        assert!(auth.is_write_auth("out.psf", "alice"));
        assert!(!auth.is_read_auth("in.psf", "bob"));
    }

    #[test]
    fn test_context_denies_access() {
        let ctx = context().with_auth(Arc::new(AllowList::new().allow_read("alice", "a")));
        assert!(ctx.check_read("a").is_ok());
        let err = ctx.check_write("a").unwrap_err();
        assert!(matches!(err, EngineError::AccessDenied { action: "write", .. }));
    }
}
