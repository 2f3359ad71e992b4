//! Process-wide configuration, lifecycle, tool execution, and rule-file
//! loading (spec §4.H, §4.I, §6) — the thin glue that turns the CAS, FS,
//! and memo layers into something a rule file can actually call into.

#![deny(unsafe_code)]

pub mod config;
pub mod rules;
pub mod tool;

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use buildhash_cas::{CasError, CasStore};
use buildhash_fs::{FsError, Roots, ValidatedTrees};
use buildhash_memo::{MemoError, Memoizer};
use buildhash_value::Registry;

pub use config::{Config, ConfigError};
pub use rules::{LoadedRule, RuleLoader, RulesError};
pub use tool::{run_tool, ToolError, ToolRun};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cas(#[from] CasError),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Memo(#[from] MemoError),
    #[error(transparent)]
    Rules(#[from] RulesError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The handles a running [`Engine`] owns, torn down in LIFO order on
/// `uninit` (spec §4.H).
struct Handles {
    cas: Arc<CasStore>,
    memo: Memoizer,
    validated_trees: ValidatedTrees,
    rule_loader: RuleLoader,
}

/// The engine's process-wide state: configured roots plus the CAS, memo,
/// and validated-tree handles built over them. A clean implementation
/// threads one `Engine` value through every operation (DESIGN NOTES §9);
/// [`global`] below additionally offers the classic `init()`/`uninit()`
/// singleton surface the spec describes.
pub struct Engine {
    roots: Roots,
    registry: Registry,
    handles: Mutex<Option<Handles>>,
}

impl Engine {
    /// Compose `config` against its defaults, expand its mutual template
    /// references, and build the CAS/memo/validated-tree handles.
    pub fn init(config: Config, registry: Registry) -> Result<Self, EngineError> {
        let roots = config.resolve()?;
        let handles = Self::build_handles(&roots, &registry)?;
        Ok(Engine {
            roots,
            registry,
            handles: Mutex::new(Some(handles)),
        })
    }

    fn build_handles(roots: &Roots, registry: &Registry) -> Result<Handles, EngineError> {
        let cas = Arc::new(CasStore::open(&roots.cas_root)?);
        let memo = Memoizer::open(&roots.cas_root.join("memo_db"), cas.clone(), registry.clone())?;
        let validated_trees = ValidatedTrees::new();
        let rule_loader = RuleLoader::new();
        Ok(Handles { cas, memo, validated_trees, rule_loader })
    }

    #[must_use]
    pub fn roots(&self) -> &Roots {
        &self.roots
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn with_handles<T>(&self, f: impl FnOnce(&Handles) -> T) -> T {
        let guard = self.handles.lock();
        let handles = guard.as_ref().expect("Engine used after uninit()");
        f(handles)
    }

    #[must_use]
    pub fn cas(&self) -> Arc<CasStore> {
        self.with_handles(|h| h.cas.clone())
    }

    pub fn with_memoizer<T>(&self, f: impl FnOnce(&Memoizer) -> T) -> T {
        self.with_handles(|h| f(&h.memo))
    }

    pub fn with_validated_trees<T>(&self, f: impl FnOnce(&ValidatedTrees) -> T) -> T {
        self.with_handles(|h| f(&h.validated_trees))
    }

    /// Load (or fetch the process-cached copy of) the rule file named
    /// `name` (e.g. `"root.foo.bar"`), per spec §4.I.
    pub fn load_rule(&self, name: &str) -> Result<LoadedRule, EngineError> {
        self.with_handles(|h| Ok(h.rule_loader.load(name, &self.roots, &h.cas)?))
    }

    /// Run `program(args)` as a build tool (spec §6) inside a fresh
    /// output directory under this engine's roots.
    pub fn run_tool(&self, program: &str, args: &[String]) -> Result<ToolRun, EngineError> {
        self.with_handles(|h| Ok(run_tool(&self.roots, &h.cas, program, args)?))
    }

    /// Re-initialize in place: close the current handles (LIFO), then
    /// build fresh ones from `config` (spec §4.H: "Re-init closes and
    /// rebuilds").
    pub fn reinit(&self, config: Config) -> Result<(), EngineError> {
        self.uninit();
        let roots = config.resolve()?;
        let handles = Self::build_handles(&roots, &self.registry)?;
        *self.handles.lock() = Some(handles);
        Ok(())
    }

    /// Close every handle in LIFO order (validated-tree cache first, then
    /// the memoizer, then the CAS) and mark the engine uninitialized.
    pub fn uninit(&self) {
        if let Some(handles) = self.handles.lock().take() {
            let Handles { cas, memo, validated_trees, rule_loader } = handles;
            drop(rule_loader);
            drop(validated_trees);
            drop(memo);
            drop(cas);
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.handles.lock().is_some()
    }
}

/// The classic singleton surface: `global::init`/`global::uninit`,
/// matching spec §4.H's description of a process-wide `init(**overrides)`
/// / `uninit()` pair. Calling `init` while already initialized logs a
/// warning and performs an implicit re-init rather than erroring, mirroring
/// the Python prototype's unconditional `uninit()` call at `init()` entry.
pub mod global {
    use super::{Config, Engine, EngineError, Registry};
    use parking_lot::Mutex;
    use std::sync::Arc;

    static ENGINE: Mutex<Option<Arc<Engine>>> = Mutex::new(None);

    pub fn init(config: Config, registry: Registry) -> Result<Arc<Engine>, EngineError> {
        let mut slot = ENGINE.lock();
        if let Some(old) = slot.take() {
            tracing::warn!("global engine re-initialized without an explicit uninit() first");
            old.uninit();
        }
        let engine = Arc::new(Engine::init(config, registry)?);
        *slot = Some(engine.clone());
        Ok(engine)
    }

    pub fn uninit() {
        if let Some(engine) = ENGINE.lock().take() {
            engine.uninit();
        }
    }

    #[must_use]
    pub fn current() -> Option<Arc<Engine>> {
        ENGINE.lock().clone()
    }
}

/// The rule API surface (spec §6): everything a rule body needs re-exported
/// from one place, plus a [`memoize!`] macro wrapping [`Memoizer::invoke`].
pub mod prelude {
    pub use buildhash_cas::{store_value as store, CasStore};
    pub use buildhash_digest::Sig;
    pub use buildhash_fs::{Blob, FsValue, Path, Root, Tree, XBlob};
    pub use buildhash_value::{sig, RuleId, Value};

    pub use crate::{Engine, EngineError, LoadedRule, ToolRun};

    /// The four rooted [`Path`] constants a rule body starts from: the
    /// empty-relative path at each configured root.
    #[must_use]
    pub fn src_root() -> Path {
        Path::new(Root::Src, "")
    }

    #[must_use]
    pub fn gen_root() -> Path {
        Path::new(Root::Gen, "")
    }

    #[must_use]
    pub fn out_root() -> Path {
        Path::new(Root::Out, "")
    }

    #[must_use]
    pub fn cas_root() -> Path {
        Path::new(Root::Cas, "")
    }

    /// Memoize a rule call against `$engine`: `$name`/`$version` identify
    /// the rule (spec's replacement for bytecode-hash-based function
    /// signing, see DESIGN.md), `$args` is the canonical `Value` carrying
    /// its arguments, and `$body` is the expression to run on a miss.
    #[macro_export]
    macro_rules! memoize {
        ($engine:expr, $name:expr, $version:expr, $args:expr, $body:expr) => {
            $engine.with_memoizer(|m| {
                m.invoke(
                    $crate::prelude::RuleId::new($name, $version),
                    $args,
                    || $body,
                )
            })
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(tmp: &std::path::Path) -> Config {
        Config {
            db_root: tmp.to_string_lossy().into_owned(),
            src_root: "{db_root}/src".to_string(),
            gen_root: "{db_root}/gen".to_string(),
            cas_root: "{db_root}/cas".to_string(),
            out_root: "{db_root}/out".to_string(),
        }
    }

    #[test]
    fn init_creates_configured_roots() {
        let tmp = tempdir().unwrap();
        let engine = Engine::init(test_config(tmp.path()), Registry::new()).unwrap();
        assert!(engine.roots().cas_root.is_dir());
        assert!(engine.is_initialized());
    }

    #[test]
    fn uninit_then_reuse_panics_are_avoided_by_checking_is_initialized() {
        let tmp = tempdir().unwrap();
        let engine = Engine::init(test_config(tmp.path()), Registry::new()).unwrap();
        engine.uninit();
        assert!(!engine.is_initialized());
    }

    #[test]
    fn reinit_rebuilds_usable_handles() {
        let tmp = tempdir().unwrap();
        let engine = Engine::init(test_config(tmp.path()), Registry::new()).unwrap();
        engine.reinit(test_config(tmp.path())).unwrap();
        assert!(engine.is_initialized());
        let cas = engine.cas();
        assert!(cas.root().is_dir());
    }

    #[test]
    fn global_init_and_uninit_round_trip() {
        let tmp = tempdir().unwrap();
        let engine = global::init(test_config(tmp.path()), Registry::new()).unwrap();
        assert!(engine.is_initialized());
        assert!(global::current().is_some());
        global::uninit();
        assert!(global::current().is_none());
    }
}
