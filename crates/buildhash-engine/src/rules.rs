//! Rule-file loading (spec §4.I): a thin seam, not a scripting runtime.
//!
//! A rule file is named `root.<dot.path>` and lives at
//! `{src_root}/<slash/path>/BUILD`. Loading it reads the source bytes,
//! binds `loc` to the [`Tree`] rooted at the file's directory, and caches
//! the result by dotted name for the process lifetime. A failed load
//! leaves no entry behind, so retrying is well-defined — ported from
//! the importer's `del _buildfiles[name]` on exception.
//!
//! Evaluating the source itself (a host scripting layer, per spec §1) is
//! explicitly out of scope here: this module resolves names to files and
//! binds `loc`, nothing more.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use buildhash_cas::CasStore;
use buildhash_fs::{FsError, FsValue, Path, Root, Roots};

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("rule file name must start with \"root\", got {0:?}")]
    NotRooted(String),
    #[error("no build file for {name} at {path}")]
    NotFound { name: String, path: String },
    #[error(transparent)]
    Fs(#[from] FsError),
}

/// A loaded rule file: its source bytes and the `loc` tree bound to its
/// containing directory. Evaluating `source` into rule definitions is a
/// host-scripting-layer concern this crate does not implement.
#[derive(Debug, Clone)]
pub struct LoadedRule {
    pub name: String,
    pub source: Arc<[u8]>,
    pub loc: FsValue,
}

/// Caches loaded rule files by dotted name for the process lifetime
/// (spec §4.I; an in-memory map, not part of the CAS/memo system).
#[derive(Default)]
pub struct RuleLoader {
    loaded: Mutex<HashMap<String, LoadedRule>>,
}

impl RuleLoader {
    #[must_use]
    pub fn new() -> Self {
        RuleLoader::default()
    }

    /// Resolve `name` (e.g. `"root.foo.bar"`) against `{src_root}/foo/bar/BUILD`,
    /// returning the cached entry if already loaded. A load that fails
    /// partway leaves no entry in the cache.
    pub fn load(&self, name: &str, roots: &Roots, cas: &CasStore) -> Result<LoadedRule, RulesError> {
        if let Some(cached) = self.loaded.lock().get(name).cloned() {
            return Ok(cached);
        }

        let parts: Vec<&str> = name.split('.').filter(|s| !s.is_empty()).collect();
        let Some((&"root", rest)) = parts.split_first() else {
            return Err(RulesError::NotRooted(name.to_string()));
        };

        let dir_rel = rest.join("/");
        let dir_path = Path::new(Root::Src, dir_rel.clone());
        let build_path = dir_path.join("BUILD");
        let fspath = build_path.fspath(roots)?;

        let source = std::fs::read(&fspath).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RulesError::NotFound {
                    name: name.to_string(),
                    path: fspath.display().to_string(),
                }
            } else {
                RulesError::Fs(FsError::Io(e))
            }
        })?;

        let loc = dir_path
            .tree(roots, cas)?
            .ok_or_else(|| RulesError::NotFound {
                name: name.to_string(),
                path: dir_path.rel().to_string(),
            })?;

        let loaded = LoadedRule {
            name: name.to_string(),
            source: Arc::from(source.into_boxed_slice()),
            loc,
        };
        self.loaded.lock().insert(name.to_string(), loaded.clone());
        Ok(loaded)
    }

    /// Already-cached rule names, mostly useful for diagnostics/tests.
    #[must_use]
    pub fn loaded_names(&self) -> Vec<String> {
        self.loaded.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn roots(tmp: &std::path::Path) -> Roots {
        Roots {
            src_root: tmp.join("src"),
            gen_root: tmp.join("gen"),
            out_root: tmp.join("out"),
            cas_root: tmp.join("cas"),
        }
    }

    #[test]
    fn loads_build_file_and_binds_loc_to_its_directory() {
        let tmp = tempdir().unwrap();
        let r = roots(tmp.path());
        fs::create_dir_all(r.src_root.join("foo/bar")).unwrap();
        fs::write(r.src_root.join("foo/bar/BUILD"), b"# a rule file\n").unwrap();
        fs::write(r.src_root.join("foo/bar/helper.txt"), b"data").unwrap();

        let cas = CasStore::open(&r.cas_root).unwrap();
        let loader = RuleLoader::new();
        let loaded = loader.load("root.foo.bar", &r, &cas).unwrap();

        assert_eq!(&*loaded.source, b"# a rule file\n".as_slice());
        match loaded.loc {
            FsValue::Tree(t) => assert!(t.entries().contains_key("helper.txt")),
            FsValue::Blob(_) => panic!("expected loc to be a tree"),
        }
    }

    #[test]
    fn second_load_is_served_from_cache() {
        let tmp = tempdir().unwrap();
        let r = roots(tmp.path());
        fs::create_dir_all(r.src_root.join("foo")).unwrap();
        fs::write(r.src_root.join("foo/BUILD"), b"v1").unwrap();

        let cas = CasStore::open(&r.cas_root).unwrap();
        let loader = RuleLoader::new();
        let first = loader.load("root.foo", &r, &cas).unwrap();

        fs::write(r.src_root.join("foo/BUILD"), b"v2").unwrap();
        let second = loader.load("root.foo", &r, &cas).unwrap();
        assert_eq!(&*first.source, &*second.source, "cached entry must not re-read disk");
    }

    #[test]
    fn missing_build_file_leaves_no_partial_cache_entry() {
        let tmp = tempdir().unwrap();
        let r = roots(tmp.path());
        fs::create_dir_all(&r.src_root).unwrap();
        let cas = CasStore::open(&r.cas_root).unwrap();
        let loader = RuleLoader::new();

        assert!(loader.load("root.nope", &r, &cas).is_err());
        assert!(loader.loaded_names().is_empty());
    }

    #[test]
    fn name_must_be_rooted() {
        let tmp = tempdir().unwrap();
        let r = roots(tmp.path());
        let cas = CasStore::open(&r.cas_root).unwrap();
        let loader = RuleLoader::new();
        assert!(matches!(
            loader.load("foo.bar", &r, &cas),
            Err(RulesError::NotRooted(_))
        ));
    }
}
