//! Memoization layer (spec §4.G): keys a rule invocation by a digest of
//! `(rule identity, args)` and stores the digest of its result. Re-invoking
//! with an equivalent signature returns the cached result without running
//! the rule's body.

#![deny(unsafe_code)]

use std::error::Error as StdError;
use std::path::Path as FsPath;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

use buildhash_cas::{load_value, store_value, CasError, CasStore};
use buildhash_digest::Sig;
use buildhash_value::{sig as value_sig, Registry, RuleId, Value};

#[derive(Debug, Error)]
pub enum MemoError {
    /// A rule-defined failure. Per spec §4.G/§7 this is *not* cached:
    /// every call with an equivalent signature re-runs the rule until one
    /// succeeds.
    #[error("build error: {0}")]
    BuildError(#[source] Box<dyn StdError + Send + Sync>),
    #[error("no memoized result for this invocation")]
    NotFound,
    #[error(transparent)]
    Cas(#[from] CasError),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl MemoError {
    pub fn build(e: impl StdError + Send + Sync + 'static) -> Self {
        MemoError::BuildError(Box::new(e))
    }
}

/// Persistent `invocation-sig -> result-sig` table (spec §4.G, §6).
pub struct MemoStore {
    db: Mutex<Connection>,
}

impl MemoStore {
    pub fn open(db_path: &FsPath) -> Result<Self, MemoError> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (key BLOB PRIMARY KEY, value BLOB NOT NULL);
             PRAGMA journal_mode=WAL;",
        )?;
        Ok(MemoStore { db: Mutex::new(conn) })
    }

    pub fn get(&self, call_sig: &Sig) -> Result<Option<Sig>, MemoError> {
        let db = self.db.lock();
        let raw: Option<Vec<u8>> = db
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![call_sig.as_bytes()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(raw.map(Sig::from_raw).transpose().map_err(CasError::from)?)
    }

    pub fn put(&self, call_sig: &Sig, result_sig: &Sig) -> Result<(), MemoError> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![call_sig.as_bytes(), result_sig.as_bytes()],
        )?;
        Ok(())
    }

    pub fn len(&self) -> Result<u64, MemoError> {
        let db = self.db.lock();
        Ok(db.query_row("SELECT COUNT(*) FROM kv", [], |r| r.get(0))?)
    }
}

/// Invocation-signature memoizer: the thing a `@memoize`-style wrapper
/// calls into on every rule call.
pub struct Memoizer {
    memo: MemoStore,
    cas: Arc<CasStore>,
    registry: Registry,
    current_call_hash: Mutex<Option<Sig>>,
}

impl Memoizer {
    pub fn open(db_path: &FsPath, cas: Arc<CasStore>, registry: Registry) -> Result<Self, MemoError> {
        Ok(Memoizer {
            memo: MemoStore::open(db_path)?,
            cas,
            registry,
            current_call_hash: Mutex::new(None),
        })
    }

    /// The call-signature of the invocation currently being evaluated (the
    /// innermost miss on the call stack), if any — rules may read this to
    /// deterministically name their own output directories (spec §4.G:
    /// "the procedure may use it to name output directories").
    #[must_use]
    pub fn current_call_hash(&self) -> Option<Sig> {
        self.current_call_hash.lock().clone()
    }

    fn call_sig(rule: RuleId, args: &Value) -> Sig {
        value_sig(&Value::Tuple(vec![rule.to_value(), args.clone()]))
    }

    /// Invoke `rule` with `args` (typically `Value::Tuple([Value::List(..),
    /// Value::Map(..)])` to carry positional + keyword arguments). On a
    /// cache hit, `f` is never called. On a miss, `f` runs with
    /// `current_call_hash` bound to this call's signature; its result is
    /// signed, persisted, and recorded before being returned.
    ///
    /// A `BuildError` from `f` propagates without being recorded — see
    /// [`MemoError::BuildError`].
    pub fn invoke<F>(&self, rule: RuleId, args: Value, f: F) -> Result<Value, MemoError>
    where
        F: FnOnce() -> Result<Value, MemoError>,
    {
        let call_sig = Self::call_sig(rule, &args);

        if let Some(result_sig) = self.memo.get(&call_sig)? {
            debug!(rule = rule.name, call_sig = %call_sig.to_hex(), result_sig = %result_sig.to_hex(), "memo hit");
            return Ok(load_value(&self.cas, &self.registry, &result_sig)?);
        }

        debug!(rule = rule.name, call_sig = %call_sig.to_hex(), "memo miss");
        let previous = {
            let mut current = self.current_call_hash.lock();
            let previous = current.clone();
            *current = Some(call_sig.clone());
            previous
        };
        let outcome = f();
        *self.current_call_hash.lock() = previous;

        let value = outcome?;
        let result_sig = store_value(&self.cas, &value)?;
        self.memo.put(&call_sig, &result_sig)?;
        debug!(rule = rule.name, call_sig = %call_sig.to_hex(), result_sig = %result_sig.to_hex(), "memo store");
        Ok(value)
    }

    /// Number of memoized invocations recorded (diagnostic use, e.g.
    /// `buildhash stat`).
    pub fn len(&self) -> Result<u64, MemoError> {
        self.memo.len()
    }

    /// Look up a memoized result without invoking the rule (spec recovered
    /// from `examples/original_source/memo.py`'s module-level `get()`).
    /// Raises [`MemoError::NotFound`] if absent.
    pub fn peek(&self, rule: RuleId, args: Value) -> Result<Value, MemoError> {
        let call_sig = Self::call_sig(rule, &args);
        match self.memo.get(&call_sig)? {
            Some(result_sig) => Ok(load_value(&self.cas, &self.registry, &result_sig)?),
            None => Err(MemoError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::tempdir;

    fn memoizer(tmp: &FsPath) -> Memoizer {
        let cas = Arc::new(CasStore::open(tmp.join("cas")).unwrap());
        Memoizer::open(&tmp.join("memo_db"), cas, Registry::new()).unwrap()
    }

    fn no_args() -> Value {
        Value::Tuple(vec![Value::List(vec![]), Value::Map(vec![])])
    }

    #[test]
    fn repeated_call_with_same_args_is_a_hit() {
        let tmp = tempdir().unwrap();
        let m = memoizer(tmp.path());
        let rule = RuleId::new("trivial", 1);
        let calls = Cell::new(0);

        let run = || {
            m.invoke(rule, no_args(), || {
                calls.set(calls.get() + 1);
                Ok(Value::Int(1))
            })
        };

        assert_eq!(run().unwrap(), Value::Int(1));
        assert_eq!(run().unwrap(), Value::Int(1));
        assert_eq!(calls.get(), 1, "second call must be a cache hit, not a re-run");
    }

    #[test]
    fn different_args_get_independent_cache_entries() {
        let tmp = tempdir().unwrap();
        let m = memoizer(tmp.path());
        let rule = RuleId::new("inc", 1);
        let calls = Cell::new(0);

        let run = |n: i128| {
            let args = Value::Tuple(vec![Value::List(vec![Value::Int(n)]), Value::Map(vec![])]);
            m.invoke(rule, args, || {
                calls.set(calls.get() + 1);
                Ok(Value::Int(n + 1))
            })
        };

        assert_eq!(run(1).unwrap(), Value::Int(2));
        assert_eq!(run(2).unwrap(), Value::Int(3));
        assert_eq!(run(1).unwrap(), Value::Int(2));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn nested_invocation_shares_inner_memo_entry_across_two_calls() {
        // Mirrors the spec's trivial/trivial2 scenario: trivial2() calls
        // trivial() twice; within one outer evaluation the second call to
        // trivial() is itself a hit.
        let tmp = tempdir().unwrap();
        let m = memoizer(tmp.path());
        let trivial = RuleId::new("trivial", 1);
        let trivial_calls = Cell::new(0);

        let call_trivial = || {
            m.invoke(trivial, no_args(), || {
                trivial_calls.set(trivial_calls.get() + 1);
                Ok(Value::Int(1))
            })
        };

        let a = call_trivial().unwrap();
        let b = call_trivial().unwrap();
        assert_eq!((a, b), (Value::Int(1), Value::Int(1)));
        assert_eq!(trivial_calls.get(), 1);
    }

    #[test]
    fn build_error_is_not_cached_and_retries_next_call() {
        let tmp = tempdir().unwrap();
        let m = memoizer(tmp.path());
        let rule = RuleId::new("flaky", 1);
        let calls = Cell::new(0);

        #[derive(Debug, thiserror::Error)]
        #[error("boom")]
        struct Boom;

        let run = || {
            m.invoke(rule, no_args(), || {
                calls.set(calls.get() + 1);
                if calls.get() == 1 {
                    Err(MemoError::build(Boom))
                } else {
                    Ok(Value::Int(9))
                }
            })
        };

        assert!(run().is_err());
        assert_eq!(run().unwrap(), Value::Int(9));
        assert_eq!(calls.get(), 2, "a failed build must not be cached");
    }

    #[test]
    fn current_call_hash_is_bound_during_miss_and_cleared_after() {
        let tmp = tempdir().unwrap();
        let m = memoizer(tmp.path());
        let rule = RuleId::new("reads_hash", 1);
        assert!(m.current_call_hash().is_none());

        let seen_inside = Cell::new(false);
        m.invoke(rule, no_args(), || {
            seen_inside.set(m.current_call_hash().is_some());
            Ok(Value::Unit)
        })
        .unwrap();

        assert!(seen_inside.get());
        assert!(m.current_call_hash().is_none());
    }

    #[test]
    fn peek_finds_a_prior_result_without_invoking() {
        let tmp = tempdir().unwrap();
        let m = memoizer(tmp.path());
        let rule = RuleId::new("cacheable", 1);
        m.invoke(rule, no_args(), || Ok(Value::Int(5))).unwrap();
        assert_eq!(m.peek(rule, no_args()).unwrap(), Value::Int(5));
    }

    #[test]
    fn peek_is_not_found_for_an_uncalled_rule() {
        let tmp = tempdir().unwrap();
        let m = memoizer(tmp.path());
        let rule = RuleId::new("never_called", 1);
        assert!(matches!(m.peek(rule, no_args()), Err(MemoError::NotFound)));
    }

    #[test]
    fn rule_version_bump_invalidates_cache() {
        let tmp = tempdir().unwrap();
        let m = memoizer(tmp.path());
        let v1 = RuleId::new("versioned", 1);
        let v2 = RuleId::new("versioned", 2);
        let calls = Cell::new(0);
        let run = |rule| {
            m.invoke(rule, no_args(), || {
                calls.set(calls.get() + 1);
                Ok(Value::Int(1))
            })
        };
        run(v1).unwrap();
        run(v2).unwrap();
        assert_eq!(calls.get(), 2, "different rule versions must not share a cache entry");
    }
}
