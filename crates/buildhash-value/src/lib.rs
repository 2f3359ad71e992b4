//! Canonical serialization of structured build values and the content
//! signing built on top of it.
//!
//! [`Value`] is the closed sum type every argument, result, and config
//! entry in the build graph is expressed as. Signing a `Value` recurses
//! into a `(type key, parts)` decomposition and combines sub-digests with
//! [`buildhash_digest::hcat`] — see [`sig`].

use std::collections::{HashMap, HashSet};

use buildhash_digest::{decode_int, encode_int, hash_bytes, hcat, Sig};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValueError {
    #[error("global reference {module}::{name} is not in the registry whitelist")]
    NotWhitelisted { module: String, name: String },
    #[error("unknown type key {0:?}")]
    UnknownTypeKey(Vec<u8>),
    #[error("malformed parts for type key {0:?}")]
    MalformedParts(&'static str),
    #[error("string is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Digest(#[from] buildhash_digest::DigestError),
}

/// A named top-level value the host has opted into signing by name: a
/// module path and a symbol within it. Only constructible through
/// [`Registry::resolve`], which enforces the whitelist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalRef {
    pub module: String,
    pub name: String,
}

/// The closed set of structured values that can be content-signed.
///
/// `Map` entries are stored as a plain list rather than a `HashMap` so that
/// construction order doesn't leak into equality; canonical key order is
/// imposed at signing time, not at construction time.
#[derive(Debug, Clone)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i128),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Sig(Sig),
    Global(GlobalRef),
    Struct(GlobalRef, Vec<(String, Value)>),
}

/// `Map` and `Struct` compare order-insensitively: canonical order is
/// imposed at signing/serialization time (see `decompose`'s `Map`/`Struct`
/// branches), not at construction time, so two maps built with the same
/// entries in different orders — or a map reconstructed from storage, whose
/// entries come back pre-sorted — must compare equal.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => {
                if a.len() != b.len() {
                    return false;
                }
                let mut a = a.clone();
                let mut b = b.clone();
                a.sort_by(|(k1, _), (k2, _)| map_key_cmp(k1, k2));
                b.sort_by(|(k1, _), (k2, _)| map_key_cmp(k1, k2));
                a == b
            }
            (Value::Sig(a), Value::Sig(b)) => a == b,
            (Value::Global(a), Value::Global(b)) => a == b,
            (Value::Struct(t1, a1), Value::Struct(t2, a2)) => {
                if t1 != t2 || a1.len() != a2.len() {
                    return false;
                }
                let mut a1 = a1.clone();
                let mut a2 = a2.clone();
                a1.sort_by(|(n1, _), (n2, _)| n1.cmp(n2));
                a2.sort_by(|(n1, _), (n2, _)| n1.cmp(n2));
                a1 == a2
            }
            _ => false,
        }
    }
}

impl Value {
    #[must_use]
    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    #[must_use]
    pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(b.into())
    }
}

/// Explicit whitelist of module-qualified names that may be referenced as
/// a [`GlobalRef`]. Stands in for the dynamic `__module__`/`__name__`
/// introspection of a reflective host language, which Rust has no analogue
/// for: callers register the symbols they want stable cross-run identity
/// for, up front.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    modules: HashMap<String, HashSet<String>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn allow(&mut self, module: impl Into<String>, name: impl Into<String>) -> &mut Self {
        self.modules
            .entry(module.into())
            .or_default()
            .insert(name.into());
        self
    }

    #[must_use]
    pub fn is_allowed(&self, module: &str, name: &str) -> bool {
        self.modules
            .get(module)
            .is_some_and(|names| names.contains(name))
    }

    pub fn resolve(
        &self,
        module: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<GlobalRef, ValueError> {
        let module = module.into();
        let name = name.into();
        if self.is_allowed(&module, &name) {
            Ok(GlobalRef { module, name })
        } else {
            Err(ValueError::NotWhitelisted { module, name })
        }
    }
}

/// Stable identity for a memoized rule, supplied at registration time.
///
/// Replaces signing a function by hashing its compiled bytecode: there is
/// no introspectable bytecode to hash at this layer, and the prototype this
/// is descended from flags that approach as an approximation anyway (it
/// over-collects referenced globals by scanning raw name loads). A rule
/// author names their rule and bumps `version` when its behavior changes in
/// a way that should invalidate memoized results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleId {
    pub name: &'static str,
    pub version: u32,
}

impl RuleId {
    #[must_use]
    pub fn new(name: &'static str, version: u32) -> Self {
        RuleId { name, version }
    }

    #[must_use]
    pub fn to_value(self) -> Value {
        Value::Tuple(vec![
            Value::str(self.name),
            Value::Int(i128::from(self.version)),
        ])
    }
}

/// A value paired with its already-computed digest, for host values whose
/// identity is cheaper to assert than to recompute (e.g. a test fixture
/// standing in for a rule with a fabricated identity).
#[derive(Debug, Clone)]
pub struct KnownSig<T> {
    pub value: T,
    pub sig: Sig,
}

impl<T> KnownSig<T> {
    #[must_use]
    pub fn new(value: T, sig: Sig) -> Self {
        KnownSig { value, sig }
    }
}

impl KnownSig<Value> {
    #[must_use]
    pub fn of(value: Value) -> Self {
        let s = sig(&value);
        KnownSig { value, sig: s }
    }
}

const KEY_UNIT: &[u8] = b"";
const KEY_FALSE: &[u8] = b"f";
const KEY_TRUE: &[u8] = b"t";
const KEY_INT: &[u8] = b"i";
const KEY_STR: &[u8] = b"s";
const KEY_LIST: &[u8] = b"L";
const KEY_TUPLE: &[u8] = b"T";
const KEY_MAP: &[u8] = b"D";
const KEY_SIG: &[u8] = b"S";
const KEY_GLOBAL: &[u8] = b"G";

/// Decompose a non-leaf value into its type-key value and its ordered
/// parts. Returns `None` for `Value::Bytes`, which signs as an opaque leaf
/// rather than a compound of (key, parts).
///
/// Exposed so a CAS-aware caller can walk the same decomposition while
/// persisting long-form bodies as it recurses (see `sig`, which performs
/// the pure, non-persisting variant of the same walk).
#[must_use]
pub fn decompose(v: &Value) -> Option<(Value, Vec<Value>)> {
    match v {
        Value::Unit => Some((Value::bytes(KEY_UNIT), vec![])),
        Value::Bool(false) => Some((Value::bytes(KEY_FALSE), vec![])),
        Value::Bool(true) => Some((Value::bytes(KEY_TRUE), vec![])),
        Value::Int(i) => Some((Value::bytes(KEY_INT), vec![Value::bytes(encode_int(*i))])),
        Value::Str(s) => Some((
            Value::bytes(KEY_STR),
            vec![Value::bytes(s.as_bytes().to_vec())],
        )),
        Value::Bytes(_) => None,
        Value::List(items) => Some((Value::bytes(KEY_LIST), items.clone())),
        Value::Tuple(items) => Some((Value::bytes(KEY_TUPLE), items.clone())),
        Value::Map(pairs) => {
            let mut sorted: Vec<(&Value, &Value)> = pairs.iter().map(|(k, v)| (k, v)).collect();
            sorted.sort_by(|(a, _), (b, _)| map_key_cmp(a, b));
            let keys = sorted.iter().map(|(k, _)| (*k).clone()).collect();
            let vals = sorted.iter().map(|(_, v)| (*v).clone()).collect();
            Some((
                Value::bytes(KEY_MAP),
                vec![Value::List(keys), Value::List(vals)],
            ))
        }
        Value::Sig(s) => Some((
            Value::bytes(KEY_SIG),
            vec![Value::bytes(s.as_bytes().to_vec())],
        )),
        Value::Global(g) => Some((
            Value::bytes(KEY_GLOBAL),
            vec![Value::str(g.module.clone()), Value::str(g.name.clone())],
        )),
        Value::Struct(type_ref, attrs) => {
            let mut sorted = attrs.clone();
            sorted.sort_by(|(a, _), (b, _)| a.cmp(b));
            let names = sorted.iter().map(|(n, _)| Value::str(n.clone())).collect();
            let vals = sorted.iter().map(|(_, v)| v.clone()).collect();
            Some((
                Value::Global(type_ref.clone()),
                vec![Value::List(names), Value::List(vals)],
            ))
        }
    }
}

/// Canonical ordering for `Map` keys (spec §4.A): string keys sort by raw
/// UTF-8 byte order; any other key type sorts by its own content digest,
/// after all string-keyed entries.
fn map_key_cmp(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Str(a), Value::Str(b)) => a.as_bytes().cmp(b.as_bytes()),
        (Value::Str(_), _) => Ordering::Less,
        (_, Value::Str(_)) => Ordering::Greater,
        (a, b) => sig(a).as_bytes().cmp(sig(b).as_bytes()),
    }
}

/// Content-sign a value: bytes leaves hash directly, everything else
/// recurses through its type key and parts and combines sub-digests with
/// `hcat`.
#[must_use]
pub fn sig(v: &Value) -> Sig {
    if let Value::Bytes(b) = v {
        return hash_bytes(b, 0);
    }
    let (type_val, parts) = decompose(v).expect("every Value variant decomposes or is Bytes");
    let type_sig = sig(&type_val);
    let mut sigs = Vec::with_capacity(parts.len() + 1);
    sigs.push(type_sig);
    sigs.extend(parts.iter().map(sig));
    hcat(&sigs).1
}

/// Reassemble a value from its already-resolved type-key value and parts.
/// The inverse of [`decompose`], used by a CAS-aware caller once it has
/// recursively resolved every sub-digest back into a `Value`.
pub fn reconstruct(
    registry: &Registry,
    type_val: &Value,
    mut parts: Vec<Value>,
) -> Result<Value, ValueError> {
    match type_val {
        Value::Bytes(key) => match key.as_slice() {
            KEY_UNIT => Ok(Value::Unit),
            KEY_FALSE => Ok(Value::Bool(false)),
            KEY_TRUE => Ok(Value::Bool(true)),
            KEY_INT => {
                let body = take_bytes(&mut parts, "i")?;
                Ok(Value::Int(decode_int(&body)))
            }
            KEY_STR => {
                let body = take_bytes(&mut parts, "s")?;
                Ok(Value::Str(String::from_utf8(body)?))
            }
            KEY_LIST => Ok(Value::List(parts)),
            KEY_TUPLE => Ok(Value::Tuple(parts)),
            KEY_MAP => {
                if parts.len() != 2 {
                    return Err(ValueError::MalformedParts("D"));
                }
                let vals = parts.pop().unwrap();
                let keys = parts.pop().unwrap();
                let (Value::List(keys), Value::List(vals)) = (keys, vals) else {
                    return Err(ValueError::MalformedParts("D"));
                };
                Ok(Value::Map(keys.into_iter().zip(vals).collect()))
            }
            KEY_SIG => {
                let body = take_bytes(&mut parts, "S")?;
                Ok(Value::Sig(Sig::from_raw(body)?))
            }
            KEY_GLOBAL => {
                if parts.len() != 2 {
                    return Err(ValueError::MalformedParts("G"));
                }
                let name = take_str(&mut parts, "G")?;
                let module = take_str(&mut parts, "G")?;
                Ok(Value::Global(registry.resolve(module, name)?))
            }
            other => Err(ValueError::UnknownTypeKey(other.to_vec())),
        },
        Value::Global(type_ref) => {
            if parts.len() != 2 {
                return Err(ValueError::MalformedParts("Struct"));
            }
            let vals = parts.pop().unwrap();
            let names = parts.pop().unwrap();
            let (Value::List(names), Value::List(vals)) = (names, vals) else {
                return Err(ValueError::MalformedParts("Struct"));
            };
            let attrs = names
                .into_iter()
                .zip(vals)
                .map(|(n, v)| match n {
                    Value::Str(s) => Ok((s, v)),
                    _ => Err(ValueError::MalformedParts("Struct")),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Struct(type_ref.clone(), attrs))
        }
        _ => Err(ValueError::MalformedParts("type key")),
    }
}

fn take_bytes(parts: &mut Vec<Value>, key: &'static str) -> Result<Vec<u8>, ValueError> {
    match parts.pop() {
        Some(Value::Bytes(b)) if parts.is_empty() => Ok(b),
        _ => Err(ValueError::MalformedParts(key)),
    }
}

fn take_str(parts: &mut Vec<Value>, key: &'static str) -> Result<String, ValueError> {
    match parts.pop() {
        Some(Value::Str(s)) => Ok(s),
        _ => Err(ValueError::MalformedParts(key)),
    }
}
