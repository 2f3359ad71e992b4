//! Integration test: the "cp a source file to out.txt twice, then cat both
//! copies" scenario from spec.md §8. The two `cp` invocations share a memo
//! entry (the rule body only ever runs once), and the memoized `cat`
//! produces a value whose bytes are the source content concatenated with
//! itself.

use std::cell::Cell;
use std::fs;

use buildhash_engine::{Config, Engine, EngineError};
use buildhash_value::{Registry, RuleId, Value};

fn config(tmp: &std::path::Path) -> Config {
    Config {
        db_root: tmp.to_string_lossy().into_owned(),
        src_root: "{db_root}/src".to_string(),
        gen_root: "{db_root}/gen".to_string(),
        cas_root: "{db_root}/cas".to_string(),
        out_root: "{db_root}/out".to_string(),
    }
}

/// Memoized "cp": reads `src_root/name` and returns its bytes. `calls`
/// counts actual body executions so the test can assert a shared memo
/// entry rather than just equal return values.
fn cp(engine: &Engine, name: &str, calls: &Cell<u32>) -> Result<Value, EngineError> {
    let args = Value::Tuple(vec![Value::List(vec![Value::str(name)]), Value::Map(vec![])]);
    let result = engine.with_memoizer(|m| {
        m.invoke(RuleId::new("cp", 1), args, || {
            calls.set(calls.get() + 1);
            let path = engine.roots().src_root.join(name);
            let bytes = fs::read(&path).map_err(buildhash_memo::MemoError::build)?;
            Ok(Value::bytes(bytes))
        })
    });
    Ok(result?)
}

/// Memoized "cat": concatenates two already-produced byte values.
fn cat(engine: &Engine, a: Value, b: Value, calls: &Cell<u32>) -> Result<Value, EngineError> {
    let args = Value::Tuple(vec![Value::List(vec![a.clone(), b.clone()]), Value::Map(vec![])]);
    let result = engine.with_memoizer(|m| {
        m.invoke(RuleId::new("cat", 1), args, || {
            calls.set(calls.get() + 1);
            let (Value::Bytes(a_bytes), Value::Bytes(b_bytes)) = (&a, &b) else {
                unreachable!("cat expects two byte values")
            };
            let mut out = a_bytes.clone();
            out.extend_from_slice(b_bytes);
            Ok(Value::bytes(out))
        })
    });
    Ok(result?)
}

#[test]
fn cp_twice_then_cat_shares_the_cp_memo_entry() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir_all(tmp.path().join("src")).unwrap();
    fs::write(tmp.path().join("src/hello.txt"), b"hello world\n").unwrap();

    let engine = Engine::init(config(tmp.path()), Registry::new()).unwrap();
    let cp_calls = Cell::new(0);
    let cat_calls = Cell::new(0);

    let copy1 = cp(&engine, "hello.txt", &cp_calls).unwrap();
    let copy2 = cp(&engine, "hello.txt", &cp_calls).unwrap();
    assert_eq!(cp_calls.get(), 1, "the two cp invocations must share one memo entry");

    let concatenated = cat(&engine, copy1, copy2, &cat_calls).unwrap();
    assert_eq!(cat_calls.get(), 1);
    match concatenated {
        Value::Bytes(bytes) => assert_eq!(bytes, b"hello world\nhello world\n"),
        other => panic!("expected bytes, got {other:?}"),
    }

    engine.uninit();
}
