//! Integration test: memoization determinism across a process-like reopen
//! (spec.md §8, property 4) — once a call is recorded as (miss, store), a
//! freshly opened `Memoizer` over the same on-disk root returns the stored
//! result without invoking the rule body again.

use std::cell::Cell;
use std::sync::Arc;

use buildhash_cas::CasStore;
use buildhash_memo::Memoizer;
use buildhash_value::{Registry, RuleId, Value};

fn no_args() -> Value {
    Value::Tuple(vec![Value::List(vec![]), Value::Map(vec![])])
}

fn open(root: &std::path::Path) -> Memoizer {
    let cas = Arc::new(CasStore::open(root.join("cas")).unwrap());
    Memoizer::open(&root.join("cas").join("memo_db"), cas, Registry::new()).unwrap()
}

#[test]
fn result_recorded_in_one_process_is_a_hit_in_a_freshly_opened_memoizer() {
    let tmp = tempfile::tempdir().unwrap();
    let rule = RuleId::new("trivial", 1);

    {
        let memo = open(tmp.path());
        let result = memo.invoke(rule, no_args(), || Ok(Value::Int(1))).unwrap();
        assert_eq!(result, Value::Int(1));
    }

    let memo2 = open(tmp.path());
    let calls = Cell::new(0);
    let result = memo2
        .invoke(rule, no_args(), || {
            calls.set(calls.get() + 1);
            Ok(Value::Int(999))
        })
        .unwrap();

    assert_eq!(result, Value::Int(1), "must replay the previously stored result");
    assert_eq!(calls.get(), 0, "body must not run on a cross-process memo hit");
}

#[test]
fn peek_across_a_reopen_sees_the_prior_process_store() {
    let tmp = tempfile::tempdir().unwrap();
    let rule = RuleId::new("cacheable", 1);

    {
        let memo = open(tmp.path());
        memo.invoke(rule, no_args(), || Ok(Value::str("result"))).unwrap();
    }

    let memo2 = open(tmp.path());
    assert_eq!(memo2.peek(rule, no_args()).unwrap(), Value::str("result"));
}
