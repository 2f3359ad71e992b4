//! Integration test: the nested-Tree materialization-determinism scenario
//! from spec.md §8 — `{"sub1": {"empty": "", "hello": "hello world\n"},
//! "sub2": same, "world": "hello world\n"}` materializes to the same
//! `cas_root/tree/` directory whether built once or rebuilt from scratch
//! against an independently opened `CasStore` over the same root.

use std::collections::BTreeMap;

use buildhash_cas::CasStore;
use buildhash_fs::{Blob, FsValue, Mode, Tree, ValidatedTrees};

fn leaf(bytes: &[u8]) -> FsValue {
    FsValue::Blob(Blob::from_bytes(bytes.to_vec(), Mode::Regular))
}

fn make_tree() -> Tree {
    let sub = Tree::new(BTreeMap::from([
        ("empty".to_string(), leaf(b"")),
        ("hello".to_string(), leaf(b"hello world\n")),
    ]));
    Tree::new(BTreeMap::from([
        ("sub1".to_string(), FsValue::Tree(sub.clone())),
        ("sub2".to_string(), FsValue::Tree(sub)),
        ("world".to_string(), leaf(b"hello world\n")),
    ]))
}

#[test]
fn same_tree_built_against_two_independent_cas_handles_materializes_identically() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("cas");

    let (path1, sig1) = {
        let cas = CasStore::open(&root).unwrap();
        let validated = ValidatedTrees::new();
        let tree = make_tree();
        (tree.fspath(&cas, &validated).unwrap(), tree.sig().clone())
    };
    let (path2, sig2) = {
        let cas = CasStore::open(&root).unwrap();
        let validated = ValidatedTrees::new();
        let tree = make_tree();
        (tree.fspath(&cas, &validated).unwrap(), tree.sig().clone())
    };

    assert_eq!(sig1, sig2, "construction order must not affect the tree digest");
    assert_eq!(path1, path2, "identical trees must materialize to the same directory");
    assert_eq!(std::fs::read_to_string(path1.join("sub1/hello")).unwrap(), "hello world\n");
    assert_eq!(std::fs::read_to_string(path1.join("sub2/hello")).unwrap(), "hello world\n");
    assert_eq!(std::fs::read_to_string(path2.join("world")).unwrap(), "hello world\n");
    assert_eq!(std::fs::read_to_string(path1.join("sub1/empty")).unwrap(), "");
}
