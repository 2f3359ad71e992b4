//! Integration test: the CAS round-trip properties from spec.md §8
//! (properties 1 and 2), including the long-form case surviving a fresh
//! open of the same on-disk root (simulating a new process).

use buildhash_cas::CasStore;
use buildhash_digest::hash_bytes;

#[test]
fn short_bodies_round_trip_without_any_storage() {
    let tmp = tempfile::tempdir().unwrap();
    let cas = CasStore::open(tmp.path().join("cas")).unwrap();

    for data in [&b""[..], b"a", b"short body under 32 bytes!!"] {
        let sig = hash_bytes(data, 0);
        assert!(!sig.is_long(), "{} bytes should take the short-body path", data.len());
        assert!(cas.contains(&sig));
        assert_eq!(cas.fetch(&sig).unwrap(), data);
    }
}

#[test]
fn long_bodies_survive_a_fresh_open_of_the_same_root() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("cas");
    let data = vec![0x99u8; 10_000];

    let sig = {
        let cas = CasStore::open(&root).unwrap();
        let sig = hash_bytes(&data, 0);
        assert!(!cas.contains(&sig));
        cas.store(&sig, &data).unwrap();
        sig
    };

    // A fresh `CasStore` over the same root stands in for a new process.
    let cas2 = CasStore::open(&root).unwrap();
    assert!(cas2.contains(&sig));
    assert_eq!(cas2.fetch(&sig).unwrap(), data);
}

#[test]
fn store_file_is_idempotent_across_reopens() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("cas");
    let src = tmp.path().join("source.bin");
    std::fs::write(&src, vec![0x42u8; 5000]).unwrap();

    let sig1 = {
        let cas = CasStore::open(&root).unwrap();
        cas.store_file(&src, false, None).unwrap()
    };
    let sig2 = {
        let cas = CasStore::open(&root).unwrap();
        cas.store_file(&src, false, None).unwrap()
    };
    assert_eq!(sig1, sig2);
}
