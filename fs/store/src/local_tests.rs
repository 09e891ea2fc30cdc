// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use testutil::TestData;

use crate::local::ByteStore;
use crate::{EntryType, ShrinkBehavior};

fn new_byte_store(dir: &tempfile::TempDir) -> ByteStore {
    ByteStore::new(task_executor::Executor::new(), dir.path()).unwrap()
}

async fn load_bytes(store: &ByteStore, digest: hashing::Digest) -> Option<bytes::Bytes> {
    store
        .load_bytes_with(EntryType::File, digest, |bytes: &[u8]| {
            Ok(bytes::Bytes::copy_from_slice(bytes))
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn store_and_load_roundtrip() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = new_byte_store(&dir);
    let testdata = TestData::catnip();

    let digest = store
        .store_bytes(EntryType::File, None, testdata.bytes(), false)
        .await
        .unwrap();
    assert_eq!(digest, testdata.digest());
    assert_eq!(load_bytes(&store, digest).await, Some(testdata.bytes()));
}

#[tokio::test]
async fn storing_the_same_bytes_twice_is_a_noop() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = new_byte_store(&dir);
    let testdata = TestData::catnip();

    let digest1 = store
        .store_bytes(EntryType::File, None, testdata.bytes(), false)
        .await
        .unwrap();
    let digest2 = store
        .store_bytes(EntryType::File, None, testdata.bytes(), false)
        .await
        .unwrap();
    assert_eq!(digest1, digest2);
}

#[tokio::test]
async fn load_missing_is_none() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = new_byte_store(&dir);
    assert_eq!(load_bytes(&store, TestData::catnip().digest()).await, None);
}

#[tokio::test]
async fn empty_digest_is_always_loadable() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = new_byte_store(&dir);
    assert_eq!(
        load_bytes(&store, hashing::EMPTY_DIGEST).await,
        Some(bytes::Bytes::new())
    );
}

#[tokio::test]
async fn file_and_directory_shards_are_disjoint() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = new_byte_store(&dir);
    let testdata = TestData::catnip();

    store
        .store_bytes(EntryType::File, None, testdata.bytes(), false)
        .await
        .unwrap();
    let loaded_as_directory = store
        .load_bytes_with(EntryType::Directory, testdata.digest(), |bytes: &[u8]| {
            Ok(bytes.len())
        })
        .await
        .unwrap();
    assert_eq!(loaded_as_directory, None);
}

#[tokio::test]
async fn persisted_layout_is_sharded_by_fingerprint_prefix() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = new_byte_store(&dir);
    let testdata = TestData::catnip();

    store
        .store_bytes(EntryType::File, None, testdata.bytes(), false)
        .await
        .unwrap();

    let hex = testdata.fingerprint().to_hex();
    let expected = dir.path().join("files").join(&hex[0..2]).join(&hex);
    assert!(expected.is_file(), "Expected {expected:?} to exist");
}

#[tokio::test]
async fn corrupted_bytes_are_treated_as_missing() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = new_byte_store(&dir);
    let testdata = TestData::catnip();

    let digest = store
        .store_bytes(EntryType::File, None, testdata.bytes(), false)
        .await
        .unwrap();

    // Corrupt the stored file behind the store's back.
    let hex = testdata.fingerprint().to_hex();
    let path = dir.path().join("files").join(&hex[0..2]).join(&hex);
    let mut permissions = std::fs::metadata(&path).unwrap().permissions();
    use std::os::unix::fs::PermissionsExt;
    permissions.set_mode(0o644);
    std::fs::set_permissions(&path, permissions).unwrap();
    std::fs::write(&path, b"corrupt").unwrap();

    assert_eq!(load_bytes(&store, digest).await, None);
    assert!(!path.exists(), "The corrupt entry should have been removed");
}

#[tokio::test]
async fn store_from_file_verifies_content() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = new_byte_store(&dir);
    let testdata = TestData::catnip();

    let src = dir.path().join("src.txt");
    std::fs::write(&src, testdata.bytes()).unwrap();

    // A matching digest ingests successfully.
    let digest = store
        .store_file(EntryType::File, false, Some(testdata.digest()), src.clone())
        .await
        .unwrap();
    assert_eq!(load_bytes(&store, digest).await, Some(testdata.bytes()));

    // A mismatched expected digest is rejected.
    let other = TestData::robin();
    store
        .store_file(EntryType::File, false, Some(other.digest()), src)
        .await
        .expect_err("want err");
}

#[tokio::test]
async fn shrink_evicts_unleased_entries() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = new_byte_store(&dir);
    let testdata = TestData::catnip();

    store
        .store_bytes(EntryType::File, None, testdata.bytes(), false)
        .await
        .unwrap();
    let size = store.shrink(0, ShrinkBehavior::Fast).await.unwrap();
    assert_eq!(size, 0);
    assert_eq!(load_bytes(&store, testdata.digest()).await, None);
}

#[tokio::test]
async fn shrink_spares_leased_entries() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = new_byte_store(&dir);
    let testdata = TestData::catnip();

    let digest = store
        .store_bytes(EntryType::File, None, testdata.bytes(), true)
        .await
        .unwrap();
    let size = store.shrink(0, ShrinkBehavior::Fast).await.unwrap();
    assert_eq!(size, testdata.len());
    assert_eq!(load_bytes(&store, digest).await, Some(testdata.bytes()));

    // Releasing the lease makes the entry evictable.
    store.release_all(std::iter::once(digest));
    let size = store.shrink(0, ShrinkBehavior::Fast).await.unwrap();
    assert_eq!(size, 0);
}

#[tokio::test]
async fn removed_entries_can_be_restored() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = new_byte_store(&dir);
    let testdata = TestData::catnip();

    let digest = store
        .store_bytes(EntryType::File, None, testdata.bytes(), false)
        .await
        .unwrap();
    assert!(store.remove(EntryType::File, digest).await.unwrap());
    assert_eq!(load_bytes(&store, digest).await, None);

    store
        .store_bytes(EntryType::File, None, testdata.bytes(), false)
        .await
        .unwrap();
    assert_eq!(load_bytes(&store, digest).await, Some(testdata.bytes()));
}
