// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;
use std::sync::Arc;

use fs::{
    Dir, File, GitignoreStyleExcludes, GlobExpansionConjunction, PathGlobs, PathStat, PosixFS,
    StrictGlobMatching,
};
use hashing::EMPTY_DIGEST;
use testutil::TestDirectory;

use crate::{OneOffStoreFileByDigest, Snapshot, Store};

fn setup(dir: &tempfile::TempDir) -> (Store, Arc<PosixFS>, OneOffStoreFileByDigest) {
    let store = Store::local_only(
        task_executor::Executor::new(),
        dir.path().join("store"),
    )
    .unwrap();
    let build_root = dir.path().join("build_root");
    std::fs::create_dir_all(&build_root).unwrap();
    let posix_fs = Arc::new(
        PosixFS::new(
            build_root,
            GitignoreStyleExcludes::empty(),
            task_executor::Executor::new(),
        )
        .unwrap(),
    );
    let digester = OneOffStoreFileByDigest::new(store.clone(), posix_fs.clone(), false);
    (store, posix_fs, digester)
}

fn path_globs(globs: &[&str]) -> fs::PreparedPathGlobs {
    PathGlobs::new(
        globs.iter().map(|s| s.to_string()).collect(),
        StrictGlobMatching::Ignore,
        GlobExpansionConjunction::AllMatch,
    )
    .parse()
    .unwrap()
}

#[tokio::test]
async fn empty_snapshot() {
    let snapshot = Snapshot::empty();
    assert_eq!(snapshot.digest, EMPTY_DIGEST);
    assert!(snapshot.files().is_empty());
}

#[tokio::test]
async fn capture_files() {
    let dir = tempfile::TempDir::new().unwrap();
    let (_store, posix_fs, digester) = setup(&dir);
    let build_root = dir.path().join("build_root");
    std::fs::create_dir_all(build_root.join("pets")).unwrap();
    testutil::file::contents(&build_root.join("pets/feed.txt"), "catnip");

    let snapshot = Snapshot::capture(digester, &posix_fs, path_globs(&["pets/*.txt"]))
        .await
        .unwrap();
    assert_eq!(snapshot.digest, TestDirectory::nested().digest());
    assert_eq!(snapshot.files(), vec![PathBuf::from("pets/feed.txt")]);
}

#[tokio::test]
async fn capture_is_deterministic() {
    let dir = tempfile::TempDir::new().unwrap();
    let (_store, posix_fs, digester) = setup(&dir);
    let build_root = dir.path().join("build_root");
    testutil::file::contents(&build_root.join("a.txt"), "aaa");
    testutil::file::contents(&build_root.join("b.txt"), "bbb");

    let capture = |digester: OneOffStoreFileByDigest, posix_fs: Arc<PosixFS>| async move {
        Snapshot::capture(digester, &posix_fs, path_globs(&["*.txt"]))
            .await
            .unwrap()
            .digest
    };
    let digest1 = capture(digester.clone(), posix_fs.clone()).await;
    let digest2 = capture(digester, posix_fs).await;
    assert_eq!(digest1, digest2);
}

#[tokio::test]
async fn from_path_stats_matches_fixture() {
    let dir = tempfile::TempDir::new().unwrap();
    let (_store, _posix_fs, digester) = setup(&dir);
    let build_root = dir.path().join("build_root");
    testutil::file::contents(&build_root.join("feed.txt"), "catnip");

    let path_stats = vec![PathStat::file(
        PathBuf::from("feed.txt"),
        File {
            path: PathBuf::from("feed.txt"),
            is_executable: false,
        },
    )];
    let snapshot = Snapshot::from_path_stats(digester, path_stats).await.unwrap();
    assert_eq!(snapshot.digest, TestDirectory::containing_catnip().digest());
}

#[tokio::test]
async fn empty_directories_are_captured() {
    let dir = tempfile::TempDir::new().unwrap();
    let (_store, _posix_fs, digester) = setup(&dir);

    let path_stats = vec![PathStat::dir(
        PathBuf::from("empty"),
        Dir(PathBuf::from("empty")),
    )];
    let snapshot = Snapshot::from_path_stats(digester, path_stats).await.unwrap();
    assert_ne!(snapshot.digest, EMPTY_DIGEST);
    assert_eq!(snapshot.directories(), vec![PathBuf::from("empty")]);
}

#[tokio::test]
async fn snapshot_from_digest_roundtrips() {
    let dir = tempfile::TempDir::new().unwrap();
    let (store, posix_fs, digester) = setup(&dir);
    let build_root = dir.path().join("build_root");
    testutil::file::contents(&build_root.join("feed.txt"), "catnip");

    let snapshot = Snapshot::capture(digester, &posix_fs, path_globs(&["*.txt"]))
        .await
        .unwrap();
    store
        .ensure_directory_digest_persisted(snapshot.directory_digest())
        .await
        .unwrap();

    // Reload purely from the persisted digest.
    let reloaded = Snapshot::from_digest(
        store,
        fs::DirectoryDigest::from_persisted_digest(snapshot.digest),
    )
    .await
    .unwrap();
    assert_eq!(reloaded, snapshot);
}
