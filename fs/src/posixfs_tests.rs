// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{Dir, File, GitignoreStyleExcludes, Link, PosixFS, Stat};

fn setup(dir: &tempfile::TempDir) -> Arc<PosixFS> {
    Arc::new(
        PosixFS::new(
            dir.path(),
            GitignoreStyleExcludes::empty(),
            task_executor::Executor::new(),
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn scandir_empty() {
    let dir = tempfile::TempDir::new().unwrap();
    let fs = setup(&dir);
    let listing = fs.scandir(Dir(PathBuf::new())).await.unwrap();
    assert!(listing.0.is_empty());
}

#[tokio::test]
async fn scandir_sorts_and_stats() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("subdir")).unwrap();
    std::fs::write(dir.path().join("zed.txt"), b"z").unwrap();
    std::fs::write(dir.path().join("alpha.txt"), b"a").unwrap();
    std::os::unix::fs::symlink("alpha.txt", dir.path().join("link")).unwrap();

    let fs = setup(&dir);
    let listing = fs.scandir(Dir(PathBuf::new())).await.unwrap();
    assert_eq!(
        listing.0,
        vec![
            Stat::File(File {
                path: PathBuf::from("alpha.txt"),
                is_executable: false,
            }),
            Stat::Link(Link {
                path: PathBuf::from("link"),
                target: PathBuf::from("alpha.txt"),
            }),
            Stat::Dir(Dir(PathBuf::from("subdir"))),
            Stat::File(File {
                path: PathBuf::from("zed.txt"),
                is_executable: false,
            }),
        ]
    );
}

#[tokio::test]
async fn scandir_respects_ignores() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("kept.txt"), b"kept").unwrap();
    std::fs::write(dir.path().join("ignored.pyc"), b"ignored").unwrap();

    let fs = Arc::new(
        PosixFS::new(
            dir.path(),
            GitignoreStyleExcludes::create(vec!["*.pyc".to_owned()]).unwrap(),
            task_executor::Executor::new(),
        )
        .unwrap(),
    );
    let listing = fs.scandir(Dir(PathBuf::new())).await.unwrap();
    assert_eq!(
        listing
            .0
            .iter()
            .map(|stat| stat.path().to_owned())
            .collect::<Vec<_>>(),
        vec![PathBuf::from("kept.txt")]
    );
}

#[tokio::test]
async fn executable_bit_is_preserved() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("script.sh");
    std::fs::write(&path, b"#!/bin/sh").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let fs = setup(&dir);
    let stat = fs.stat_sync(Path::new("script.sh")).unwrap().unwrap();
    assert_eq!(
        stat,
        Stat::File(File {
            path: PathBuf::from("script.sh"),
            is_executable: true,
        })
    );
}

#[tokio::test]
async fn read_link_relativizes() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/target.txt"), b"t").unwrap();
    std::os::unix::fs::symlink("target.txt", dir.path().join("sub/link")).unwrap();

    let fs = setup(&dir);
    let destination = fs
        .read_link(&Link {
            path: PathBuf::from("sub/link"),
            target: PathBuf::from("target.txt"),
        })
        .await
        .unwrap();
    assert_eq!(destination, PathBuf::from("sub/target.txt"));
}

#[tokio::test]
async fn read_link_rejects_absolute() {
    let dir = tempfile::TempDir::new().unwrap();
    std::os::unix::fs::symlink("/etc/hosts", dir.path().join("link")).unwrap();

    let fs = setup(&dir);
    fs.read_link(&Link {
        path: PathBuf::from("link"),
        target: PathBuf::from("/etc/hosts"),
    })
    .await
    .expect_err("want err");
}

#[tokio::test]
async fn stat_missing_is_none() {
    let dir = tempfile::TempDir::new().unwrap();
    let fs = setup(&dir);
    assert!(fs.stat_sync(Path::new("nope.txt")).unwrap().is_none());
}
