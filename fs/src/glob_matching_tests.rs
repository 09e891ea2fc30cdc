// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;
use std::sync::Arc;

use crate::{
    GitignoreStyleExcludes, GlobExpansionConjunction, GlobMatching, PathGlobs, PathStat, PosixFS,
    StrictGlobMatching, SymlinkBehavior,
};

async fn expand(dir: &tempfile::TempDir, globs: Vec<&str>) -> Result<Vec<PathBuf>, String> {
    expand_with_behavior(dir, globs, StrictGlobMatching::Ignore).await
}

async fn expand_with_behavior(
    dir: &tempfile::TempDir,
    globs: Vec<&str>,
    strict_match_behavior: StrictGlobMatching,
) -> Result<Vec<PathBuf>, String> {
    let fs = Arc::new(
        PosixFS::new(
            dir.path(),
            GitignoreStyleExcludes::empty(),
            task_executor::Executor::new(),
        )
        .unwrap(),
    );
    let path_globs = PathGlobs::new(
        globs.into_iter().map(str::to_owned).collect(),
        strict_match_behavior,
        GlobExpansionConjunction::AllMatch,
    )
    .parse()?;
    let path_stats = fs
        .expand_globs(path_globs, SymlinkBehavior::Oblivious, None)
        .await
        .map_err(|e| e.to_string())?;
    Ok(path_stats
        .into_iter()
        .map(|path_stat| path_stat.path().to_owned())
        .collect())
}

fn populate(dir: &tempfile::TempDir) {
    std::fs::create_dir_all(dir.path().join("src/a")).unwrap();
    std::fs::create_dir_all(dir.path().join("src/b/nested")).unwrap();
    std::fs::write(dir.path().join("root.txt"), b"").unwrap();
    std::fs::write(dir.path().join("src/a/first.py"), b"").unwrap();
    std::fs::write(dir.path().join("src/a/second.py"), b"").unwrap();
    std::fs::write(dir.path().join("src/b/third.py"), b"").unwrap();
    std::fs::write(dir.path().join("src/b/nested/fourth.py"), b"").unwrap();
}

#[tokio::test]
async fn literal() {
    let dir = tempfile::TempDir::new().unwrap();
    populate(&dir);
    assert_eq!(
        expand(&dir, vec!["root.txt"]).await.unwrap(),
        vec![PathBuf::from("root.txt")]
    );
}

#[tokio::test]
async fn single_star() {
    let dir = tempfile::TempDir::new().unwrap();
    populate(&dir);
    assert_eq!(
        expand(&dir, vec!["src/a/*.py"]).await.unwrap(),
        vec![
            PathBuf::from("src/a/first.py"),
            PathBuf::from("src/a/second.py"),
        ]
    );
}

#[tokio::test]
async fn double_star_recurses() {
    let dir = tempfile::TempDir::new().unwrap();
    populate(&dir);
    assert_eq!(
        expand(&dir, vec!["src/**/*.py"]).await.unwrap(),
        vec![
            PathBuf::from("src/a/first.py"),
            PathBuf::from("src/a/second.py"),
            PathBuf::from("src/b/nested/fourth.py"),
            PathBuf::from("src/b/third.py"),
        ]
    );
}

#[tokio::test]
async fn doublestar_matches_zero_directories() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("a")).unwrap();
    std::fs::write(dir.path().join("a/direct.py"), b"").unwrap();
    assert_eq!(
        expand(&dir, vec!["a/**/direct.py"]).await.unwrap(),
        vec![PathBuf::from("a/direct.py")]
    );
}

#[tokio::test]
async fn excludes_apply() {
    let dir = tempfile::TempDir::new().unwrap();
    populate(&dir);
    assert_eq!(
        expand(&dir, vec!["src/a/*.py", "!second.py"]).await.unwrap(),
        vec![PathBuf::from("src/a/first.py")]
    );
}

#[tokio::test]
async fn symlinks_are_expanded_when_oblivious() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("real")).unwrap();
    std::fs::write(dir.path().join("real/file.txt"), b"").unwrap();
    std::os::unix::fs::symlink("real", dir.path().join("linked")).unwrap();

    let fs = Arc::new(
        PosixFS::new(
            dir.path(),
            GitignoreStyleExcludes::empty(),
            task_executor::Executor::new(),
        )
        .unwrap(),
    );
    let path_globs = PathGlobs::new(
        vec!["linked/*.txt".to_owned()],
        StrictGlobMatching::Ignore,
        GlobExpansionConjunction::AllMatch,
    )
    .parse()
    .unwrap();
    let path_stats = fs
        .expand_globs(path_globs, SymlinkBehavior::Oblivious, None)
        .await
        .unwrap();

    match &path_stats[..] {
        [PathStat::File { path, stat }] => {
            assert_eq!(path, &PathBuf::from("linked/file.txt"));
            assert_eq!(stat.path, PathBuf::from("real/file.txt"));
        }
        other => panic!("Expected one file, got: {other:?}"),
    }
}

#[tokio::test]
async fn dead_symlinks_are_skipped() {
    let dir = tempfile::TempDir::new().unwrap();
    std::os::unix::fs::symlink("nonexistent", dir.path().join("dead")).unwrap();
    assert_eq!(expand(&dir, vec!["*"]).await.unwrap(), Vec::<PathBuf>::new());
}

#[tokio::test]
async fn strict_matching_errors_for_unmatched_globs() {
    let dir = tempfile::TempDir::new().unwrap();
    populate(&dir);
    let err = expand_with_behavior(
        &dir,
        vec!["does-not-exist/*.py"],
        StrictGlobMatching::Error("a test".to_owned()),
    )
    .await
    .expect_err("want err");
    assert!(err.contains("Unmatched glob"), "Got: {err}");
    assert!(err.contains("a test"), "Got: {err}");
}
