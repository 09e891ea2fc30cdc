// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use hashing::{Digest, EMPTY_DIGEST};

use crate::directory::{DigestTrie, Entry, TypedPath};
use crate::SymlinkBehavior;

fn make_tree(typed_paths: Vec<TypedPath>, file_contents: &[(&str, &str)]) -> DigestTrie {
    let file_digests: HashMap<PathBuf, Digest> = file_contents
        .iter()
        .map(|(path, content)| (PathBuf::from(path), Digest::of_bytes(content.as_bytes())))
        .collect();
    DigestTrie::from_unique_paths(typed_paths, &file_digests).unwrap()
}

#[test]
fn empty_tree_digest() {
    let tree = make_tree(vec![], &[]);
    assert_eq!(tree.compute_root_digest(), EMPTY_DIGEST);
}

#[test]
fn digest_is_deterministic() {
    let make = || {
        make_tree(
            vec![
                TypedPath::File {
                    path: Path::new("a/b.txt"),
                    is_executable: false,
                },
                TypedPath::File {
                    path: Path::new("c.txt"),
                    is_executable: true,
                },
            ],
            &[("a/b.txt", "bee"), ("c.txt", "sea")],
        )
    };
    assert_eq!(make().compute_root_digest(), make().compute_root_digest());
}

#[test]
fn input_order_does_not_matter() {
    let forward = make_tree(
        vec![
            TypedPath::File {
                path: Path::new("a.txt"),
                is_executable: false,
            },
            TypedPath::File {
                path: Path::new("b.txt"),
                is_executable: false,
            },
        ],
        &[("a.txt", "aaa"), ("b.txt", "bbb")],
    );
    let reverse = make_tree(
        vec![
            TypedPath::File {
                path: Path::new("b.txt"),
                is_executable: false,
            },
            TypedPath::File {
                path: Path::new("a.txt"),
                is_executable: false,
            },
        ],
        &[("a.txt", "aaa"), ("b.txt", "bbb")],
    );
    assert_eq!(
        forward.compute_root_digest(),
        reverse.compute_root_digest()
    );
}

#[test]
fn duplicate_paths_are_rejected() {
    let file_digests: HashMap<PathBuf, Digest> =
        vec![(PathBuf::from("a.txt"), EMPTY_DIGEST)].into_iter().collect();
    DigestTrie::from_unique_paths(
        vec![
            TypedPath::File {
                path: Path::new("a.txt"),
                is_executable: false,
            },
            TypedPath::File {
                path: Path::new("a.txt"),
                is_executable: true,
            },
        ],
        &file_digests,
    )
    .expect_err("want err");
}

#[test]
fn roundtrips_through_remexec_directories() {
    let tree = make_tree(
        vec![
            TypedPath::File {
                path: Path::new("a/b.txt"),
                is_executable: false,
            },
            TypedPath::Link {
                path: Path::new("a/l"),
                target: Path::new("b.txt"),
            },
            TypedPath::Dir(Path::new("empty")),
        ],
        &[("a/b.txt", "bee")],
    );

    let directories_by_digest = tree.collect_directories().into_iter().collect();
    let reconstructed = DigestTrie::from_remexec_directories(
        &tree.as_remexec_directory(),
        &directories_by_digest,
    )
    .unwrap();
    assert_eq!(
        tree.compute_root_digest(),
        reconstructed.compute_root_digest()
    );
}

#[test]
fn entry_lookup() {
    let tree = make_tree(
        vec![
            TypedPath::File {
                path: Path::new("a/b.txt"),
                is_executable: false,
            },
            TypedPath::Link {
                path: Path::new("link"),
                target: Path::new("a"),
            },
        ],
        &[("a/b.txt", "bee")],
    );

    match tree.entry(Path::new("a/b.txt")).unwrap() {
        Some(Entry::File(f)) => {
            assert_eq!(f.digest(), Digest::of_bytes(b"bee"));
        }
        other => panic!("Expected a file, got: {other:?}"),
    }

    // Lookups follow symlinks to directories.
    match tree.entry(Path::new("link/b.txt")).unwrap() {
        Some(Entry::File(_)) => (),
        other => panic!("Expected a file via the symlink, got: {other:?}"),
    }

    assert!(tree.entry(Path::new("a/missing.txt")).unwrap().is_none());
    tree.entry(Path::new("a/b.txt/nested")).expect_err("want err");
}

#[test]
fn walk_aware_vs_oblivious() {
    let tree = make_tree(
        vec![
            TypedPath::File {
                path: Path::new("a/b.txt"),
                is_executable: false,
            },
            TypedPath::Link {
                path: Path::new("l"),
                target: Path::new("a/b.txt"),
            },
        ],
        &[("a/b.txt", "bee")],
    );

    assert_eq!(tree.symlinks(), vec![PathBuf::from("l")]);
    assert_eq!(
        tree.files(SymlinkBehavior::Aware),
        vec![PathBuf::from("a/b.txt")]
    );
    // In oblivious mode, the symlink shows up as its target file.
    assert_eq!(
        tree.files(SymlinkBehavior::Oblivious),
        vec![PathBuf::from("a/b.txt"), PathBuf::from("l")]
    );
}

#[test]
fn digests_reachable() {
    let tree = make_tree(
        vec![TypedPath::File {
            path: Path::new("a/b.txt"),
            is_executable: false,
        }],
        &[("a/b.txt", "bee")],
    );
    let digests = tree.digests();
    assert!(digests.contains(&Digest::of_bytes(b"bee")));
    assert!(digests.contains(&tree.compute_root_digest()));
    // The root, the `a` subdirectory, and the file.
    assert_eq!(digests.len(), 3);
}

#[test]
fn digest_is_memoized_and_canonical() {
    let tree = make_tree(
        vec![TypedPath::File {
            path: Path::new("a.txt"),
            is_executable: false,
        }],
        &[("a.txt", "aaa")],
    );
    // The stored digest matches a recomputation from the canonical serialization.
    use grpc_util::prost::MessageExt;
    assert_eq!(
        tree.compute_root_digest(),
        Digest::of_bytes(&tree.as_remexec_directory().to_bytes())
    );
}
