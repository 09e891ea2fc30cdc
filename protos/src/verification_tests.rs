// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use hashing::EMPTY_DIGEST;

use crate::gen::build::bazel::remote::execution::v2 as remexec;
use crate::verify_directory_canonical;

fn file(name: &str) -> remexec::FileNode {
    remexec::FileNode {
        name: name.to_owned(),
        digest: Some(remexec::empty_digest()),
        ..remexec::FileNode::default()
    }
}

#[test]
fn empty_directory_is_canonical() {
    verify_directory_canonical(EMPTY_DIGEST, &remexec::Directory::default()).unwrap();
}

#[test]
fn sorted_unique_children_are_canonical() {
    let directory = remexec::Directory {
        files: vec![file("a"), file("b")],
        ..remexec::Directory::default()
    };
    verify_directory_canonical(EMPTY_DIGEST, &directory).unwrap();
}

#[test]
fn unsorted_children_are_rejected() {
    let directory = remexec::Directory {
        files: vec![file("b"), file("a")],
        ..remexec::Directory::default()
    };
    verify_directory_canonical(EMPTY_DIGEST, &directory).expect_err("want err");
}

#[test]
fn duplicate_children_are_rejected() {
    let directory = remexec::Directory {
        files: vec![file("a")],
        directories: vec![remexec::DirectoryNode {
            name: "a".to_owned(),
            digest: Some(remexec::empty_digest()),
        }],
        ..remexec::Directory::default()
    };
    verify_directory_canonical(EMPTY_DIGEST, &directory).expect_err("want err");
}

#[test]
fn multi_segment_names_are_rejected() {
    let directory = remexec::Directory {
        files: vec![file("a/b")],
        ..remexec::Directory::default()
    };
    verify_directory_canonical(EMPTY_DIGEST, &directory).expect_err("want err");
}

#[test]
fn empty_names_are_rejected() {
    let directory = remexec::Directory {
        files: vec![file("")],
        ..remexec::Directory::default()
    };
    verify_directory_canonical(EMPTY_DIGEST, &directory).expect_err("want err");
}
