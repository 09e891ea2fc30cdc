// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use bytes::Bytes;
use grpc_util::prost::MessageExt;
use hashing::{Digest, Fingerprint};
use protos::gen::build::bazel::remote::execution::v2 as remexec;

///
/// A small blob fixture with convenient accessors for its bytes and digest.
///
#[derive(Clone)]
pub struct TestData {
    string: String,
}

impl TestData {
    pub fn empty() -> TestData {
        TestData::new("")
    }

    pub fn catnip() -> TestData {
        TestData::new("catnip")
    }

    pub fn robin() -> TestData {
        TestData::new("robin")
    }

    pub fn forty_two() -> TestData {
        TestData::new("42")
    }

    pub fn all_the_henries() -> TestData {
        // A body large enough to exercise the streaming (rather than batched) code paths.
        let mut body = String::new();
        for _ in 0..10_000 {
            body.push_str("God for Harry, England, and Saint George!\n");
        }
        TestData::new(&body)
    }

    pub fn new(s: &str) -> TestData {
        TestData {
            string: s.to_owned(),
        }
    }

    pub fn string(&self) -> String {
        self.string.clone()
    }

    pub fn bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.string.as_bytes())
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.digest().hash
    }

    pub fn digest(&self) -> Digest {
        Digest::of_bytes(self.string.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.string.len()
    }
}

///
/// A canonical Directory proto fixture and its digest.
///
#[derive(Clone)]
pub struct TestDirectory {
    pub directory: remexec::Directory,
}

impl TestDirectory {
    pub fn empty() -> TestDirectory {
        TestDirectory {
            directory: remexec::Directory::default(),
        }
    }

    /// Contains "feed.txt" with the content "catnip".
    pub fn containing_catnip() -> TestDirectory {
        let directory = remexec::Directory {
            files: vec![remexec::FileNode {
                name: "feed.txt".to_owned(),
                digest: Some((&TestData::catnip().digest()).into()),
                is_executable: false,
                ..remexec::FileNode::default()
            }],
            ..remexec::Directory::default()
        };
        TestDirectory { directory }
    }

    /// Contains "feed.txt" with the content "catnip", marked executable.
    pub fn containing_catnip_executable() -> TestDirectory {
        let directory = remexec::Directory {
            files: vec![remexec::FileNode {
                name: "feed.txt".to_owned(),
                digest: Some((&TestData::catnip().digest()).into()),
                is_executable: true,
                ..remexec::FileNode::default()
            }],
            ..remexec::Directory::default()
        };
        TestDirectory { directory }
    }

    /// Contains a subdirectory "pets" which contains "feed.txt".
    pub fn nested() -> TestDirectory {
        let directory = remexec::Directory {
            directories: vec![remexec::DirectoryNode {
                name: "pets".to_owned(),
                digest: Some((&TestDirectory::containing_catnip().digest()).into()),
            }],
            ..remexec::Directory::default()
        };
        TestDirectory { directory }
    }

    /// Contains a symlink "feed" pointing at "feed.txt", alongside "feed.txt".
    pub fn with_symlink() -> TestDirectory {
        let directory = remexec::Directory {
            files: vec![remexec::FileNode {
                name: "feed.txt".to_owned(),
                digest: Some((&TestData::catnip().digest()).into()),
                is_executable: false,
                ..remexec::FileNode::default()
            }],
            symlinks: vec![remexec::SymlinkNode {
                name: "feed".to_owned(),
                target: "feed.txt".to_owned(),
                ..remexec::SymlinkNode::default()
            }],
            ..remexec::Directory::default()
        };
        TestDirectory { directory }
    }

    pub fn directory(&self) -> remexec::Directory {
        self.directory.clone()
    }

    pub fn bytes(&self) -> Bytes {
        self.directory.to_bytes()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.digest().hash
    }

    pub fn digest(&self) -> Digest {
        Digest::of_bytes(&self.bytes())
    }
}

///
/// Construct a file at the given path with the given contents.
///
pub mod file {
    use std::fs::File;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    pub fn contents(path: &Path, contents: &str) {
        let mut file = File::create(path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    pub fn is_executable(path: &Path) -> bool {
        std::fs::metadata(path)
            .unwrap()
            .permissions()
            .mode()
            & 0o100
            == 0o100
    }

    pub fn make_executable(path: &Path) {
        let mut permissions = std::fs::metadata(path).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(path, permissions).unwrap();
    }
}
