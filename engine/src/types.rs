// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::core::TypeId;

///
/// The TypeIds of the product types which the engine itself produces or consumes via
/// intrinsics. Embedders use these types to interact with process execution and snapshot
/// capture from their rules.
///
#[derive(Clone, Copy, Debug)]
pub struct Types {
    /// `process_execution::Process`: the description of a process to execute.
    pub process: TypeId,
    /// `nodes::ProcessResult`: the result of executing a process.
    pub process_result: TypeId,
    /// `fs::PathGlobs`: a set of filesystem globs to capture.
    pub path_globs: TypeId,
    /// `store::Snapshot`: a captured (or assembled) directory tree.
    pub snapshot: TypeId,
    /// `fs::DirectoryDigest`: the digest of a directory tree.
    pub directory_digest: TypeId,
    /// `Vec<fs::FileContent>`: the loaded contents of a directory tree.
    pub digest_contents: TypeId,
}

impl Types {
    pub fn new() -> Types {
        Types {
            process: TypeId::new("Process"),
            process_result: TypeId::new("ProcessResult"),
            path_globs: TypeId::new("PathGlobs"),
            snapshot: TypeId::new("Snapshot"),
            directory_digest: TypeId::new("DirectoryDigest"),
            digest_contents: TypeId::new("DigestContents"),
        }
    }
}
