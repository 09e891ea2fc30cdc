// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rule_graph::DependencyKey;

use crate::context::Context;
use crate::core::{throw, Failure, Value};
use crate::nodes::{ExecuteProcess, NodeResult, SnapshotNode};
use crate::tasks::Intrinsic;
use crate::types::Types;

///
/// The rules provided by the engine itself. Each is resolved by the rule graph like any other
/// rule; the scheduler dispatches to the matching native implementation by product type.
///
pub struct Intrinsics {
    intrinsics: Vec<Intrinsic>,
}

impl Intrinsics {
    pub fn new(types: &Types) -> Intrinsics {
        let intrinsics = vec![
            Intrinsic {
                id: "execute_process",
                product: types.process_result,
                inputs: vec![DependencyKey::new(types.process)],
            },
            Intrinsic {
                id: "path_globs_to_snapshot",
                product: types.snapshot,
                inputs: vec![DependencyKey::new(types.path_globs)],
            },
            Intrinsic {
                id: "snapshot_to_directory_digest",
                product: types.directory_digest,
                inputs: vec![DependencyKey::new(types.snapshot)],
            },
            Intrinsic {
                id: "directory_digest_to_digest_contents",
                product: types.digest_contents,
                inputs: vec![DependencyKey::new(types.directory_digest)],
            },
        ];
        Intrinsics { intrinsics }
    }

    pub fn keys(&self) -> &[Intrinsic] {
        &self.intrinsics
    }

    pub async fn run(
        &self,
        intrinsic: &Arc<Intrinsic>,
        context: Context,
        args: Vec<Value>,
    ) -> NodeResult<Value> {
        match intrinsic.id {
            "execute_process" => {
                let process: process_execution::Process = args[0].extract()?;
                let result = context.get(ExecuteProcess { process }).await?;
                Ok(Value::new(result))
            }
            "path_globs_to_snapshot" => {
                let path_globs: fs::PathGlobs = args[0].extract()?;
                let snapshot = context.get(SnapshotNode(path_globs)).await?;
                Ok(Value::new(snapshot))
            }
            "snapshot_to_directory_digest" => {
                let snapshot: store::Snapshot = args[0].extract()?;
                Ok(Value::new(snapshot.directory_digest()))
            }
            "directory_digest_to_digest_contents" => {
                let digest: fs::DirectoryDigest = args[0].extract()?;
                let contents = context
                    .core
                    .store()
                    .contents_for_directory(digest)
                    .await
                    .map_err(Failure::from)?;
                Ok(Value::new(DigestContents(contents)))
            }
            other => Err(throw(format!("Unrecognized intrinsic: {other}"))),
        }
    }
}

///
/// The loaded contents of a directory tree, as a product value.
///
#[derive(Debug)]
pub struct DigestContents(pub Vec<fs::FileContent>);

impl Hash for DigestContents {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for file_content in &self.0 {
            file_content.path.hash(state);
            file_content.content.hash(state);
            file_content.is_executable.hash(state);
        }
    }
}
