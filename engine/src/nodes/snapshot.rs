// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use fs::PathGlobs;
use graph::Context;
use store::Snapshot;

use super::{NodeKey, NodeResult};
use crate::core::throw;

///
/// A Node that captures a Snapshot of the build root for a set of PathGlobs.
///
/// Filesystem reads go through the `Vfs` implementation on the engine Context, so every file
/// digest, directory listing and link read is itself a memoized (and invalidated) node.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SnapshotNode(pub PathGlobs);

impl SnapshotNode {
    pub(super) async fn run_node(self, context: Context<NodeKey>) -> NodeResult<Snapshot> {
        use fs::GlobMatching;

        let path_globs = self.0.parse().map_err(throw)?;

        let path_stats = context
            .expand_globs(path_globs, fs::SymlinkBehavior::Aware, None)
            .await
            .map_err(|e| e.with_pushed_frame(&"snapshot capture"))?;

        let snapshot = Snapshot::from_path_stats(context.clone(), path_stats)
            .await
            .map_err(throw)?;

        // Persist the captured tree, and lease it for as long as this node retains its value.
        let directory_digest = snapshot.directory_digest();
        context
            .core
            .store()
            .ensure_directory_digest_persisted(directory_digest.clone())
            .await?;
        context.core.store().lease_all(directory_digest.digests().into_iter());

        Ok(snapshot)
    }
}
