// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use fs::File;
use graph::Context;

use super::{NodeKey, NodeResult};
use crate::core::throw;

///
/// A Node that represents reading a file and fingerprinting its contents: the digest is stored
/// as a side effect, so that the file's content is available from the store afterwards.
///
/// Re-reads which produce identical content do not bump the node's generation, which is what
/// makes pure touch events free for dependents.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct DigestFile(pub File);

impl DigestFile {
    pub(super) async fn run_node(
        self,
        context: Context<NodeKey>,
    ) -> NodeResult<hashing::Digest> {
        let path = context.core.vfs.file_path(&self.0);
        context
            .core
            .store()
            .store_file(false, None, path)
            .await
            .map_err(throw)
    }
}
