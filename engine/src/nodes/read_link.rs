// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;

use fs::Link;
use graph::Context;

use super::{NodeKey, NodeResult};
use crate::core::throw;

///
/// A Node that represents reading a symlink.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ReadLink(pub Link);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkDest(pub PathBuf);

impl ReadLink {
    pub(super) async fn run_node(self, context: Context<NodeKey>) -> NodeResult<LinkDest> {
        let node = self;
        let link_dest = context
            .core
            .vfs
            .read_link(&node.0)
            .await
            .map_err(|e| throw(format!("{e}")))?;
        Ok(LinkDest(link_dest))
    }
}
