// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use fs::{Dir, DirectoryListing};
use graph::Context;

use super::{NodeKey, NodeResult};
use crate::core::throw;

///
/// A Node that represents listing the contents of a directory.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Scandir(pub Dir);

impl Scandir {
    pub(super) async fn run_node(
        self,
        context: Context<NodeKey>,
    ) -> NodeResult<Arc<DirectoryListing>> {
        let directory_listing = context
            .core
            .vfs
            .scandir(self.0)
            .await
            .map_err(|e| throw(format!("{e}")))?;
        Ok(Arc::new(directory_listing))
    }
}
