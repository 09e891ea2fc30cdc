// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_oncecell::OnceCell;
use fs::{DirectoryDigest, Permissions, RelativePath};
use hashing::Digest;
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::{Store, StoreError};

///
/// A symlink from a relative src within a sandbox to an absolute dst elsewhere on the host.
///
pub struct WorkdirSymlink {
    pub src: RelativePath,
    pub dst: PathBuf,
}

///
/// A cache of materialized, read-only input trees, which sandboxes consume via symlinks rather
/// than materializing their own copies. Each tree is materialized at most once per process.
///
/// This is the "symlink to immutable cache" materialization strategy: consumers opt in per
/// input tree (the trees must genuinely be immutable for the lifetime of the process).
///
#[derive(Clone)]
pub struct ImmutableInputs(Arc<Inner>);

struct Inner {
    store: Store,
    // The base directory is a TempDir so that its contents are removed on shutdown.
    workdir: TempDir,
    contents: Mutex<HashMap<Digest, Arc<OnceCell<PathBuf>>>>,
}

impl ImmutableInputs {
    pub fn new(store: Store, base: &Path) -> Result<ImmutableInputs, String> {
        let workdir = tempfile::Builder::new()
            .prefix("immutable_inputs")
            .tempdir_in(base)
            .map_err(|e| format!("Failed to create temporary directory under {base:?}: {e}"))?;
        Ok(ImmutableInputs(Arc::new(Inner {
            store,
            workdir,
            contents: Mutex::default(),
        })))
    }

    pub fn workdir(&self) -> &Path {
        self.0.workdir.path()
    }

    ///
    /// Returns the absolute path of a materialized, read-only copy of the given directory.
    ///
    pub(crate) async fn path_for(&self, directory_digest: &DirectoryDigest) -> Result<PathBuf, StoreError> {
        let digest = directory_digest.as_digest();
        let cell = {
            let mut contents = self.0.contents.lock();
            contents.entry(digest).or_default().clone()
        };

        cell.get_or_try_init(async {
            let path = self.0.workdir.path().join(digest.hash.to_hex());
            self.0
                .store
                .materialize_directory(
                    path.clone(),
                    directory_digest.clone(),
                    Permissions::ReadOnly,
                )
                .await?;
            Ok::<_, StoreError>(path)
        })
        .await
        .cloned()
    }

    ///
    /// Returns symlinks to create for the given set of immutable cache paths.
    ///
    pub async fn local_paths(
        &self,
        immutable_inputs: &std::collections::BTreeMap<RelativePath, DirectoryDigest>,
    ) -> Result<Vec<WorkdirSymlink>, StoreError> {
        let mut symlinks = Vec::new();
        for (src, digest) in immutable_inputs {
            symlinks.push(WorkdirSymlink {
                src: src.clone(),
                dst: self.path_for(digest).await?,
            });
        }
        Ok(symlinks)
    }
}
