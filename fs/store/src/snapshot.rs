// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use fs::{
    DigestTrie, DirectoryDigest, GlobMatching, PathStat, PosixFS, PreparedPathGlobs,
    SymlinkBehavior, TypedPath, EMPTY_DIGEST_TREE,
};
use futures::future;
use futures::future::BoxFuture;
use futures::FutureExt;
use hashing::{Digest, EMPTY_DIGEST};

use crate::Store;

///
/// An in-memory Merkle tree and its root digest: the result of capturing a set of files from
/// disk (or of assembling one from stored digests).
///
#[derive(Clone)]
pub struct Snapshot {
    pub digest: Digest,
    pub tree: DigestTrie,
}

impl Eq for Snapshot {}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl std::hash::Hash for Snapshot {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            digest: EMPTY_DIGEST,
            tree: EMPTY_DIGEST_TREE.clone(),
        }
    }

    ///
    /// Capture the paths matched by the given globs from the given filesystem root, storing
    /// their file contents via the given digester.
    ///
    pub async fn capture<S: StoreFileByDigest<String>>(
        store_file_by_digest: S,
        posix_fs: &Arc<PosixFS>,
        path_globs: PreparedPathGlobs,
    ) -> Result<Snapshot, String> {
        let path_stats = posix_fs
            .expand_globs(path_globs, SymlinkBehavior::Aware, None)
            .await
            .map_err(|err| format!("Error expanding globs: {err}"))?;
        Snapshot::from_path_stats(store_file_by_digest, path_stats).await
    }

    pub async fn from_path_stats<S: StoreFileByDigest<E>, E: fmt::Debug>(
        file_digester: S,
        path_stats: Vec<PathStat>,
    ) -> Result<Snapshot, String> {
        let (file_digests, path_stats) =
            Self::digest_file_path_stats(file_digester, path_stats).await?;
        Self::from_path_stats_and_digests(path_stats, file_digests)
    }

    async fn digest_file_path_stats<S: StoreFileByDigest<E>, E: fmt::Debug>(
        file_digester: S,
        path_stats: Vec<PathStat>,
    ) -> Result<(HashMap<PathBuf, Digest>, Vec<PathStat>), String> {
        let file_digest_futures = path_stats
            .iter()
            .filter_map(|path_stat| match path_stat {
                PathStat::File { stat, .. } => {
                    let path = stat.path.clone();
                    let digest_future = file_digester.store_by_digest(stat.clone());
                    Some(async move {
                        let digest = digest_future
                            .await
                            .map_err(|e| format!("Failed to digest file {path:?}: {e:?}"))?;
                        Ok::<_, String>((path, digest))
                    })
                }
                _ => None,
            })
            .collect::<Vec<_>>();

        let file_digests = future::try_join_all(file_digest_futures)
            .await?
            .into_iter()
            .collect();
        Ok((file_digests, path_stats))
    }

    fn from_path_stats_and_digests(
        path_stats: Vec<PathStat>,
        file_digests: HashMap<PathBuf, Digest>,
    ) -> Result<Snapshot, String> {
        let typed_paths: Vec<TypedPath> = path_stats.iter().map(TypedPath::from).collect();
        let tree = DigestTrie::from_unique_paths(typed_paths, &file_digests)?;
        Ok(Snapshot {
            digest: tree.compute_root_digest(),
            tree,
        })
    }

    ///
    /// Construct a Snapshot for a given DirectoryDigest, loading its tree from the given Store
    /// if it is not already in memory.
    ///
    pub async fn from_digest(store: Store, digest: DirectoryDigest) -> Result<Snapshot, String> {
        let tree = store
            .load_digest_trie(digest.clone())
            .await
            .map_err(|e| e.to_string())?;
        Ok(Snapshot {
            digest: digest.as_digest(),
            tree,
        })
    }

    pub fn directory_digest(&self) -> DirectoryDigest {
        DirectoryDigest::new(self.digest, self.tree.clone())
    }

    pub fn files(&self) -> Vec<PathBuf> {
        self.tree.files(SymlinkBehavior::Oblivious)
    }

    pub fn directories(&self) -> Vec<PathBuf> {
        self.tree.directories(SymlinkBehavior::Oblivious)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "Snapshot(digest={:?})", self.digest)
    }
}

impl From<Snapshot> for DirectoryDigest {
    fn from(snapshot: Snapshot) -> Self {
        DirectoryDigest::new(snapshot.digest, snapshot.tree)
    }
}

///
/// A facade for storing the contents of a File as its Digest. Allows the caller to memoize
/// expensive file digesting (the engine memoizes it per file node).
///
pub trait StoreFileByDigest<Error> {
    fn store_by_digest(&self, file: fs::File) -> BoxFuture<'static, Result<Digest, Error>>;
}

///
/// A StoreFileByDigest which reads with a PosixFS and writes to a Store, with no caching.
///
#[derive(Clone)]
pub struct OneOffStoreFileByDigest {
    store: Store,
    posix_fs: Arc<PosixFS>,
    immutable: bool,
}

impl OneOffStoreFileByDigest {
    pub fn new(store: Store, posix_fs: Arc<PosixFS>, immutable: bool) -> OneOffStoreFileByDigest {
        OneOffStoreFileByDigest {
            store,
            posix_fs,
            immutable,
        }
    }
}

impl StoreFileByDigest<String> for OneOffStoreFileByDigest {
    fn store_by_digest(&self, file: fs::File) -> BoxFuture<'static, Result<Digest, String>> {
        let store = self.store.clone();
        let posix_fs = self.posix_fs.clone();
        let immutable = self.immutable;
        async move {
            let path = posix_fs.file_path(&file);
            store.store_file(immutable, None, path).await
        }
        .boxed()
    }
}
