// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

mod immutable_inputs;
pub use crate::immutable_inputs::{ImmutableInputs, WorkdirSymlink};
mod local;
#[cfg(test)]
mod local_tests;
mod remote;
mod snapshot;
pub use crate::snapshot::{OneOffStoreFileByDigest, Snapshot, StoreFileByDigest};
#[cfg(test)]
mod snapshot_tests;

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display};
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use fs::{
    default_cache_path, DigestEntry, DigestTrie, DirectoryDigest, Entry, FileEntry, Permissions,
    SymlinkBehavior, SymlinkEntry, EMPTY_DIRECTORY_DIGEST,
};
use futures::future::{self, TryFutureExt};
use grpc_util::prost::MessageExt;
use hashing::Digest;
use local::ByteStore;
use prost::Message;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use protos::require_digest;
use remexec::Tree;
use remote_provider::RemoteStoreOptions;
use tokio::fs::hard_link;
use workunit_store::{in_workunit, Level};

const KILOBYTES: usize = 1024;
const MEGABYTES: usize = 1024 * KILOBYTES;
const GIGABYTES: usize = 1024 * MEGABYTES;

/// The target number of bytes which should be present in the local store after garbage
/// collection.
pub const DEFAULT_LOCAL_STORE_GC_TARGET_BYTES: usize = 4 * GIGABYTES;

///
/// An error that may have been caused by a missing digest.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StoreError {
    /// A Digest was not present in either of the local or remote Stores.
    MissingDigest(String, Digest),
    /// All other error types.
    Unclassified(String),
}

impl StoreError {
    pub fn enrich(self, prefix: &str) -> Self {
        match self {
            Self::MissingDigest(s, d) => Self::MissingDigest(format!("{prefix}: {s}"), d),
            Self::Unclassified(s) => Self::Unclassified(format!("{prefix}: {s}")),
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDigest(s, d) => {
                write!(f, "{s}: {d:?}")
            }
            Self::Unclassified(s) => write!(f, "{s}"),
        }
    }
}

impl From<String> for StoreError {
    fn from(err: String) -> Self {
        Self::Unclassified(err)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum EntryType {
    Directory,
    File,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShrinkBehavior {
    ///
    /// Free up space in the store for future writes, but don't proactively free up the disk
    /// space that was used. This is fast and safe, but won't free up disk space.
    ///
    Fast,

    ///
    /// As with Fast, but also free up disk space from no-longer-used data.
    ///
    Compact,
}

///
/// A content-addressed store of file contents and Directories.
///
/// Store keeps content on disk, and can optionally delegate to backfill its on-disk storage by
/// fetching files from a remote server which implements the Remote Execution API's
/// `ContentAddressableStorage` and `ByteStream` services.
///
/// It can also write back to a remote server, but will only do so when explicitly instructed to
/// do so.
///
#[derive(Clone)]
pub struct Store {
    local: ByteStore,
    remote: Option<remote::ByteStore>,
}

// Note that Store doesn't implement ByteStore because it operates at a higher level of
// abstraction, considering Directories as a standalone concept, rather than a buffer of bytes.
// This has the nice property that Directories can be trusted to be valid and canonical.
impl Store {
    ///
    /// Make a store which only uses its local storage.
    ///
    pub fn local_only<P: AsRef<Path>>(
        executor: task_executor::Executor,
        path: P,
    ) -> Result<Store, String> {
        Ok(Store {
            local: ByteStore::new(executor, path)?,
            remote: None,
        })
    }

    ///
    /// Converts this Store into one which will backfill its local storage from the given remote.
    ///
    pub async fn into_with_remote(self, options: RemoteStoreOptions) -> Result<Store, String> {
        Ok(Store {
            local: self.local,
            remote: Some(remote::ByteStore::from_options(options).await?),
        })
    }

    pub fn default_path() -> PathBuf {
        default_cache_path().join("store")
    }

    ///
    /// Remove a file locally, returning true if it existed.
    ///
    pub async fn remove_file(&self, digest: Digest) -> Result<bool, String> {
        self.local.remove(EntryType::File, digest).await
    }

    ///
    /// Store the given bytes locally.
    ///
    pub async fn store_file_bytes(
        &self,
        bytes: Bytes,
        initial_lease: bool,
    ) -> Result<Digest, String> {
        self.local
            .store_bytes(EntryType::File, None, bytes, initial_lease)
            .await
    }

    ///
    /// Store the contents of the file at `src` locally, hashing it in the process.
    ///
    /// If `src_is_immutable` is true, the file is trusted not to change while it is being
    /// ingested, and its content hash is only verified by length.
    ///
    pub async fn store_file(
        &self,
        src_is_immutable: bool,
        expected_digest: Option<Digest>,
        src: PathBuf,
    ) -> Result<Digest, String> {
        self.local
            .store_file(EntryType::File, src_is_immutable, expected_digest, src)
            .await
    }

    ///
    /// Loads the bytes of the file with the passed fingerprint from the local store and
    /// back-fills from remote when necessary and possible (i.e. when remote is configured), and
    /// returns the result of applying f to that value.
    ///
    pub async fn load_file_bytes_with<
        T: Send + 'static,
        F: Fn(&[u8]) -> T + Clone + Send + Sync + 'static,
    >(
        &self,
        digest: Digest,
        f: F,
    ) -> Result<T, StoreError> {
        // No transformation or verification (beyond the content hash check in the local store)
        // is needed for files.
        self.load_bytes_with(EntryType::File, digest, move |v: &[u8]| Ok(f(v)))
            .await
    }

    ///
    /// Ensure that the recursive contents of the given DigestTrie are persisted in the local
    /// store.
    ///
    pub async fn record_digest_trie(
        &self,
        tree: &DigestTrie,
        initial_lease: bool,
    ) -> Result<DirectoryDigest, String> {
        let directories = tree.collect_directories();
        future::try_join_all(
            directories
                .into_iter()
                .map(|(digest, directory)| {
                    let store = self.clone();
                    async move {
                        store
                            .local
                            .store_bytes(
                                EntryType::Directory,
                                Some(digest),
                                directory.to_bytes(),
                                initial_lease,
                            )
                            .await
                    }
                })
                .collect::<Vec<_>>(),
        )
        .await?;
        Ok(DirectoryDigest::new(tree.compute_root_digest(), tree.clone()))
    }

    ///
    /// Save the bytes of the Directory proto locally, without regard for any of the contents of
    /// any FileNodes or DirectoryNodes therein.
    ///
    pub async fn record_directory(
        &self,
        directory: &remexec::Directory,
        initial_lease: bool,
    ) -> Result<Digest, String> {
        protos::verify_directory_canonical(Digest::of_bytes(&directory.to_bytes()), directory)?;
        self.local
            .store_bytes(
                EntryType::Directory,
                None,
                directory.to_bytes(),
                initial_lease,
            )
            .await
    }

    ///
    /// Ensures that the directory entries of the given DirectoryDigest are persisted to disk.
    ///
    pub async fn ensure_directory_digest_persisted(
        &self,
        digest: DirectoryDigest,
    ) -> Result<(), StoreError> {
        if let Some(tree) = &digest.tree {
            self.record_digest_trie(tree, true).await?;
        }
        Ok(())
    }

    ///
    /// Loads a directory proto from the local store, back-filling from remote if necessary.
    ///
    pub async fn load_directory(&self, digest: Digest) -> Result<remexec::Directory, StoreError> {
        self.load_bytes_with(EntryType::Directory, digest, move |bytes: &[u8]| {
            remexec::Directory::decode(bytes).map_err(|e| {
                format!("Directory bytes for {digest:?} were not a valid proto: {e:?}")
            })
        })
        .await
    }

    ///
    /// Loads a DigestTrie for the given DirectoryDigest, either from its memoized copy, or from
    /// persisted directory protos.
    ///
    pub async fn load_digest_trie(
        &self,
        digest: DirectoryDigest,
    ) -> Result<DigestTrie, StoreError> {
        if let Some(tree) = digest.tree {
            // The DigestTrie is already in memory.
            return Ok(tree);
        }

        // The DigestTrie needs to be loaded from the Store.
        let root_digest = digest.as_digest();
        let mut directories_by_digest = HashMap::new();
        let mut queue = vec![root_digest];
        while !queue.is_empty() {
            let directories = future::try_join_all(
                queue
                    .drain(..)
                    .map(|d| self.load_directory(d).map_ok(move |dir| (d, dir)))
                    .collect::<Vec<_>>(),
            )
            .await?;
            for (d, directory) in directories {
                for child in &directory.directories {
                    queue.push(require_digest(child.digest.as_ref())?);
                }
                directories_by_digest.insert(d, directory);
            }
        }

        let root = directories_by_digest
            .get(&root_digest)
            .cloned()
            .expect("The root digest was loaded above.");
        let tree = DigestTrie::from_remexec_directories(&root, &directories_by_digest)?;

        if cfg!(debug_assertions) {
            let computed = tree.compute_root_digest();
            assert!(
                computed == root_digest,
                "Loaded tree did not match {root_digest:?}: got {computed:?}"
            );
        }
        Ok(tree)
    }

    ///
    /// Loads the given directory digest, or if it is not present locally, back-fills it (and its
    /// transitive contents) from the remote store.
    ///
    pub async fn ensure_local_has_recursive_directory(
        &self,
        dir_digest: DirectoryDigest,
    ) -> Result<(), StoreError> {
        let tree = self.load_digest_trie(dir_digest).await?;

        // Collect the file digests from the whole tree.
        let mut file_digests = Vec::new();
        tree.walk(SymlinkBehavior::Aware, &mut |_, entry| {
            if let Entry::File(f) = entry {
                file_digests.push(f.digest())
            }
        });

        future::try_join_all(
            file_digests
                .into_iter()
                .map(|file_digest| self.ensure_local_has_file(file_digest))
                .collect::<Vec<_>>(),
        )
        .await?;
        Ok(())
    }

    ///
    /// Ensure that a file is locally readable, backfilling it from the remote store if
    /// necessary.
    ///
    pub async fn ensure_local_has_file(&self, file_digest: Digest) -> Result<(), StoreError> {
        if self.local.exists(EntryType::File, file_digest).await? {
            return Ok(());
        }
        self.load_bytes_with(EntryType::File, file_digest, |_: &[u8]| Ok(()))
            .await
            .map_err(|e| e.enrich("Missing file"))
    }

    ///
    /// Load the given bytes, first from the local store, then falling back to a single remote
    /// fetch (which writes through to the local store).
    ///
    async fn load_bytes_with<
        T: Send + 'static,
        F: Fn(&[u8]) -> Result<T, String> + Clone + Send + Sync + 'static,
    >(
        &self,
        entry_type: EntryType,
        digest: Digest,
        f: F,
    ) -> Result<T, StoreError> {
        if let Some(result) = self.local.load_bytes_with(entry_type, digest, f.clone()).await? {
            return Ok(result);
        }

        let Some(remote) = &self.remote else {
            return Err(StoreError::MissingDigest(
                "Was not present in the local store".to_owned(),
                digest,
            ));
        };

        // Fetch from the remote store, writing through to the local store.
        let bytes = in_workunit!("remote_store_read_blob", Level::Trace, |_workunit| {
            remote.load_bytes(digest)
        })
        .await?
        .ok_or_else(|| {
            StoreError::MissingDigest(
                "Was not present in either the local or remote store".to_owned(),
                digest,
            )
        })?;

        self.local
            .store_bytes(entry_type, Some(digest), bytes.clone(), true)
            .await?;
        f(&bytes).map_err(StoreError::Unclassified)
    }

    ///
    /// Ensures that the remote store has the given digests (files or trees), uploading their
    /// transitive constituents as necessary.
    ///
    pub async fn ensure_remote_has_recursive(
        &self,
        digests: Vec<Digest>,
    ) -> Result<(), StoreError> {
        let Some(remote) = self.remote.clone() else {
            return Err(StoreError::Unclassified(
                "Cannot ensure remote has blobs: no remote is configured.".to_owned(),
            ));
        };

        // Expand each digest into its transitive contents: a digest which identifies a stored
        // Directory is expanded; all others are assumed to be files.
        let mut expanded_digests: HashSet<Digest> = HashSet::new();
        for digest in digests {
            match self.expand_digest(digest).await? {
                None => {
                    expanded_digests.insert(digest);
                }
                Some(expansion) => expanded_digests.extend(expansion),
            }
        }

        let digests_to_check: Vec<Digest> = expanded_digests.into_iter().collect();
        let missing = remote.list_missing_digests(&digests_to_check).await?;

        future::try_join_all(
            missing
                .into_iter()
                .map(|digest| self.upload_digest(&remote, digest))
                .collect::<Vec<_>>(),
        )
        .await?;
        Ok(())
    }

    ///
    /// If the given digest identifies a locally-stored Directory, expand to the set of all
    /// transitively reachable digests (including itself); otherwise None.
    ///
    async fn expand_digest(&self, digest: Digest) -> Result<Option<Vec<Digest>>, StoreError> {
        if !self.local.exists(EntryType::Directory, digest).await? {
            return Ok(None);
        }
        let trie = self
            .load_digest_trie(DirectoryDigest::from_persisted_digest(digest))
            .await?;
        Ok(Some(trie.digests()))
    }

    async fn upload_digest(
        &self,
        remote: &remote::ByteStore,
        digest: Digest,
    ) -> Result<(), StoreError> {
        // Directory protos and file bytes are stored in separate shards: try the directory
        // shard first, then fall back to files.
        for entry_type in [EntryType::Directory, EntryType::File] {
            let uploaded = self
                .local
                .load_bytes_with(entry_type, digest, |bytes: &[u8]| {
                    Ok(Bytes::copy_from_slice(bytes))
                })
                .await?;
            if let Some(bytes) = uploaded {
                remote.store_bytes(digest, bytes).await?;
                return Ok(());
            }
        }
        Err(StoreError::MissingDigest(
            "Failed to upload: was not present in the local store".to_owned(),
            digest,
        ))
    }

    ///
    /// Returns the contents of all files in the given directory.
    ///
    pub async fn contents_for_directory(
        &self,
        digest: DirectoryDigest,
    ) -> Result<Vec<fs::FileContent>, StoreError> {
        let mut files = Vec::new();
        self.load_digest_trie(digest)
            .await?
            .walk(SymlinkBehavior::Oblivious, &mut |path, entry| {
                if let Entry::File(f) = entry {
                    files.push((path.to_owned(), f.digest(), f.is_executable()))
                }
            });

        future::try_join_all(files.into_iter().map(|(path, digest, is_executable)| {
            let store = self.clone();
            async move {
                let content = store
                    .load_file_bytes_with(digest, Bytes::copy_from_slice)
                    .await
                    .map_err(|e| e.enrich(&format!("Couldn't find file contents for {path:?}")))?;
                Ok::<_, StoreError>(fs::FileContent {
                    path,
                    content,
                    is_executable,
                })
            }
        }))
        .await
    }

    ///
    /// A lazy-ish expansion of the given directory digest: returns one entry per leaf (file,
    /// symlink, or empty directory).
    ///
    pub async fn entries_for_directory(
        &self,
        digest: DirectoryDigest,
    ) -> Result<Vec<DigestEntry>, StoreError> {
        if digest == *EMPTY_DIRECTORY_DIGEST {
            return Ok(vec![]);
        }

        let mut entries = Vec::new();
        self.load_digest_trie(digest)
            .await?
            .walk(SymlinkBehavior::Aware, &mut |path, entry| match entry {
                Entry::File(f) => {
                    entries.push(DigestEntry::File(FileEntry {
                        path: path.to_owned(),
                        digest: f.digest(),
                        is_executable: f.is_executable(),
                    }));
                }
                Entry::Symlink(s) => {
                    entries.push(DigestEntry::Symlink(SymlinkEntry {
                        path: path.to_owned(),
                        target: s.target().to_path_buf(),
                    }));
                }
                Entry::Directory(d) if d.tree().entries().is_empty() => {
                    entries.push(DigestEntry::EmptyDirectory(path.to_owned()));
                }
                Entry::Directory(_) => (),
            });

        Ok(entries)
    }

    ///
    /// Materializes the directory identified by the given digest into the destination, laying
    /// out files, symlinks and directories with the requested permissions.
    ///
    /// Files are hardlinked from the store's file shards when the destination supports it and
    /// the materialization is read-only (a mutable destination must not be able to alter the
    /// store's immutable copies); otherwise they are copied.
    ///
    pub async fn materialize_directory(
        &self,
        destination: PathBuf,
        digest: DirectoryDigest,
        perms: Permissions,
    ) -> Result<(), StoreError> {
        let tree = self.load_digest_trie(digest).await?;
        let can_hardlink =
            perms == Permissions::ReadOnly && self.local.is_hardlinkable_destination(&destination).await?;

        tokio::fs::create_dir_all(&destination)
            .await
            .map_err(|e| format!("Failed to create directory {destination:?}: {e}"))?;

        // Collect the work before doing it, so that the trie walk (which is synchronous) is
        // complete before any I/O begins.
        let mut dirs_to_create = Vec::new();
        let mut symlinks_to_create = Vec::new();
        let mut files_to_create = Vec::new();
        tree.walk(SymlinkBehavior::Aware, &mut |path, entry| match entry {
            Entry::Directory(_) => dirs_to_create.push(destination.join(path)),
            Entry::Symlink(s) => {
                symlinks_to_create.push((destination.join(path), s.target().to_path_buf()))
            }
            Entry::File(f) => {
                files_to_create.push((destination.join(path), f.digest(), f.is_executable()))
            }
        });

        for dir in dirs_to_create {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| format!("Failed to create directory {dir:?}: {e}"))?;
        }
        for (path, target) in symlinks_to_create {
            tokio::fs::symlink(&target, &path)
                .await
                .map_err(|e| format!("Failed to create symlink {path:?} -> {target:?}: {e}"))?;
        }
        future::try_join_all(
            files_to_create
                .into_iter()
                .map(|(path, digest, is_executable)| {
                    self.materialize_file(path, digest, perms, is_executable, can_hardlink)
                })
                .collect::<Vec<_>>(),
        )
        .await?;

        // Lastly, if the materialization is read-only, seal directory permissions (children
        // first is unnecessary since we only tighten the mode at the top level dirs).
        if perms == Permissions::ReadOnly {
            let mut dir_paths = vec![destination.clone()];
            tree.walk(SymlinkBehavior::Aware, &mut |path, entry| {
                if let Entry::Directory(_) = entry {
                    dir_paths.push(destination.join(path));
                }
            });
            for dir in dir_paths {
                tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o555))
                    .await
                    .map_err(|e| format!("Failed to seal permissions of {dir:?}: {e}"))?;
            }
        }

        Ok(())
    }

    async fn materialize_file(
        &self,
        destination: PathBuf,
        digest: Digest,
        perms: Permissions,
        is_executable: bool,
        can_hardlink: bool,
    ) -> Result<(), StoreError> {
        let mode = match (perms, is_executable) {
            (Permissions::ReadOnly, false) => 0o444,
            (Permissions::ReadOnly, true) => 0o555,
            (Permissions::Writable, false) => 0o644,
            (Permissions::Writable, true) => 0o755,
        };

        if can_hardlink {
            // Ensure the file is present locally (backfilling from the remote if needed), and
            // link to the store's copy.
            self.ensure_local_has_file(digest).await?;
            let src = self.local.file_path(digest);
            hard_link(&src, &destination)
                .await
                .map_err(|e| format!("Failed to hardlink {src:?} to {destination:?}: {e}"))?;
            return Ok(());
        }

        let destination2 = destination.clone();
        self.load_file_bytes_with(digest, move |bytes| {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(mode)
                .open(&destination2)
                .map_err(|e| format!("Failed to open {destination2:?}: {e}"))?;
            file.write_all(bytes)
                .map_err(|e| format!("Failed to write {destination2:?}: {e}"))?;
            Ok::<_, String>(())
        })
        .await?
        .map_err(StoreError::Unclassified)?;
        Ok(())
    }

    ///
    /// Download a directory from the remote store, represented as a REAPI Tree message, and
    /// persist it locally.
    ///
    pub async fn load_tree_from_remote(
        &self,
        tree_digest: Digest,
    ) -> Result<Option<DirectoryDigest>, String> {
        let Some(remote) = &self.remote else {
            return Ok(None);
        };

        let Some(bytes) = remote.load_bytes(tree_digest).await? else {
            return Ok(None);
        };
        let tree = Tree::decode(&bytes[..]).map_err(|e| format!("protobuf decode error: {e:?}"))?;
        let trie = DigestTrie::from_remexec_tree(&tree)?;
        let digest = self.record_digest_trie(&trie, true).await?;
        Ok(Some(digest))
    }

    ///
    /// Add a reference to each of the given digests, protecting them from garbage collection
    /// until released.
    ///
    pub fn lease_all(&self, digests: impl Iterator<Item = Digest>) {
        self.local.lease_all(digests)
    }

    pub fn release_all(&self, digests: impl Iterator<Item = Digest>) {
        self.local.release_all(digests)
    }

    ///
    /// Replace the reference set wholesale with the given digests: used when the node graph
    /// recomputes the set of values it currently retains.
    ///
    pub fn reset_leases(&self, digests: impl Iterator<Item = Digest>) {
        self.local.reset_leases(digests)
    }

    ///
    /// Garbage collect the local store down to the target size, evicting least-recently-used,
    /// unreferenced entries first.
    ///
    pub async fn garbage_collect(
        &self,
        target_size_bytes: usize,
        shrink_behavior: ShrinkBehavior,
    ) -> Result<(), String> {
        let size = self.local.shrink(target_size_bytes, shrink_behavior).await?;
        if size > target_size_bytes {
            log::warn!(
                "Garbage collection attempted to shrink the store to {target_size_bytes} bytes \
                but {size} bytes are currently referenced or recently used."
            );
        }
        Ok(())
    }

    ///
    /// Check whether the given directory trees (transitively) and files all exist locally,
    /// without fetching anything.
    ///
    pub async fn exists_recursive(
        &self,
        directory_digests: impl IntoIterator<Item = DirectoryDigest>,
        file_digests: impl IntoIterator<Item = Digest>,
    ) -> Result<bool, StoreError> {
        let mut files_to_check: Vec<Digest> = file_digests.into_iter().collect();
        for directory_digest in directory_digests {
            let tree = match self.local_digest_trie(directory_digest).await? {
                Some(tree) => tree,
                None => return Ok(false),
            };
            tree.walk(SymlinkBehavior::Aware, &mut |_, entry| {
                if let Entry::File(f) = entry {
                    files_to_check.push(f.digest())
                }
            });
        }

        for file_digest in files_to_check {
            if !self.local.exists(EntryType::File, file_digest).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    ///
    /// Like load_digest_trie, but returns None rather than fetching from the remote when a
    /// directory is not present locally.
    ///
    async fn local_digest_trie(
        &self,
        digest: DirectoryDigest,
    ) -> Result<Option<DigestTrie>, StoreError> {
        if digest.tree.is_some()
            || digest.as_digest() == hashing::EMPTY_DIGEST
            || self.local.exists(EntryType::Directory, digest.as_digest()).await?
        {
            return self.load_digest_trie(digest).await.map(Some);
        }
        Ok(None)
    }

    ///
    /// All of the locally stored digests, for introspection and tests.
    ///
    pub async fn all_local_digests(&self) -> Result<Vec<Digest>, String> {
        self.local.all_digests().await
    }
}
