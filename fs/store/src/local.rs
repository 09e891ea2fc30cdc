// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_oncecell::OnceCell;
use bytes::Bytes;
use fnv::FnvHashMap;
use hashing::{AgedFingerprint, Digest, Fingerprint};
use parking_lot::Mutex;
use tempfile::Builder;
use tokio::fs::hard_link;
use tokio::io::AsyncWriteExt;
use workunit_store::ObservationMetric;

use crate::{EntryType, ShrinkBehavior};

///
/// The local backing store: content-addressed files sharded by fingerprint prefix, with all
/// writes made atomic by writing to a temporary file and renaming it into place. The layout
/// under the store root is:
///
///   files/<2-hex-prefix>/<hex>
///   directories/<2-hex-prefix>/<hex>
///   tmp/
///
/// A file's mtime records its last use, for least-recently-used garbage collection.
///
#[derive(Clone)]
pub(crate) struct ByteStore {
    inner: Arc<InnerStore>,
}

struct InnerStore {
    files_db: ShardedFsDb,
    directories_db: ShardedFsDb,
    executor: task_executor::Executor,
    // In-memory reference counts for digests which are currently retained by the engine:
    // protected from garbage collection regardless of age.
    leases: Mutex<FnvHashMap<Fingerprint, usize>>,
}

impl ByteStore {
    pub fn new<P: AsRef<Path>>(
        executor: task_executor::Executor,
        path: P,
    ) -> Result<ByteStore, String> {
        let root = path.as_ref();
        let tmp_root = root.join("tmp");
        std::fs::create_dir_all(&tmp_root)
            .map_err(|e| format!("Failed to create store root {root:?}: {e}"))?;

        Ok(ByteStore {
            inner: Arc::new(InnerStore {
                files_db: ShardedFsDb::new(root.join("files"), tmp_root.clone(), executor.clone())?,
                directories_db: ShardedFsDb::new(root.join("directories"), tmp_root, executor.clone())?,
                executor,
                leases: Mutex::default(),
            }),
        })
    }

    fn db(&self, entry_type: EntryType) -> &ShardedFsDb {
        match entry_type {
            EntryType::File => &self.inner.files_db,
            EntryType::Directory => &self.inner.directories_db,
        }
    }

    ///
    /// The path at which the given (file) digest is stored: used for hardlink materialization.
    ///
    pub fn file_path(&self, digest: Digest) -> PathBuf {
        self.inner.files_db.get_path(digest.hash)
    }

    pub async fn is_hardlinkable_destination(&self, destination: &Path) -> Result<bool, String> {
        self.inner
            .files_db
            .is_hardlinkable_destination(destination)
            .await
    }

    pub async fn exists(&self, entry_type: EntryType, digest: Digest) -> Result<bool, String> {
        self.db(entry_type).exists(digest.hash).await
    }

    pub async fn remove(&self, entry_type: EntryType, digest: Digest) -> Result<bool, String> {
        self.db(entry_type).remove(digest.hash).await
    }

    ///
    /// Store the given bytes. Writes are idempotent and write-once: storing bytes which are
    /// already present is a no-op.
    ///
    /// If `expected_digest` is given it is trusted to be the digest of `bytes` (used when the
    /// digest was already computed, e.g. for canonical directory serializations).
    ///
    pub async fn store_bytes(
        &self,
        entry_type: EntryType,
        expected_digest: Option<Digest>,
        bytes: Bytes,
        initial_lease: bool,
    ) -> Result<Digest, String> {
        let digest = match expected_digest {
            Some(digest) => {
                if cfg!(debug_assertions) {
                    let actual = Digest::of_bytes(&bytes);
                    assert!(digest == actual, "Expected {digest:?} but got {actual:?}");
                }
                digest
            }
            None => Digest::of_bytes(&bytes),
        };

        self.db(entry_type).store_bytes(digest, bytes).await?;
        if initial_lease {
            self.lease_all(std::iter::once(digest));
        }
        Ok(digest)
    }

    ///
    /// Store the contents of the file at `src`, hashing it in the process (unless
    /// `expected_digest` was already computed by the caller).
    ///
    pub async fn store_file(
        &self,
        entry_type: EntryType,
        src_is_immutable: bool,
        expected_digest: Option<Digest>,
        src: PathBuf,
    ) -> Result<Digest, String> {
        let digest = match expected_digest {
            Some(digest) => digest,
            None => {
                let src = src.clone();
                self.inner
                    .executor
                    .spawn_blocking(
                        move || {
                            let mut file = std::fs::File::open(&src)
                                .map_err(|e| format!("Failed to open {src:?}: {e}"))?;
                            hashing::sync_copy_and_hash(&mut file, &mut std::io::sink())
                                .map_err(|e| format!("Failed to hash {src:?}: {e}"))
                        },
                        |e| Err(format!("Hashing task failed: {e}")),
                    )
                    .await?
            }
        };

        self.db(entry_type)
            .store_from_file(digest, src_is_immutable, src)
            .await?;
        Ok(digest)
    }

    ///
    /// Load the bytes for the given digest (if present), and apply f to them.
    ///
    /// The content hash is verified on read: corrupt entries are removed and reported as
    /// missing.
    ///
    pub async fn load_bytes_with<
        T: Send + 'static,
        F: Fn(&[u8]) -> Result<T, String> + Send + Sync + 'static,
    >(
        &self,
        entry_type: EntryType,
        digest: Digest,
        f: F,
    ) -> Result<Option<T>, String> {
        if digest == hashing::EMPTY_DIGEST {
            // Avoid I/O for this case. This allows some client-provided operations (like
            // merging snapshots) to work without needing to first store the empty snapshot.
            return Ok(Some(f(&[]).map_err(|e| format!("Error applying f: {e}"))?));
        }

        let maybe_bytes = self.db(entry_type).load_bytes(digest).await?;
        if let Some(ref bytes) = maybe_bytes {
            let workunit_store_handle = workunit_store::get_workunit_store_handle();
            if let Some(handle) = workunit_store_handle {
                handle.store.record_observation(
                    ObservationMetric::LocalStoreReadBlobSize,
                    bytes.len() as u64,
                );
            }
        }
        match maybe_bytes {
            Some(bytes) => Ok(Some(f(&bytes).map_err(|e| format!("Error applying f: {e}"))?)),
            None => Ok(None),
        }
    }

    pub fn lease_all(&self, digests: impl Iterator<Item = Digest>) {
        let mut leases = self.inner.leases.lock();
        for digest in digests {
            *leases.entry(digest.hash).or_insert(0) += 1;
        }
    }

    pub fn release_all(&self, digests: impl Iterator<Item = Digest>) {
        let mut leases = self.inner.leases.lock();
        for digest in digests {
            if let Some(count) = leases.get_mut(&digest.hash) {
                *count -= 1;
                if *count == 0 {
                    leases.remove(&digest.hash);
                }
            }
        }
    }

    pub fn reset_leases(&self, digests: impl Iterator<Item = Digest>) {
        let mut leases = self.inner.leases.lock();
        leases.clear();
        for digest in digests {
            *leases.entry(digest.hash).or_insert(0) += 1;
        }
    }

    fn is_leased(&self, fingerprint: Fingerprint) -> bool {
        self.inner.leases.lock().contains_key(&fingerprint)
    }

    ///
    /// Evict least-recently-used, unreferenced entries until the store is below the target
    /// size, returning the resulting total size.
    ///
    pub async fn shrink(
        &self,
        target_bytes: usize,
        _shrink_behavior: ShrinkBehavior,
    ) -> Result<usize, String> {
        let mut aged: Vec<(EntryType, AgedFingerprint)> = Vec::new();
        for (entry_type, db) in [
            (EntryType::File, &self.inner.files_db),
            (EntryType::Directory, &self.inner.directories_db),
        ] {
            aged.extend(
                db.aged_fingerprints()
                    .await?
                    .into_iter()
                    .map(|f| (entry_type, f)),
            );
        }

        let mut total_size: usize = aged.iter().map(|(_, f)| f.size_bytes).sum();

        // Oldest first.
        aged.sort_by(|(_, a), (_, b)| b.expired_seconds_ago.cmp(&a.expired_seconds_ago));

        for (entry_type, fingerprint) in aged {
            if total_size <= target_bytes {
                break;
            }
            if self.is_leased(fingerprint.fingerprint) {
                continue;
            }
            if self.db(entry_type).remove(fingerprint.fingerprint).await? {
                total_size -= fingerprint.size_bytes;
            }
        }

        Ok(total_size)
    }

    pub async fn all_digests(&self) -> Result<Vec<Digest>, String> {
        let mut digests = Vec::new();
        for db in [&self.inner.files_db, &self.inner.directories_db] {
            digests.extend(db.aged_fingerprints().await?.into_iter().map(|f| Digest {
                hash: f.fingerprint,
                size_bytes: f.size_bytes,
            }));
        }
        Ok(digests)
    }
}

///
/// One shard family of content-addressed files.
///
#[derive(Clone)]
struct ShardedFsDb {
    root: PathBuf,
    tmp_root: PathBuf,
    executor: task_executor::Executor,
    // Deduplicates concurrent writes of the same fingerprint.
    dest_initializer: Arc<Mutex<HashMap<Fingerprint, Arc<OnceCell<()>>>>>,
    // A cache of whether destination root directories are hardlinkable from this db.
    hardlinkable_destinations: Arc<Mutex<HashMap<PathBuf, Arc<OnceCell<bool>>>>>,
}

impl ShardedFsDb {
    fn new(
        root: PathBuf,
        tmp_root: PathBuf,
        executor: task_executor::Executor,
    ) -> Result<ShardedFsDb, String> {
        std::fs::create_dir_all(&root)
            .map_err(|e| format!("Failed to create store shard root {root:?}: {e}"))?;
        Ok(ShardedFsDb {
            root,
            tmp_root,
            executor,
            dest_initializer: Arc::default(),
            hardlinkable_destinations: Arc::default(),
        })
    }

    fn get_path(&self, fingerprint: Fingerprint) -> PathBuf {
        let hex = fingerprint.to_hex();
        self.root.join(hex.get(0..2).unwrap()).join(hex)
    }

    async fn is_hardlinkable_destination(&self, destination: &Path) -> Result<bool, String> {
        let cell = {
            let mut cells = self.hardlinkable_destinations.lock();
            if let Some(cell) = cells.get(destination) {
                cell.clone()
            } else {
                let cell = Arc::new(OnceCell::new());
                cells.insert(destination.to_owned(), cell.clone());
                cell
            }
        };

        if let Some(res) = cell.get() {
            return Ok(*res);
        }

        let db = self.clone();
        let dst_parent_dir = destination.to_owned();
        cell.get_or_try_init(async move {
            tokio::fs::create_dir_all(&dst_parent_dir)
                .await
                .map_err(|e| format!("Failed to create directory: {e}"))?;
            let (src_file, dst_dir) = db
                .executor
                .spawn_blocking(
                    move || {
                        let src_file = Builder::new()
                            .suffix(".hardlink_canary")
                            .tempfile_in(&db.root)
                            .map_err(|e| format!("Failed to create hardlink canary file: {e}"))?;
                        let dst_dir = Builder::new()
                            .suffix(".hardlink_canary")
                            .tempdir_in(dst_parent_dir)
                            .map_err(|e| format!("Failed to create hardlink canary dir: {e}"))?;
                        Ok((src_file, dst_dir))
                    },
                    |e| Err(format!("hardlink canary temp files task failed: {e}")),
                )
                .await?;
            let dst_file = dst_dir.path().join("hard_link");
            let is_hardlinkable = hard_link(src_file, dst_file).await.is_ok();
            Ok(is_hardlinkable)
        })
        .await
        .copied()
    }

    async fn exists(&self, fingerprint: Fingerprint) -> Result<bool, String> {
        let path = self.get_path(fingerprint);
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(format!("Failed to stat {path:?}: {e}")),
        }
    }

    async fn store_bytes(&self, digest: Digest, bytes: Bytes) -> Result<(), String> {
        self.write_once(digest.hash, move |tmp_path| {
            let bytes = bytes.clone();
            async move {
                let mut file = tokio::fs::File::create(&tmp_path)
                    .await
                    .map_err(|e| format!("Failed to create {tmp_path:?}: {e}"))?;
                file.write_all(&bytes)
                    .await
                    .map_err(|e| format!("Failed to write bytes to {tmp_path:?}: {e}"))?;
                file.sync_all()
                    .await
                    .map_err(|e| format!("Failed to sync {tmp_path:?}: {e}"))?;
                Ok(())
            }
        })
        .await
    }

    async fn store_from_file(
        &self,
        digest: Digest,
        src_is_immutable: bool,
        src: PathBuf,
    ) -> Result<(), String> {
        let executor = self.executor.clone();
        self.write_once(digest.hash, move |tmp_path| {
            let src = src.clone();
            let executor = executor.clone();
            async move {
                executor
                    .spawn_blocking(
                        move || {
                            let mut reader = std::fs::File::open(&src)
                                .map_err(|e| format!("Failed to open {src:?}: {e}"))?;
                            let mut writer = std::fs::File::create(&tmp_path)
                                .map_err(|e| format!("Failed to create {tmp_path:?}: {e}"))?;
                            let matches = hashing::sync_verified_copy(
                                digest,
                                src_is_immutable,
                                &mut reader,
                                &mut writer,
                            )
                            .map_err(|e| format!("Failed to copy {src:?}: {e}"))?;
                            if !matches {
                                return Err(format!(
                                    "Source file {src:?} did not match its expected digest {digest:?}"
                                ));
                            }
                            writer
                                .sync_all()
                                .map_err(|e| format!("Failed to sync {tmp_path:?}: {e}"))?;
                            Ok(())
                        },
                        |e| Err(format!("Copying task failed: {e}")),
                    )
                    .await
            }
        })
        .await
    }

    ///
    /// Run the given writer against a temp path and atomically rename the result into place,
    /// exactly once per fingerprint per process. If the destination already exists, the write
    /// is skipped entirely.
    ///
    async fn write_once<F, Fut>(&self, fingerprint: Fingerprint, write: F) -> Result<(), String>
    where
        F: Fn(PathBuf) -> Fut,
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        let cell = {
            let mut cells = self.dest_initializer.lock();
            cells.entry(fingerprint).or_default().clone()
        };
        cell.get_or_try_init(async {
            let dest = self.get_path(fingerprint);
            if tokio::fs::metadata(&dest).await.is_ok() {
                // Write-once: the content is already present.
                return Ok(());
            }

            tokio::fs::create_dir_all(dest.parent().unwrap())
                .await
                .map_err(|e| format!("Failed to create shard directory: {e}"))?;

            let tmp_path = self
                .tmp_root
                .join(format!("ingest-{}-{}", fingerprint.to_hex(), std::process::id()));
            write(tmp_path.clone()).await?;

            // Defensive permissions: store contents are immutable.
            tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o444))
                .await
                .map_err(|e| format!("Failed to set permissions on {tmp_path:?}: {e}"))?;
            tokio::fs::rename(&tmp_path, &dest)
                .await
                .map_err(|e| format!("Failed to rename {tmp_path:?} to {dest:?}: {e}"))?;
            Ok(())
        })
        .await
        .copied()
    }

    async fn load_bytes(&self, digest: Digest) -> Result<Option<Bytes>, String> {
        let path = self.get_path(digest.hash);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("Failed to read {path:?}: {e}")),
        };

        // Verify the content hash: corrupt bytes are treated as missing, and removed.
        let actual = Digest::of_bytes(&bytes);
        if actual != digest {
            log::warn!(
                "Store entry {path:?} was corrupt (expected {digest:?}, got {actual:?}): removing."
            );
            let _ = self.remove(digest.hash).await;
            return Ok(None);
        }

        // Mark the entry used for LRU purposes. Failures here are ignorable: the entry merely
        // ages faster.
        let _ = filetime_touch(&path);

        Ok(Some(Bytes::from(bytes)))
    }

    async fn remove(&self, fingerprint: Fingerprint) -> Result<bool, String> {
        // Drop the write-once cell so that a removed entry may be re-stored.
        self.dest_initializer.lock().remove(&fingerprint);
        let path = self.get_path(fingerprint);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(format!("Failed to remove {path:?}: {e}")),
        }
    }

    async fn aged_fingerprints(&self) -> Result<Vec<AgedFingerprint>, String> {
        let root = self.root.clone();
        self.executor
            .spawn_blocking(
                move || {
                    let now = SystemTime::now();
                    let mut fingerprints = Vec::new();
                    let shard_dirs = std::fs::read_dir(&root)
                        .map_err(|e| format!("Failed to list {root:?}: {e}"))?;
                    for shard_dir in shard_dirs {
                        let shard_dir =
                            shard_dir.map_err(|e| format!("Failed to list shard: {e}"))?;
                        if !shard_dir.path().is_dir() {
                            continue;
                        }
                        let entries = std::fs::read_dir(shard_dir.path())
                            .map_err(|e| format!("Failed to list {:?}: {e}", shard_dir.path()))?;
                        for entry in entries {
                            let entry = entry.map_err(|e| format!("Failed to list entry: {e}"))?;
                            let Ok(fingerprint) = Fingerprint::from_hex_string(
                                &entry.file_name().to_string_lossy(),
                            ) else {
                                continue;
                            };
                            let metadata = entry
                                .metadata()
                                .map_err(|e| format!("Failed to stat {entry:?}: {e}"))?;
                            let expired_seconds_ago = metadata
                                .modified()
                                .ok()
                                .and_then(|mtime| now.duration_since(mtime).ok())
                                .map(|age| age.as_secs())
                                .unwrap_or(0);
                            fingerprints.push(AgedFingerprint {
                                expired_seconds_ago,
                                fingerprint,
                                size_bytes: metadata.len() as usize,
                            });
                        }
                    }
                    Ok(fingerprints)
                },
                |e| Err(format!("Walking the store failed: {e}")),
            )
            .await
    }
}

///
/// Update the mtime of the given path to now. This is a single cheap syscall, so it is not
/// offloaded to the blocking pool.
///
fn filetime_touch(path: &Path) -> Result<(), String> {
    let file =
        std::fs::File::open(path).map_err(|e| format!("Failed to open {path:?}: {e}"))?;
    let now = SystemTime::now();
    let times = std::fs::FileTimes::new().set_accessed(now).set_modified(now);
    file.set_times(times)
        .map_err(|e| format!("Failed to touch {path:?}: {e}"))
}
