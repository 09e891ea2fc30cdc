// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::{Path, PathBuf};

use bytes::Bytes;

///
/// The kind of a cache key, which partitions the cache into namespaces.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CacheKeyType {
    Process,
}

impl CacheKeyType {
    fn directory_name(&self) -> &'static str {
        match self {
            CacheKeyType::Process => "processes",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CacheKey {
    pub key_type: CacheKeyType,
    pub digest: hashing::Digest,
}

///
/// A persistent key-value cache of small serialized records, stored as sharded files under the
/// cache root (`processes/<2-hex>/<hex>`), with atomic write-to-tmp-and-rename writes.
///
#[derive(Clone)]
pub struct PersistentCache {
    root: PathBuf,
    tmp_root: PathBuf,
}

impl PersistentCache {
    pub fn new<P: AsRef<Path>>(cache_root: P) -> Result<PersistentCache, String> {
        let root = cache_root.as_ref().to_owned();
        let tmp_root = root.join("tmp");
        std::fs::create_dir_all(&tmp_root)
            .map_err(|e| format!("Failed to create cache root {root:?}: {e}"))?;
        Ok(PersistentCache { root, tmp_root })
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        let hex = key.digest.hash.to_hex();
        self.root
            .join(key.key_type.directory_name())
            .join(hex.get(0..2).unwrap())
            .join(hex)
    }

    pub async fn load(&self, key: &CacheKey) -> Result<Option<Bytes>, String> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(format!("Failed to read cache entry {path:?}: {e}")),
        }
    }

    pub async fn store(&self, key: &CacheKey, value: Bytes) -> Result<(), String> {
        let path = self.path_for(key);
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .map_err(|e| format!("Failed to create cache shard for {path:?}: {e}"))?;

        let tmp_path = self.tmp_root.join(format!(
            "{}-{}",
            key.digest.hash.to_hex(),
            std::process::id()
        ));
        tokio::fs::write(&tmp_path, &value)
            .await
            .map_err(|e| format!("Failed to write cache entry {tmp_path:?}: {e}"))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| format!("Failed to rename {tmp_path:?} to {path:?}: {e}"))?;
        Ok(())
    }

    pub async fn remove(&self, key: &CacheKey) -> Result<bool, String> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(format!("Failed to remove cache entry {path:?}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{CacheKey, CacheKeyType, PersistentCache};

    fn key(content: &[u8]) -> CacheKey {
        CacheKey {
            key_type: CacheKeyType::Process,
            digest: hashing::Digest::of_bytes(content),
        }
    }

    #[tokio::test]
    async fn roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = PersistentCache::new(dir.path()).unwrap();
        let key = key(b"process one");

        assert_eq!(cache.load(&key).await.unwrap(), None);
        cache.store(&key, Bytes::from_static(b"result")).await.unwrap();
        assert_eq!(
            cache.load(&key).await.unwrap(),
            Some(Bytes::from_static(b"result"))
        );
    }

    #[tokio::test]
    async fn persists_across_instances() {
        let dir = tempfile::TempDir::new().unwrap();
        let key = key(b"process two");
        {
            let cache = PersistentCache::new(dir.path()).unwrap();
            cache.store(&key, Bytes::from_static(b"kept")).await.unwrap();
        }
        let cache = PersistentCache::new(dir.path()).unwrap();
        assert_eq!(
            cache.load(&key).await.unwrap(),
            Some(Bytes::from_static(b"kept"))
        );
    }

    #[tokio::test]
    async fn remove() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = PersistentCache::new(dir.path()).unwrap();
        let key = key(b"process three");

        cache.store(&key, Bytes::from_static(b"gone")).await.unwrap();
        assert!(cache.remove(&key).await.unwrap());
        assert_eq!(cache.load(&key).await.unwrap(), None);
        assert!(!cache.remove(&key).await.unwrap());
    }
}
