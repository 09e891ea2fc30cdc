// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hashing::Digest;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWrite};

pub mod reapi;

///
/// The configuration for a connection to a remote store or action cache.
///
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemoteStoreOptions {
    /// The URL of the service, including a scheme (`http://`, `https://`).
    pub store_address: String,
    /// The REAPI instance name to include in requests.
    pub instance_name: Option<String>,
    /// Headers (e.g. authorization) to set on every request.
    pub headers: BTreeMap<String, String>,
    /// PEM bytes of root CA certs to trust, or None to use the system roots.
    pub root_ca_certs: Option<Vec<u8>>,
    /// The chunk size used for ByteStream streaming.
    pub chunk_size_bytes: usize,
    /// A timeout applied to each request.
    pub timeout: Duration,
    /// The number of retries for transient failures (in addition to the initial attempt).
    pub retries: usize,
    /// The maximum number of concurrent requests.
    pub concurrency_limit: usize,
    /// The maximum total size of a batched CAS call.
    pub batch_api_size_limit: usize,
}

///
/// A storage backend for bytes, keyed by Digest.
///
#[async_trait]
pub trait ByteStoreProvider: Sync + Send + 'static {
    /// Store the bytes of a small blob.
    async fn store_bytes(&self, digest: Digest, bytes: Bytes) -> Result<(), String>;

    /// Store the contents of the given (large) file.
    async fn store_file(&self, digest: Digest, file: File) -> Result<(), String>;

    /// Load the data stored (if any) for `digest` into `destination`, returning true if it
    /// existed.
    async fn load(
        &self,
        digest: Digest,
        destination: &mut dyn LoadDestination,
    ) -> Result<bool, String>;

    /// Return any digests from `digests` that are not (currently) available.
    async fn list_missing_digests(&self, digests: &[Digest]) -> Result<HashSet<Digest>, String>;
}

///
/// Places that write the result of a remote `load`.
///
#[async_trait]
pub trait LoadDestination: AsyncWrite + Send + Sync + Unpin + 'static {
    /// Clear out the writer and start again, if there's any existing data.
    async fn reset(&mut self) -> std::io::Result<()>;
}

#[async_trait]
impl LoadDestination for File {
    async fn reset(&mut self) -> std::io::Result<()> {
        self.rewind().await?;
        self.set_len(0).await
    }
}

#[async_trait]
impl LoadDestination for Vec<u8> {
    async fn reset(&mut self) -> std::io::Result<()> {
        self.clear();
        Ok(())
    }
}

///
/// A storage backend for REAPI action results, keyed by action Digest.
///
#[async_trait]
pub trait ActionCacheProvider: Sync + Send + 'static {
    async fn update_action_result(
        &self,
        action_digest: Digest,
        action_result: remexec::ActionResult,
    ) -> Result<(), String>;

    async fn get_action_result(
        &self,
        action_digest: Digest,
        build_id: &str,
    ) -> Result<Option<remexec::ActionResult>, String>;
}

///
/// Instantiate a byte store provider for the given options.
///
pub async fn choose_byte_store_provider(
    options: RemoteStoreOptions,
) -> Result<Arc<dyn ByteStoreProvider>, String> {
    Ok(Arc::new(reapi::byte_store::Provider::new(options).await?))
}

///
/// Instantiate an action cache provider for the given options.
///
pub async fn choose_action_cache_provider(
    options: RemoteStoreOptions,
) -> Result<Arc<dyn ActionCacheProvider>, String> {
    Ok(Arc::new(reapi::action_cache::Provider::new(options).await?))
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::LoadDestination;

    #[tokio::test]
    async fn vec_load_destination_resets() {
        let mut destination: Vec<u8> = Vec::new();
        destination.write_all(b"partial read").await.unwrap();
        destination.reset().await.unwrap();
        assert!(destination.is_empty());
    }

    #[tokio::test]
    async fn file_load_destination_resets() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dst");
        let mut destination = tokio::fs::File::create(&path).await.unwrap();
        destination.write_all(b"partial read").await.unwrap();
        destination.flush().await.unwrap();

        LoadDestination::reset(&mut destination).await.unwrap();
        destination.write_all(b"fresh").await.unwrap();
        destination.flush().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"fresh");
    }
}
