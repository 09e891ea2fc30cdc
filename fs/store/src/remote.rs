// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use hashing::Digest;
use log::Level;
use remote_provider::{choose_byte_store_provider, ByteStoreProvider, RemoteStoreOptions};
use workunit_store::{get_workunit_store_handle, ObservationMetric};

///
/// The remote side of the Store: a thin wrapper around a `ByteStoreProvider` which adds
/// metrics.
///
#[derive(Clone)]
pub(crate) struct ByteStore {
    provider: Arc<dyn ByteStoreProvider>,
}

impl ByteStore {
    pub async fn from_options(options: RemoteStoreOptions) -> Result<ByteStore, String> {
        let provider = choose_byte_store_provider(options).await?;
        Ok(ByteStore { provider })
    }

    pub async fn store_bytes(&self, digest: Digest, bytes: Bytes) -> Result<(), String> {
        self.provider.store_bytes(digest, bytes).await
    }

    pub async fn load_bytes(&self, digest: Digest) -> Result<Option<Bytes>, String> {
        let start = Instant::now();
        let mut destination = Vec::with_capacity(digest.size_bytes);
        let found = self.provider.load(digest, &mut destination).await?;

        if let Some(workunit_store_handle) = get_workunit_store_handle() {
            workunit_store_handle.store.record_observation(
                ObservationMetric::RemoteStoreTimeToFirstByteMicros,
                start.elapsed().as_micros() as u64,
            );
        }

        if !found {
            return Ok(None);
        }

        let bytes = Bytes::from(destination);
        if bytes.len() != digest.size_bytes {
            log::log!(
                Level::Warn,
                "Remote store returned {} bytes for {digest:?}: discarding.",
                bytes.len()
            );
            return Ok(None);
        }
        Ok(Some(bytes))
    }

    pub async fn list_missing_digests(
        &self,
        digests: &[Digest],
    ) -> Result<HashSet<Digest>, String> {
        self.provider.list_missing_digests(digests).await
    }
}
