// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use hashing::Digest;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tonic::{Code, Request};

use grpc_util::retry::{retry_call, status_is_retryable};
use grpc_util::{layered_service, status_to_str, LayeredService};
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use protos::gen::google::bytestream::byte_stream_client::ByteStreamClient;
use remexec::content_addressable_storage_client::ContentAddressableStorageClient;

use crate::{LoadDestination, RemoteStoreOptions};

///
/// A byte store provider speaking the REAPI `ContentAddressableStorage` and `ByteStream`
/// services: small blobs use the batch APIs, large blobs are streamed.
///
pub struct Provider {
    instance_name: Option<String>,
    chunk_size_bytes: usize,
    batch_api_size_limit: usize,
    cas_client: Arc<ContentAddressableStorageClient<LayeredService>>,
    byte_stream_client: Arc<ByteStreamClient<LayeredService>>,
    request_limiter: Semaphore,
}

impl Provider {
    pub async fn new(options: RemoteStoreOptions) -> Result<Provider, String> {
        let channel =
            grpc_util::create_channel(&options.store_address, options.root_ca_certs.as_deref())
                .await?;
        let service = layered_service(channel, &options.headers)?;

        Ok(Provider {
            instance_name: options.instance_name,
            chunk_size_bytes: options.chunk_size_bytes,
            batch_api_size_limit: options.batch_api_size_limit,
            cas_client: Arc::new(ContentAddressableStorageClient::new(service.clone())),
            byte_stream_client: Arc::new(ByteStreamClient::new(service)),
            request_limiter: Semaphore::new(std::cmp::max(options.concurrency_limit, 1)),
        })
    }

    fn read_resource_name(&self, digest: Digest) -> String {
        format!(
            "{}/blobs/{}/{}",
            self.instance_name.as_deref().unwrap_or_default(),
            digest.hash,
            digest.size_bytes
        )
    }

    fn write_resource_name(&self, digest: Digest) -> String {
        format!(
            "{}/uploads/{}/blobs/{}/{}",
            self.instance_name.as_deref().unwrap_or_default(),
            uuid::Uuid::new_v4(),
            digest.hash,
            digest.size_bytes
        )
    }

    async fn store_bytes_batch(&self, digest: Digest, bytes: Bytes) -> Result<(), String> {
        let request = remexec::BatchUpdateBlobsRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            requests: vec![remexec::batch_update_blobs_request::Request {
                digest: Some(digest.into()),
                data: bytes,
            }],
        };

        let _permit = self.acquire_permit().await?;
        let client = self.cas_client.clone();
        let response = retry_call(
            client,
            move |mut client, _| {
                let request = request.clone();
                async move {
                    Arc::make_mut(&mut client)
                        .batch_update_blobs(Request::new(request))
                        .await
                }
            },
            status_is_retryable,
        )
        .await
        .map_err(status_to_str)?;

        for response in &response.get_ref().responses {
            let code = response
                .status
                .as_ref()
                .map(|status| status.code)
                .unwrap_or(Code::Ok as i32);
            if code != Code::Ok as i32 {
                return Err(format!(
                    "Uploading blob {digest:?} was rejected: {:?}",
                    response.status
                ));
            }
        }
        Ok(())
    }

    async fn store_stream(
        &self,
        digest: Digest,
        mut read_chunk: impl FnMut(usize) -> Result<Bytes, String>,
    ) -> Result<(), String> {
        let chunks = self.read_write_chunks(digest, &mut read_chunk)?;

        let _permit = self.acquire_permit().await?;
        let client = self.byte_stream_client.clone();
        let response = retry_call(
            (client, chunks),
            move |(mut client, chunks), _| async move {
                let stream = futures::stream::iter(chunks);
                Arc::make_mut(&mut client).write(stream).await
            },
            status_is_retryable,
        )
        .await
        .map_err(status_to_str)?;

        if response.get_ref().committed_size != digest.size_bytes as i64 {
            return Err(format!(
                "Uploading {digest:?} was incomplete: committed {} of {} bytes",
                response.get_ref().committed_size,
                digest.size_bytes,
            ));
        }
        Ok(())
    }

    ///
    /// Assemble the full sequence of WriteRequests for a streamed upload. The chunks are built
    /// eagerly so that retried calls re-send identical content.
    ///
    fn read_write_chunks(
        &self,
        digest: Digest,
        read_chunk: &mut impl FnMut(usize) -> Result<Bytes, String>,
    ) -> Result<Vec<protos::gen::google::bytestream::WriteRequest>, String> {
        let resource_name = self.write_resource_name(digest);
        let mut requests = Vec::new();
        let mut write_offset = 0usize;
        loop {
            let data = read_chunk(self.chunk_size_bytes)?;
            let finish_write = write_offset + data.len() >= digest.size_bytes;
            requests.push(protos::gen::google::bytestream::WriteRequest {
                resource_name: if write_offset == 0 {
                    resource_name.clone()
                } else {
                    String::new()
                },
                write_offset: write_offset as i64,
                finish_write,
                data: data.clone(),
            });
            write_offset += data.len();
            if finish_write {
                break;
            }
            if data.is_empty() {
                return Err(format!(
                    "Stored file for {digest:?} was shorter than expected: {write_offset} bytes"
                ));
            }
        }
        Ok(requests)
    }

    async fn acquire_permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>, String> {
        self.request_limiter
            .acquire()
            .await
            .map_err(|e| format!("Could not acquire a request permit: {e}"))
    }
}

#[async_trait]
impl crate::ByteStoreProvider for Provider {
    async fn store_bytes(&self, digest: Digest, bytes: Bytes) -> Result<(), String> {
        if digest.size_bytes <= self.batch_api_size_limit {
            self.store_bytes_batch(digest, bytes).await
        } else {
            let mut offset = 0usize;
            self.store_stream(digest, move |chunk_size| {
                let end = std::cmp::min(offset + chunk_size, bytes.len());
                let chunk = bytes.slice(offset..end);
                offset = end;
                Ok(chunk)
            })
            .await
        }
    }

    async fn store_file(&self, digest: Digest, file: tokio::fs::File) -> Result<(), String> {
        // NB: The file is read synchronously per chunk while assembling the retry-stable chunk
        // sequence.
        let mut file = file.into_std().await;
        use std::io::Read;
        self.store_stream(digest, move |chunk_size| {
            let mut buf = vec![0u8; chunk_size];
            let mut read = 0;
            while read < chunk_size {
                let n = file
                    .read(&mut buf[read..])
                    .map_err(|e| format!("Failed to read file for {digest:?}: {e}"))?;
                if n == 0 {
                    break;
                }
                read += n;
            }
            buf.truncate(read);
            Ok(Bytes::from(buf))
        })
        .await
    }

    async fn load(
        &self,
        digest: Digest,
        destination: &mut dyn LoadDestination,
    ) -> Result<bool, String> {
        let resource_name = self.read_resource_name(digest);

        let _permit = self.acquire_permit().await?;
        let client = self.byte_stream_client.clone();

        let result = retry_call(
            client,
            move |mut client, _| {
                let resource_name = resource_name.clone();
                async move {
                    Arc::make_mut(&mut client)
                        .read(Request::new(
                            protos::gen::google::bytestream::ReadRequest {
                                resource_name,
                                read_offset: 0,
                                read_limit: 0,
                            },
                        ))
                        .await
                }
            },
            status_is_retryable,
        )
        .await;

        let mut stream = match result {
            Ok(response) => response.into_inner(),
            Err(status) if status.code() == Code::NotFound => return Ok(false),
            Err(status) => return Err(status_to_str(status)),
        };

        destination
            .reset()
            .await
            .map_err(|e| format!("Failed to reset load destination: {e}"))?;

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(response) => destination
                    .write_all(&response.data)
                    .await
                    .map_err(|e| format!("Failed to write chunk of {digest:?}: {e}"))?,
                Err(status) if status.code() == Code::NotFound => return Ok(false),
                Err(status) => return Err(status_to_str(status)),
            }
        }
        destination
            .flush()
            .await
            .map_err(|e| format!("Failed to flush load destination: {e}"))?;
        Ok(true)
    }

    async fn list_missing_digests(&self, digests: &[Digest]) -> Result<HashSet<Digest>, String> {
        let request = remexec::FindMissingBlobsRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            blob_digests: digests.iter().map(|d| d.into()).collect(),
        };

        let _permit = self.acquire_permit().await?;
        let client = self.cas_client.clone();
        let response = retry_call(
            client,
            move |mut client, _| {
                let request = request.clone();
                async move {
                    Arc::make_mut(&mut client)
                        .find_missing_blobs(Request::new(request))
                        .await
                }
            },
            status_is_retryable,
        )
        .await
        .map_err(status_to_str)?;

        response
            .into_inner()
            .missing_blob_digests
            .iter()
            .map(|digest| {
                digest
                    .try_into()
                    .map_err(|e| format!("Bad digest in FindMissingBlobs response: {e}"))
            })
            .collect()
    }
}
