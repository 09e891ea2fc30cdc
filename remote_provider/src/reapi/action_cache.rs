// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use async_trait::async_trait;
use hashing::Digest;
use tonic::{Code, Request};

use grpc_util::retry::{retry_call, status_is_retryable};
use grpc_util::{layered_service, status_to_str, LayeredService};
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use remexec::action_cache_client::ActionCacheClient;

use crate::RemoteStoreOptions;

///
/// An action cache provider speaking the REAPI `ActionCache` service.
///
pub struct Provider {
    instance_name: Option<String>,
    client: Arc<ActionCacheClient<LayeredService>>,
}

impl Provider {
    pub async fn new(options: RemoteStoreOptions) -> Result<Provider, String> {
        let channel =
            grpc_util::create_channel(&options.store_address, options.root_ca_certs.as_deref())
                .await?;
        let service = layered_service(channel, &options.headers)?;

        Ok(Provider {
            instance_name: options.instance_name,
            client: Arc::new(ActionCacheClient::new(service)),
        })
    }
}

#[async_trait]
impl crate::ActionCacheProvider for Provider {
    async fn update_action_result(
        &self,
        action_digest: Digest,
        action_result: remexec::ActionResult,
    ) -> Result<(), String> {
        let request = remexec::UpdateActionResultRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            action_digest: Some(action_digest.into()),
            action_result: Some(action_result),
        };

        retry_call(
            self.client.clone(),
            move |mut client, _| {
                let request = request.clone();
                async move {
                    Arc::make_mut(&mut client)
                        .update_action_result(Request::new(request))
                        .await
                }
            },
            status_is_retryable,
        )
        .await
        .map_err(status_to_str)?;
        Ok(())
    }

    async fn get_action_result(
        &self,
        action_digest: Digest,
        _build_id: &str,
    ) -> Result<Option<remexec::ActionResult>, String> {
        let request = remexec::GetActionResultRequest {
            instance_name: self.instance_name.clone().unwrap_or_default(),
            action_digest: Some(action_digest.into()),
            ..remexec::GetActionResultRequest::default()
        };

        let result = retry_call(
            self.client.clone(),
            move |mut client, _| {
                let request = request.clone();
                async move {
                    Arc::make_mut(&mut client)
                        .get_action_result(Request::new(request))
                        .await
                }
            },
            status_is_retryable,
        )
        .await;

        match result {
            Ok(response) => Ok(Some(response.into_inner())),
            Err(status) if status.code() == Code::NotFound => Ok(None),
            Err(status) => Err(status_to_str(status)),
        }
    }
}
