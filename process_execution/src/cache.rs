// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use cache::{CacheKey, CacheKeyType, PersistentCache};
use log::{debug, warn};
use prost::Message;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use serde::{Deserialize, Serialize};
use store::{Store, StoreError};
use workunit_store::{
    in_workunit, Level, Metric, ObservationMetric, RunningWorkunit, WorkunitMetadata,
};

use crate::{
    check_cache_content, make_action_result, populate_fallible_execution_result,
    CacheContentBehavior, Context, FallibleProcessResultWithPlatform, Platform, Process,
    ProcessCacheScope, ProcessError, ProcessExecutionEnvironment, ProcessResultSource,
};

#[derive(Serialize, Deserialize)]
struct PlatformAndResponseBytes {
    platform: Platform,
    response_bytes: Vec<u8>,
}

///
/// A CommandRunner wrapper which caches process results in a persistent, action-digest-keyed
/// cache.
///
#[derive(Clone)]
pub struct CommandRunner {
    inner: Arc<dyn crate::CommandRunner>,
    cache: PersistentCache,
    file_store: Store,
    cache_read: bool,
    cache_content_behavior: CacheContentBehavior,
    process_cache_namespace: Option<String>,
}

impl CommandRunner {
    pub fn new(
        inner: Arc<dyn crate::CommandRunner>,
        cache: PersistentCache,
        file_store: Store,
        cache_read: bool,
        cache_content_behavior: CacheContentBehavior,
        process_cache_namespace: Option<String>,
    ) -> CommandRunner {
        CommandRunner {
            inner,
            cache,
            file_store,
            cache_read,
            cache_content_behavior,
            process_cache_namespace,
        }
    }
}

impl Debug for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("cache::CommandRunner")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

///
/// Whether a result with the given exit code may be persisted under the given scope.
///
fn cacheable(cache_scope: ProcessCacheScope, exit_code: i32) -> bool {
    match cache_scope {
        ProcessCacheScope::Always => true,
        ProcessCacheScope::Successful => exit_code == 0,
        // Per-restart and per-session scopes are only ever memoized in the graph, never
        // persisted.
        ProcessCacheScope::PerRestartAlways
        | ProcessCacheScope::PerRestartSuccessful
        | ProcessCacheScope::PerSession => false,
    }
}

#[async_trait]
impl crate::CommandRunner for CommandRunner {
    async fn run(
        &self,
        context: Context,
        workunit: &mut RunningWorkunit,
        req: Process,
    ) -> Result<FallibleProcessResultWithPlatform, ProcessError> {
        let write_failures_to_cache = req.cache_scope == ProcessCacheScope::Always;
        let key = CacheKey {
            key_type: CacheKeyType::Process,
            digest: crate::get_digest(&req, None, self.process_cache_namespace.clone()).await?,
        };

        if self.cache_read {
            let context2 = context.clone();
            let key2 = key;
            let environment = ProcessExecutionEnvironment {
                name: None,
                platform: Platform::current()?,
                strategy_cache_value: req.execution_strategy.cache_value(),
            };
            let cache_read_result = in_workunit!(
                "local_cache_read",
                Level::Trace,
                desc = Some(format!("Local cache lookup: {}", req.description)),
                |workunit| async move {
                    workunit.increment_counter(Metric::LocalCacheRequests, 1);

                    match self.lookup(&context2, &key2, environment).await {
                        Ok(Some(result)) if result.exit_code == 0 || write_failures_to_cache => {
                            workunit.increment_counter(Metric::LocalCacheRequestsCached, 1);
                            if let Some(time_saved) = result.metadata.saved_by_cache {
                                let time_saved =
                                    std::time::Duration::from(time_saved).as_millis() as u64;
                                workunit.increment_counter(
                                    Metric::LocalCacheTotalTimeSavedMs,
                                    time_saved,
                                );
                                context2.workunit_store.record_observation(
                                    ObservationMetric::LocalCacheTimeSavedMs,
                                    time_saved,
                                );
                            }
                            // When we successfully use the cache, we change the description and
                            // increase the level (but not so much that it will be logged by
                            // default).
                            workunit.update_metadata(|initial| {
                                initial.map(|(initial, _)| {
                                    (
                                        WorkunitMetadata {
                                            desc: initial
                                                .desc
                                                .as_ref()
                                                .map(|desc| format!("Hit: {desc}")),
                                            ..initial
                                        },
                                        Level::Debug,
                                    )
                                })
                            });
                            Ok(result)
                        }
                        Err(err) => {
                            debug!(
                                "Error loading process execution result from local cache: {err} \
                                - continuing to execute"
                            );
                            workunit.increment_counter(Metric::LocalCacheReadErrors, 1);
                            // Falling through to re-execute.
                            Err(())
                        }
                        Ok(_) => {
                            // Either we missed, or we hit for a failing result.
                            workunit.increment_counter(Metric::LocalCacheRequestsUncached, 1);
                            // Falling through to execute.
                            Err(())
                        }
                    }
                }
            )
            .await;

            if let Ok(result) = cache_read_result {
                return Ok(result);
            }
        }

        let result = self.inner.run(context.clone(), workunit, req.clone()).await?;
        if cacheable(req.cache_scope, result.exit_code) {
            let result = result.clone();
            in_workunit!("local_cache_write", Level::Trace, |workunit| async move {
                if let Err(err) = self.store(&key, &result).await {
                    warn!(
                        "Error storing process execution result to local cache: {err} - \
                        ignoring and continuing"
                    );
                    workunit.increment_counter(Metric::LocalCacheWriteErrors, 1);
                }
            })
            .await;
        }
        Ok(result)
    }

    async fn shutdown(&self) -> Result<(), String> {
        self.inner.shutdown().await
    }
}

impl CommandRunner {
    async fn lookup(
        &self,
        context: &Context,
        action_key: &CacheKey,
        environment: ProcessExecutionEnvironment,
    ) -> Result<Option<FallibleProcessResultWithPlatform>, StoreError> {
        let cache_lookup_start = Instant::now();
        use remexec::ExecuteResponse;

        // See whether there is a cache entry.
        let maybe_cache_value = self.cache.load(action_key).await?;
        let maybe_execute_response = if let Some(bytes) = maybe_cache_value {
            let decoded: PlatformAndResponseBytes = bincode::deserialize(&bytes)
                .map_err(|err| format!("Could not deserialize platform and response: {err}"))?;
            let platform = decoded.platform;
            let execute_response = ExecuteResponse::decode(&decoded.response_bytes[..])
                .map_err(|e| format!("Invalid ExecuteResponse: {e:?}"))?;
            Some((execute_response, platform))
        } else {
            return Ok(None);
        };

        // Deserialize the cache entry if it existed.
        let mut result = if let Some((execute_response, _platform)) = maybe_execute_response {
            if let Some(ref action_result) = execute_response.result {
                populate_fallible_execution_result(
                    self.file_store.clone(),
                    context.run_id,
                    action_result,
                    true,
                    ProcessResultSource::HitLocally,
                    environment,
                )
                .await?
            } else {
                return Err("action result missing from ExecuteResponse"
                    .to_owned()
                    .into());
            }
        } else {
            return Ok(None);
        };

        if check_cache_content(&result, &self.file_store, self.cache_content_behavior).await? {
            // NB: We set the cache hit elapsed time as late as possible (after having validated
            // the cache content).
            result
                .metadata
                .update_cache_hit_elapsed(cache_lookup_start.elapsed());
            Ok(Some(result))
        } else {
            Ok(None)
        }
    }

    async fn store(
        &self,
        action_key: &CacheKey,
        result: &FallibleProcessResultWithPlatform,
    ) -> Result<(), StoreError> {
        let action_result = make_action_result(&self.file_store, result).await?;
        let execute_response = remexec::ExecuteResponse {
            cached_result: true,
            result: Some(action_result),
            ..remexec::ExecuteResponse::default()
        };

        let mut response_bytes = Vec::with_capacity(execute_response.encoded_len());
        execute_response
            .encode(&mut response_bytes)
            .map_err(|err| format!("Error serializing execute process result to cache: {err}"))?;

        let bytes_to_store = bincode::serialize(&PlatformAndResponseBytes {
            platform: result.metadata.environment.platform,
            response_bytes,
        })
        .map(Bytes::from)
        .map_err(|err| format!("Error serializing platform and execute process result: {err}"))?;

        self.cache.store(action_key, bytes_to_store).await?;
        Ok(())
    }
}
