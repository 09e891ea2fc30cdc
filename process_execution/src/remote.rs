// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, trace};
use prost::Message;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use protos::gen::google::longrunning::{operation, Operation};
use remexec::execution_client::ExecutionClient;
use remexec::{ExecuteRequest, ExecuteResponse, ExecutionStage, WaitExecutionRequest};
use store::Store;
use tonic::{Code, Request};
use workunit_store::{in_workunit, Metric, RunningWorkunit};

use grpc_util::retry::status_is_retryable;
use grpc_util::{layered_service, status_to_str, LayeredService};

use crate::{
    make_execute_request, populate_fallible_execution_result, Context, EntireExecuteRequest,
    FallibleProcessResultWithPlatform, Platform, Process, ProcessError,
    ProcessExecutionEnvironment, ProcessResultSource,
};

///
/// The number of times a transient transport failure is retried (with backoff) before the
/// execution is surfaced as failed.
///
const MAX_EXECUTION_RETRIES: u32 = 3;

///
/// A CommandRunner which executes processes on a Remote Execution API v2 service: inputs are
/// uploaded to the remote CAS, the Execute/WaitExecution operation stream is followed until the
/// action completes, and outputs are fetched back into the local store on demand.
///
pub struct CommandRunner {
    instance_name: Option<String>,
    process_cache_namespace: Option<String>,
    store: Store,
    execution_client: Arc<ExecutionClient<LayeredService>>,
    overall_deadline: Duration,
    retry_interval_duration: Duration,
}

enum OperationOrStatus {
    Operation(Operation),
    Status(tonic::Status),
}

impl CommandRunner {
    pub async fn new(
        execution_address: &str,
        instance_name: Option<String>,
        process_cache_namespace: Option<String>,
        root_ca_certs: Option<Vec<u8>>,
        headers: BTreeMap<String, String>,
        store: Store,
        overall_deadline: Duration,
        retry_interval_duration: Duration,
    ) -> Result<Self, String> {
        let channel = grpc_util::create_channel(execution_address, root_ca_certs.as_deref()).await?;
        let service = layered_service(channel, &headers)?;

        Ok(CommandRunner {
            instance_name,
            process_cache_namespace,
            store,
            execution_client: Arc::new(ExecutionClient::new(service)),
            overall_deadline,
            retry_interval_duration,
        })
    }

    ///
    /// Follow one Execute (or WaitExecution) operation stream until it terminates, returning
    /// the final Operation, or the Status which broke the stream.
    ///
    async fn wait_on_operation_stream(
        mut stream: tonic::codec::Streaming<Operation>,
    ) -> OperationOrStatus {
        let mut last_operation = None;
        loop {
            match stream.next().await {
                Some(Ok(operation)) => {
                    if let Some(metadata) = decode_operation_metadata(&operation) {
                        trace!(
                            "Operation {} at stage {:?}",
                            operation.name,
                            ExecutionStage::try_from(metadata.stage).unwrap_or(ExecutionStage::Unknown)
                        );
                    }
                    let done = operation.done;
                    last_operation = Some(operation);
                    if done {
                        break;
                    }
                }
                Some(Err(status)) => return OperationOrStatus::Status(status),
                None => break,
            }
        }

        match last_operation {
            Some(operation) => OperationOrStatus::Operation(operation),
            None => OperationOrStatus::Status(tonic::Status::internal(
                "Operation stream ended without sending an Operation.",
            )),
        }
    }

    async fn extract_response(
        &self,
        operation: Operation,
        context: &Context,
        environment: &ProcessExecutionEnvironment,
    ) -> Result<FallibleProcessResultWithPlatform, ExecutionError> {
        if !operation.done {
            return Err(ExecutionError::Retryable(
                "Operation was not done when the stream terminated.".to_owned(),
            ));
        }

        let execute_response = match operation.result {
            Some(operation::Result::Response(any)) => ExecuteResponse::decode(&any.value[..])
                .map_err(|e| {
                    ExecutionError::Fatal(format!("Invalid ExecuteResponse: {e:?}").into())
                })?,
            Some(operation::Result::Error(status)) => {
                return Err(rpc_status_to_execution_error(status));
            }
            None => {
                return Err(ExecutionError::Fatal(
                    "Operation finished with neither a response nor an error.".to_owned().into(),
                ));
            }
        };

        if let Some(status) = execute_response.status {
            if status.code != Code::Ok as i32 {
                return Err(rpc_status_to_execution_error(status));
            }
        }

        let action_result = execute_response
            .result
            .as_ref()
            .ok_or_else(|| {
                ExecutionError::Fatal("ExecuteResponse was missing an ActionResult.".to_owned().into())
            })?;

        let source = if execute_response.cached_result {
            ProcessResultSource::HitRemotely
        } else {
            ProcessResultSource::Ran
        };

        populate_fallible_execution_result(
            self.store.clone(),
            context.run_id,
            action_result,
            false,
            source,
            environment.clone(),
        )
        .await
        .map_err(|e| ExecutionError::Fatal(e.into()))
    }

    ///
    /// Run the Execute/WaitExecution loop for the given request, retrying transient failures.
    ///
    async fn run_execute_request(
        &self,
        execute_request: ExecuteRequest,
        process: &Process,
        context: &Context,
        workunit: &mut RunningWorkunit,
    ) -> Result<FallibleProcessResultWithPlatform, ProcessError> {
        let environment = ProcessExecutionEnvironment {
            name: None,
            platform: Platform::current()?,
            strategy_cache_value: process.execution_strategy.cache_value(),
        };

        let start = Instant::now();
        let mut current_operation_name: Option<String> = None;
        let mut num_retries = 0;

        loop {
            if start.elapsed() > self.overall_deadline {
                workunit.increment_counter(Metric::RemoteExecutionTimeouts, 1);
                return Err(ProcessError::Unclassified(format!(
                    "Remote execution of {} timed out after {:?}",
                    process.description, self.overall_deadline
                )));
            }
            if num_retries > MAX_EXECUTION_RETRIES {
                workunit.increment_counter(Metric::RemoteExecutionErrors, 1);
                return Err(ProcessError::Unclassified(format!(
                    "Too many failures from server. The last event was the server disconnecting \
                    with this message: {}",
                    current_operation_name.unwrap_or_default()
                )));
            }
            if num_retries > 0 {
                tokio::time::sleep(self.retry_interval_duration * num_retries).await;
            }

            // Open (or re-open) the operation stream.
            let stream_result = match current_operation_name.take() {
                None => {
                    let mut client = (*self.execution_client).clone();
                    client
                        .execute(Request::new(execute_request.clone()))
                        .await
                }
                Some(operation_name) => {
                    let mut client = (*self.execution_client).clone();
                    client
                        .wait_execution(Request::new(WaitExecutionRequest {
                            name: operation_name,
                        }))
                        .await
                }
            };

            let operation_or_status = match stream_result {
                Ok(response) => {
                    let stream = response.into_inner();
                    Self::wait_on_operation_stream(stream).await
                }
                Err(status) => OperationOrStatus::Status(status),
            };

            match operation_or_status {
                OperationOrStatus::Operation(operation) => {
                    if !operation.done {
                        // The stream ended cleanly, but the operation is still running:
                        // reconnect to it.
                        current_operation_name = Some(operation.name);
                        continue;
                    }
                    match self.extract_response(operation, context, &environment).await {
                        Ok(result) => {
                            workunit.increment_counter(Metric::RemoteExecutionSuccess, 1);
                            return Ok(result);
                        }
                        Err(ExecutionError::Retryable(message)) => {
                            debug!("Retryable remote execution failure: {message}");
                            num_retries += 1;
                        }
                        Err(ExecutionError::Fatal(error)) => {
                            workunit.increment_counter(Metric::RemoteExecutionErrors, 1);
                            return Err(error);
                        }
                        Err(ExecutionError::MissingRemoteDigests(digests)) => {
                            // The server reported missing inputs: upload them and re-run.
                            debug!("Server reported missing digests: re-uploading {digests:?}");
                            self.store
                                .ensure_remote_has_recursive(digests)
                                .await
                                .map_err(ProcessError::from)?;
                        }
                    }
                }
                OperationOrStatus::Status(status) if status_is_retryable(&status) => {
                    debug!(
                        "Transient error communicating with the remote execution server: {}",
                        status_to_str(status)
                    );
                    num_retries += 1;
                }
                OperationOrStatus::Status(status) => {
                    workunit.increment_counter(Metric::RemoteExecutionErrors, 1);
                    return Err(ProcessError::Unclassified(status_to_str(status)));
                }
            }
        }
    }
}

impl Debug for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("remote::CommandRunner")
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl crate::CommandRunner for CommandRunner {
    ///
    /// Run the given Process remotely, via the Remote Execution API.
    ///
    async fn run(
        &self,
        context: Context,
        _workunit: &mut RunningWorkunit,
        request: Process,
    ) -> Result<FallibleProcessResultWithPlatform, ProcessError> {
        let EntireExecuteRequest {
            action,
            command,
            execute_request,
        } = make_execute_request(
            &request,
            self.instance_name.clone(),
            self.process_cache_namespace.clone(),
        )?;

        in_workunit!(
            "run_execute_process_remote",
            request.level,
            desc = Some(request.description.clone()),
            |workunit| async move {
                workunit.increment_counter(Metric::RemoteExecutionRequests, 1);

                // Ensure that the remote CAS has the inputs for this process, transitively.
                let entire_request = EntireExecuteRequest {
                    action,
                    command,
                    execute_request: execute_request.clone(),
                };
                let (action_digest, command_digest) =
                    crate::ensure_action_stored_locally(&self.store, &entire_request).await?;
                self.store
                    .ensure_remote_has_recursive(vec![
                        action_digest,
                        command_digest,
                        request.input_digests.complete.as_digest(),
                    ])
                    .await?;

                self.run_execute_request(execute_request, &request, &context, workunit)
                    .await
            }
        )
        .await
    }

    async fn shutdown(&self) -> Result<(), String> {
        Ok(())
    }
}

enum ExecutionError {
    Fatal(ProcessError),
    Retryable(String),
    MissingRemoteDigests(Vec<hashing::Digest>),
}

fn decode_operation_metadata(operation: &Operation) -> Option<remexec::ExecuteOperationMetadata> {
    let any = operation.metadata.as_ref()?;
    remexec::ExecuteOperationMetadata::decode(&any.value[..]).ok()
}

///
/// Convert a google.rpc.Status from the execution service into an ExecutionError, decoding any
/// `FailedPrecondition` missing-blob details.
///
fn rpc_status_to_execution_error(
    status: protos::gen::google::rpc::Status,
) -> ExecutionError {
    let code = Code::from_i32(status.code);
    match code {
        Code::Aborted | Code::Internal | Code::ResourceExhausted | Code::Unavailable => {
            ExecutionError::Retryable(status.message)
        }
        Code::FailedPrecondition => {
            // The server may report missing preconditions (blobs) as structured details; we
            // conservatively treat the referenced digests as needing re-upload.
            let missing = extract_missing_digests(&status);
            if missing.is_empty() {
                ExecutionError::Fatal(ProcessError::Unclassified(format!(
                    "Remote execution failed: {}",
                    status.message
                )))
            } else {
                ExecutionError::MissingRemoteDigests(missing)
            }
        }
        Code::DeadlineExceeded => ExecutionError::Retryable(status.message),
        _ => ExecutionError::Fatal(ProcessError::Unclassified(format!(
            "Remote execution failed ({:?}): {}",
            code, status.message
        ))),
    }
}

fn extract_missing_digests(status: &protos::gen::google::rpc::Status) -> Vec<hashing::Digest> {
    // The REAPI encodes missing blobs as a PreconditionFailure detail with "MISSING" violations
    // of the form `blobs/<hash>/<size>`. We parse the subject strings directly rather than
    // carrying the full google.rpc error details protos.
    let mut missing = Vec::new();
    for detail in &status.details {
        let message = String::from_utf8_lossy(&detail.value);
        for part in message.split("blobs/").skip(1) {
            let mut components = part.split('/');
            let Some(hash) = components.next() else {
                continue;
            };
            let Some(size) = components.next() else {
                continue;
            };
            let size: String = size
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let (Ok(fingerprint), Ok(size_bytes)) =
                (hashing::Fingerprint::from_hex_string(hash), size.parse::<usize>())
            {
                missing.push(hashing::Digest::new(fingerprint, size_bytes));
            }
        }
    }
    missing
}
