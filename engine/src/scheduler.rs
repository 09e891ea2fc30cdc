// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future;

use crate::context::Core;
use crate::core::{Failure, Params, TypeId, Value};
use crate::nodes::{NodeKey, NodeOutput, Root};
use crate::session::Session;

///
/// The set of root demands for one execution.
///
#[derive(Default)]
pub struct ExecutionRequest {
    pub roots: Vec<Root>,
}

impl ExecutionRequest {
    pub fn new() -> ExecutionRequest {
        ExecutionRequest::default()
    }
}

///
/// The reason an execution did not produce per-root results.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExecutionTermination {
    /// The Session was cancelled.
    Cancelled,
    /// An unrecoverable error occurred.
    Fatal(String),
}

pub struct Scheduler {
    pub core: Arc<Core>,
}

impl Scheduler {
    pub fn new(core: Core) -> Scheduler {
        Scheduler {
            core: Arc::new(core),
        }
    }

    ///
    /// Add a demand for the given product under the given params to the request, validating
    /// that an installed Query can satisfy it.
    ///
    pub fn add_root_select(
        &self,
        request: &mut ExecutionRequest,
        params: Params,
        product: TypeId,
    ) -> Result<(), String> {
        self.core
            .rule_graph
            .find_root(params.type_ids(), product)?;
        request.roots.push(Root::new(params, product));
        Ok(())
    }

    ///
    /// Invalidate the invalidation roots represented by the given Paths.
    ///
    pub fn invalidate_paths(&self, paths: &HashSet<PathBuf>) -> usize {
        use watch::Invalidatable;
        self.core.graph.invalidate(paths, "external")
    }

    ///
    /// Invalidate all filesystem dependencies in the graph.
    ///
    pub fn invalidate_all_paths(&self) -> usize {
        let invalidation_result = self
            .core
            .graph
            .invalidate_from_roots(true, |node| node.fs_subject().is_some());
        invalidation_result.cleared + invalidation_result.dirtied
    }

    ///
    /// Execute the given request's roots in the given Session, returning one Result per root.
    ///
    /// Cancellation of the Session drops the root demands: nodes with no other live dependents
    /// are transitively canceled, and in-flight processes are signaled.
    ///
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        session: &Session,
    ) -> Result<Vec<Result<Value, Failure>>, ExecutionTermination> {
        let context = session.graph_context();
        let core = self.core.clone();
        let roots = request.roots.clone();

        let execute = future::join_all(
            roots
                .into_iter()
                .map(|root| {
                    let context = context.clone();
                    let core = core.clone();
                    async move {
                        let result = core
                            .graph
                            .create(NodeKey::Root(Box::new(root)), &context)
                            .await?;
                        match result {
                            NodeOutput::Value(value) => Ok(value),
                            other => Err(Failure::Throw {
                                val: format!("Root returned an unexpected output: {other:?}"),
                                engine_traceback: vec![],
                            }),
                        }
                    }
                })
                .collect::<Vec<_>>(),
        );

        // Scope the Session's workunit store to the executing tasks, so that workunits created
        // by Nodes are recorded in this Session's timeline.
        let workunit_store_handle = workunit_store::WorkunitStoreHandle {
            store: session.workunit_store(),
            parent_id: None,
        };
        workunit_store::scope_task_workunit_store_handle(Some(workunit_store_handle), async move {
            tokio::select! {
                _ = session.cancelled() => {
                    // The Session was cancelled: the futures above are dropped, which
                    // transitively cancels any nodes without other live dependents.
                    Err(ExecutionTermination::Cancelled)
                }
                results = execute => Ok(results),
            }
        })
        .await
    }

    ///
    /// Garbage collect the store: refresh the reference set from the values currently retained
    /// by the node graph, and then evict unreferenced entries down to the target size.
    ///
    pub async fn garbage_collect(
        &self,
        session: &Session,
        target_size_bytes: usize,
    ) -> Result<(), String> {
        let context = session.graph_context();
        let mut retained = Vec::new();
        self.core.graph.visit_live(&context, |_, output| {
            retained.extend(output.digests());
        });
        self.core.store().reset_leases(retained.into_iter());
        self.core
            .store()
            .garbage_collect(target_size_bytes, store::ShrinkBehavior::Fast)
            .await
    }

    ///
    /// The number of Nodes in the Graph, for introspection.
    ///
    pub fn node_count(&self) -> usize {
        self.core.graph.len()
    }
}
