// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use futures::future;
use graph::Context;
use internment::Intern;
use rule_graph::DependencyKey;

use super::{select, NodeKey, NodeResult};
use crate::core::{throw, Key, Params, TypeId, Value};
use crate::tasks::{Rule, Task};

///
/// A Node that runs a registered task rule under a parameter tuple.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TaskNode {
    pub params: Params,
    pub task: Arc<Task>,
    // The rule-graph entry for this (rule, params) pair, used to resolve the task's gets
    // without further search.
    pub entry: Intern<rule_graph::Entry<Rule>>,
}

impl TaskNode {
    pub(super) async fn run_node(self, context: Context<NodeKey>) -> NodeResult<Value> {
        let func = self.task.func.clone();
        let task_id = self.task.id.clone();
        let task_context = TaskContext {
            context: context.clone(),
            params: self.params,
            entry: self.entry,
        };

        func(task_context)
            .await
            .map_err(|failure| failure.with_pushed_frame(&format!("@rule({task_id})")))
    }
}

///
/// The handle passed to a running task rule: provides access to the rule's params, and the
/// ability to `get` further products. Every `get` suspends the rule, releasing its worker.
///
#[derive(Clone)]
pub struct TaskContext {
    context: Context<NodeKey>,
    params: Params,
    entry: Intern<rule_graph::Entry<Rule>>,
}

impl TaskContext {
    ///
    /// Returns the param of the given type, which must be declared by the rule.
    ///
    pub fn get_param(&self, type_id: TypeId) -> NodeResult<Value> {
        self.params
            .find(type_id)
            .map(|key| key.to_value())
            .ok_or_else(|| {
                throw(format!(
                    "Expected a Param of type {type_id} to be present, but had only: {}",
                    self.params
                ))
            })
    }

    ///
    /// Request the product of the given type, optionally providing additional params which
    /// come into scope for the requested subgraph.
    ///
    /// The get must have been declared when the rule was registered: resolution consults the
    /// rule graph table rather than searching.
    ///
    pub async fn get(&self, product: TypeId, provided: Vec<Key>) -> NodeResult<Value> {
        let dependency_key = DependencyKey::new_with_params(
            product,
            provided.iter().map(|key| *key.type_id()),
        );
        let edges = self
            .context
            .core
            .rule_graph
            .edges_for_inner(&self.entry)
            .ok_or_else(|| {
                throw(format!(
                    "Tried to request {dependency_key} but found no edges for the current rule."
                ))
            })?;
        let entry = edges.entry_for(&dependency_key).ok_or_else(|| {
            throw(format!(
                "The current rule did not declare a dependency on {dependency_key}: declared \
                gets are {:?}",
                edges.all_dependencies().collect::<Vec<_>>()
            ))
        })?;

        let mut params = self.params.clone();
        params.extend(provided);
        select(self.context.clone(), params, entry.into()).await
    }

    ///
    /// Request a batch of products concurrently. The results are returned in the order of the
    /// requests; the requests themselves are unordered with respect to each other, but all
    /// complete before the rule resumes.
    ///
    pub async fn get_many(
        &self,
        gets: Vec<(TypeId, Vec<Key>)>,
    ) -> NodeResult<Vec<Value>> {
        future::try_join_all(
            gets.into_iter()
                .map(|(product, provided)| self.get(product, provided))
                .collect::<Vec<_>>(),
        )
        .await
    }
}
