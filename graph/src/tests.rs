// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{CompoundNode, Context, Graph, InvalidationResult, Node, NodeError};

fn empty_graph() -> Arc<Graph<TNode>> {
    Arc::new(Graph::new_with_invalidation_delay(
        task_executor::Executor::new(),
        Duration::from_millis(10),
    ))
}

///
/// A scripted test node: its dependencies, output values, delays, and cacheability all come
/// from the TContext.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct TNode {
    id: usize,
    cacheable: bool,
}

impl TNode {
    fn new(id: usize) -> TNode {
        TNode {
            id,
            cacheable: true,
        }
    }
}

impl CompoundNode<TNode> for TNode {
    type Item = Vec<usize>;
}

impl fmt::Display for TNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TNode({})", self.id)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum TError {
    Cyclic(Vec<usize>),
    Invalidated,
    Generic(String),
}

impl NodeError for TError {
    fn invalidated() -> Self {
        TError::Invalidated
    }

    fn generic(message: String) -> Self {
        TError::Generic(message)
    }
}

///
/// A context which scripts the behavior of TNodes, and records the order in which they ran.
///
#[derive(Clone, Default)]
struct TContext {
    // Dependencies of each node id.
    edges: Arc<Mutex<HashMap<usize, Vec<usize>>>>,
    // An additive value mixed into a node's own output entry: changing a salt changes the
    // node's output.
    salts: Arc<Mutex<HashMap<usize, usize>>>,
    // Nodes which ignore their dependencies' values when computing their output (but still
    // request them). Used to exercise early cutoff.
    masked: Arc<Mutex<HashSet<usize>>>,
    // Nodes whose output may only be reused within one Run.
    uncacheable: Arc<Mutex<HashSet<usize>>>,
    // Delay before each node completes.
    delays: Arc<Mutex<HashMap<usize, Duration>>>,
    runs: Arc<Mutex<Vec<usize>>>,
}

impl TContext {
    fn set_edges(&self, src: usize, dsts: Vec<usize>) {
        self.edges.lock().insert(src, dsts);
    }

    fn set_salt(&self, id: usize, salt: usize) {
        self.salts.lock().insert(id, salt);
    }

    fn set_masked(&self, id: usize) {
        self.masked.lock().insert(id);
    }

    fn set_uncacheable(&self, id: usize) {
        self.uncacheable.lock().insert(id);
    }

    fn set_delay(&self, id: usize, delay: Duration) {
        self.delays.lock().insert(id, delay);
    }

    fn runs(&self) -> Vec<usize> {
        self.runs.lock().clone()
    }

    fn clear_runs(&self) {
        self.runs.lock().clear();
    }
}

#[async_trait]
impl Node for TNode {
    type Context = TContext;
    type Item = Vec<usize>;
    type Error = TError;

    fn restartable(&self) -> bool {
        true
    }

    fn cacheable(&self) -> bool {
        self.cacheable
    }

    fn cyclic_error(path: &[&TNode]) -> TError {
        TError::Cyclic(path.iter().map(|n| n.id).collect())
    }

    async fn run(self, context: Context<TNode>) -> Result<Vec<usize>, TError> {
        let id = self.id;
        let script = context.context().clone();
        script.runs.lock().push(id);

        let delay = script.delays.lock().get(&id).cloned();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let deps = script.edges.lock().get(&id).cloned().unwrap_or_default();
        let mut dep_values = Vec::new();
        for dep in deps {
            let dep_node = if script.uncacheable.lock().contains(&dep) {
                TNode {
                    id: dep,
                    cacheable: false,
                }
            } else {
                TNode::new(dep)
            };
            dep_values.extend(context.get(dep_node).await?);
        }

        let salt = script.salts.lock().get(&id).cloned().unwrap_or(0);
        let mut output = vec![id * 100 + salt];
        if !script.masked.lock().contains(&id) {
            output.extend(dep_values);
        }
        Ok(output)
    }
}

#[tokio::test]
async fn create_and_memoize() {
    let graph = empty_graph();
    let context = graph.context(TContext::default());
    let script = context.context().clone();
    script.set_edges(0, vec![1]);
    script.set_edges(1, vec![2]);

    assert_eq!(
        graph.create(TNode::new(0), &context).await,
        Ok(vec![0, 100, 200])
    );
    assert_eq!(script.runs(), vec![0, 1, 2]);

    // A second request is satisfied from the memo table without running anything.
    script.clear_runs();
    assert_eq!(
        graph.create(TNode::new(0), &context).await,
        Ok(vec![0, 100, 200])
    );
    assert_eq!(script.runs(), Vec::<usize>::new());
    assert_eq!(graph.len(), 3);
}

#[tokio::test]
async fn invalidate_and_clean() {
    let graph = empty_graph();
    let context = graph.context(TContext::default());
    let script = context.context().clone();
    script.set_edges(0, vec![1]);
    script.set_edges(1, vec![2]);

    graph.create(TNode::new(0), &context).await.unwrap();
    script.clear_runs();

    // Invalidate the leaf, and confirm that one node was cleared and two were dirtied.
    assert_eq!(
        graph.invalidate_from_roots(true, |node| node.id == 2),
        InvalidationResult {
            cleared: 1,
            dirtied: 2,
        }
    );

    // The leaf re-runs to an equal value, and the rest of the graph cleans rather than
    // re-running.
    assert_eq!(
        graph.create(TNode::new(0), &context).await,
        Ok(vec![0, 100, 200])
    );
    assert_eq!(script.runs(), vec![2]);
    assert_eq!(context.stats().cleaning_succeeded, 2);
}

#[tokio::test]
async fn invalidate_and_rerun() {
    let graph = empty_graph();
    let context = graph.context(TContext::default());
    let script = context.context().clone();
    script.set_edges(0, vec![1]);
    script.set_edges(1, vec![2]);

    assert_eq!(
        graph.create(TNode::new(0), &context).await,
        Ok(vec![0, 100, 200])
    );
    script.clear_runs();

    // Change the salt of the leaf, invalidate, and confirm that all three re-run (the new
    // value propagates).
    script.set_salt(2, 1);
    graph.invalidate_from_roots(true, |node| node.id == 2);
    assert_eq!(
        graph.create(TNode::new(0), &context).await,
        Ok(vec![0, 100, 201])
    );
    assert_eq!(script.runs(), vec![2, 1, 0]);
}

#[tokio::test]
async fn early_cutoff() {
    let graph = empty_graph();
    let context = graph.context(TContext::default());
    let script = context.context().clone();
    script.set_edges(0, vec![1]);
    script.set_edges(1, vec![2]);
    // Node 1 requests node 2, but masks its value.
    script.set_masked(1);

    assert_eq!(graph.create(TNode::new(0), &context).await, Ok(vec![0, 100]));
    script.clear_runs();

    // Change the output of the leaf. The middle node re-runs, but produces an equal value: the
    // root must not re-run.
    script.set_salt(2, 1);
    graph.invalidate_from_roots(true, |node| node.id == 2);
    assert_eq!(graph.create(TNode::new(0), &context).await, Ok(vec![0, 100]));
    assert_eq!(script.runs(), vec![2, 1]);
}

#[tokio::test]
async fn self_cycle_fails() {
    let graph = empty_graph();
    let context = graph.context(TContext::default());
    let script = context.context().clone();
    script.set_edges(0, vec![0]);

    match graph.create(TNode::new(0), &context).await {
        Err(TError::Cyclic(path)) => assert!(path.contains(&0), "Got path: {path:?}"),
        other => panic!("Expected a cycle error, got: {other:?}"),
    }
}

#[tokio::test]
async fn cycle_fails_with_path() {
    let graph = empty_graph();
    let context = graph.context(TContext::default());
    let script = context.context().clone();
    script.set_edges(0, vec![1]);
    script.set_edges(1, vec![2]);
    script.set_edges(2, vec![0]);

    match graph.create(TNode::new(0), &context).await {
        Err(TError::Cyclic(path)) => {
            assert!(
                path.contains(&0) && path.contains(&2),
                "Got path: {path:?}"
            );
        }
        other => panic!("Expected a cycle error, got: {other:?}"),
    }
}

#[tokio::test]
async fn uncacheable_nodes_rerun_per_run() {
    let graph = empty_graph();
    let context = graph.context(TContext::default());
    let script = context.context().clone();
    script.set_edges(0, vec![1]);
    script.set_uncacheable(1);

    let graph2 = graph.clone();
    let assert_runs_for_context = |expected: Vec<usize>| {
        let graph = graph2.clone();
        let context = context.clone();
        let script = script.clone();
        async move {
            assert_eq!(graph.create(TNode::new(0), &context).await, Ok(vec![0, 100]));
            assert_eq!(script.runs(), expected);
        }
    };

    assert_runs_for_context(vec![0, 1]).await;

    // Within the same Run, the uncacheable node's value is reused.
    assert_runs_for_context(vec![0, 1]).await;

    // In a new Run, the uncacheable node (and, because its value stays equal, nothing else)
    // re-runs.
    context.new_run_id();
    assert_runs_for_context(vec![0, 1, 1]).await;
}

#[tokio::test]
async fn canceled_nodes_rerun_on_demand() {
    let graph = empty_graph();
    let context = graph.context(TContext::default());
    let script = context.context().clone();
    script.set_delay(0, Duration::from_millis(2000));

    let sleep_per_poll = Duration::from_millis(100);

    // Request a slow node, and drop the request before it completes: the work is canceled.
    let graph2 = graph.clone();
    let context2 = context.clone();
    let request = tokio::spawn(async move { graph2.create(TNode::new(0), &context2).await });
    tokio::time::sleep(sleep_per_poll).await;
    request.abort();
    let _ = request.await;

    // Requesting again starts a fresh run.
    script.set_delay(0, Duration::from_millis(0));
    // Allow the cancellation to propagate.
    tokio::time::sleep(sleep_per_poll).await;
    assert_eq!(graph.create(TNode::new(0), &context).await, Ok(vec![0]));
    assert_eq!(script.runs(), vec![0, 0]);
}

#[tokio::test]
async fn failures_are_not_memoized() {
    let graph = empty_graph();
    let context = graph.context(TContext::default());
    let script = context.context().clone();
    // A node which depends on a cycle will fail...
    script.set_edges(0, vec![1]);
    script.set_edges(1, vec![1]);

    let failure = graph.create(TNode::new(0), &context).await;
    assert!(matches!(failure, Err(TError::Cyclic(_))));

    // ...but fixing the underlying issue heals the failed node on the next request, because
    // failures are not memoized.
    script.set_edges(1, vec![]);
    graph.invalidate_from_roots(true, |node| node.id == 1);
    assert_eq!(graph.create(TNode::new(0), &context).await, Ok(vec![0, 100]));
}
