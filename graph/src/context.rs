// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::ops::Deref;
use std::sync::atomic::{self, AtomicU32, AtomicUsize};
use std::sync::Arc;

use parking_lot::Mutex;
use workunit_store::RunId;

use crate::cell::Generation;
use crate::node::{CompoundNode, Node, NodeError, Stats};
use crate::{Graph, NodeId};

///
/// The sink for the dependencies one run observes: their ids, the generations at which they
/// were seen (in demand order), and whether any of them was run-scoped.
///
/// Taken (and thereby closed) when the run completes: late requests from leaked background
/// work fail rather than corrupting a completed run's record.
///
#[derive(Default)]
pub(crate) struct DepTracker {
    pub(crate) generations: Vec<(NodeId, Generation)>,
    pub(crate) saw_run_scoped: bool,
}

pub(crate) struct Counters {
    ran: AtomicUsize,
    cleaning_succeeded: AtomicUsize,
    cleaning_failed: AtomicUsize,
}

impl Counters {
    pub(crate) fn ran(&self) {
        self.ran.fetch_add(1, atomic::Ordering::SeqCst);
    }

    pub(crate) fn cleaning_succeeded(&self) {
        self.cleaning_succeeded.fetch_add(1, atomic::Ordering::SeqCst);
    }

    pub(crate) fn cleaning_failed(&self) {
        self.cleaning_failed.fetch_add(1, atomic::Ordering::SeqCst);
    }
}

struct Shared<N: Node> {
    app_context: N::Context,
    run_id: AtomicU32,
    counters: Counters,
    graph: Graph<N>,
}

///
/// The handle passed to running Nodes: requests further Nodes (recording the edges), and
/// carries the application context and the RunId of the requesting run.
///
pub struct Context<N: Node> {
    node_id: Option<NodeId>,
    deps: Arc<Mutex<Option<DepTracker>>>,
    shared: Arc<Shared<N>>,
}

impl<N: Node> Clone for Context<N> {
    fn clone(&self) -> Self {
        Context {
            node_id: self.node_id,
            deps: self.deps.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<N: Node> Context<N> {
    pub(crate) fn new(graph: Graph<N>, app_context: N::Context, run_id: RunId) -> Self {
        Context {
            node_id: None,
            deps: Arc::default(),
            shared: Arc::new(Shared {
                app_context,
                run_id: AtomicU32::new(run_id.0),
                counters: Counters {
                    ran: AtomicUsize::new(0),
                    cleaning_succeeded: AtomicUsize::new(0),
                    cleaning_failed: AtomicUsize::new(0),
                },
                graph,
            }),
        }
    }

    ///
    /// Request the value of the given Node, on behalf of the Node this Context belongs to (if
    /// any).
    ///
    pub async fn get<CN: CompoundNode<N>>(&self, node: CN) -> Result<CN::Item, N::Error> {
        let (result, _generation, _run_scoped) = self
            .shared
            .graph
            .demand(self.node_id, self, node.into())
            .await;

        result?.try_into().map_err(|_| {
            N::Error::generic(format!(
                "The CompoundNode implementation for {} was ambiguous.",
                std::any::type_name::<CN>()
            ))
        })
    }

    pub fn run_id(&self) -> RunId {
        RunId(self.shared.run_id.load(atomic::Ordering::SeqCst))
    }

    pub fn new_run_id(&self) {
        self.shared.run_id.store(
            self.shared.graph.generate_run_id().0,
            atomic::Ordering::SeqCst,
        );
    }

    pub fn context(&self) -> &N::Context {
        &self.shared.app_context
    }

    pub fn graph(&self) -> &Graph<N> {
        &self.shared.graph
    }

    pub fn stats(&self) -> Stats {
        let counters = &self.shared.counters;
        Stats {
            ran: counters.ran.load(atomic::Ordering::SeqCst),
            cleaning_succeeded: counters.cleaning_succeeded.load(atomic::Ordering::SeqCst),
            cleaning_failed: counters.cleaning_failed.load(atomic::Ordering::SeqCst),
        }
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.shared.counters
    }

    ///
    /// Record that the Node this Context belongs to observed the given dependency.
    ///
    pub(crate) fn record_dep(
        &self,
        dep: NodeId,
        generation: Generation,
        run_scoped: bool,
    ) -> Result<(), N::Error> {
        let mut tracker = self.deps.lock();
        match tracker.as_mut() {
            Some(tracker) => {
                tracker.generations.push((dep, generation));
                tracker.saw_run_scoped |= run_scoped;
                Ok(())
            }
            None => Err(N::Error::generic(format!(
                "Could not request additional dependencies for {:?}: the Node has completed.",
                self.node_id
            ))),
        }
    }

    ///
    /// Discard the dependencies recorded so far (because a failed revalidation is giving way to
    /// a fresh run).
    ///
    pub(crate) fn reset_deps(&self) {
        if let Some(tracker) = self.deps.lock().as_mut() {
            *tracker = DepTracker::default();
        }
    }

    ///
    /// Close this Context and return the dependency record of its run.
    ///
    pub(crate) fn take_deps(&self) -> DepTracker {
        self.deps
            .lock()
            .take()
            .unwrap_or_else(|| panic!("The run for {:?} completed twice.", self.node_id))
    }

    ///
    /// Creates a Context for a run of the given Node, sharing this Context's run.
    ///
    pub(crate) fn clone_for(&self, node_id: NodeId) -> Self {
        Context {
            node_id: Some(node_id),
            deps: Arc::new(Mutex::new(Some(DepTracker::default()))),
            shared: self.shared.clone(),
        }
    }
}

impl<N: Node> Deref for Context<N> {
    type Target = N::Context;

    fn deref(&self) -> &Self::Target {
        &self.shared.app_context
    }
}
