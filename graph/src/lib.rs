// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A demand-driven, parallel memo table.
//!
//! Each distinct Node gets one slot in an arena. A demand for a Node either observes a valid
//! memoized value, subscribes to an in-flight run, or starts a run. Runs record the
//! `(dependency, generation)` pairs they observe; a Node whose inputs were invalidated is
//! revalidated by re-demanding those recorded dependencies and comparing generations, and only
//! re-runs if one of them actually changed. Because generations only move when a value changes,
//! an unchanged re-run does not disturb dependents (early cutoff).
//!
//! Edges are registered as demands are issued, and a demand which would complete a dependency
//! ring fails with an error naming the ring rather than deadlocking.

mod cell;
mod context;
mod node;

pub use crate::context::Context;
pub use crate::node::{CompoundNode, Node, NodeError, Stats};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{self, AtomicU32};
use std::sync::Arc;
use std::time::Duration;

use async_latch::AsyncLatch;
use fnv::FnvHashSet;
use futures::future;
use log::info;
use parking_lot::Mutex;
use task_executor::Executor;
use tokio::sync::watch;
use tokio::time::sleep;
use workunit_store::RunId;

use crate::cell::{
    await_broadcast, Broadcast, CellState, Epoch, Finished, Generation, Interest, InterestGuard,
    Liveness, NodeCell, Observed, Subscription,
};

/// The index of a Node's slot in the arena.
pub(crate) type NodeId = u32;

#[derive(Debug, Eq, PartialEq)]
pub struct InvalidationResult {
    pub cleared: usize,
    pub dirtied: usize,
}

///
/// The structural half of the Graph: the arena, the interning table, and the edge sets. All
/// structural mutation happens under one lock; value computation happens in spawned tasks which
/// only ever take individual cell locks.
///
struct GraphInner<N: Node> {
    ids: HashMap<N, NodeId>,
    cells: Vec<Arc<NodeCell<N>>>,
    // The dependencies registered by each Node's current run: the edges walked for cycle
    // detection. Reset when a Node starts a fresh (non-revalidating) run.
    deps: Vec<FnvHashSet<NodeId>>,
    // Every dependent each Node has ever had: the edges walked (in reverse) by invalidation.
    dependents: Vec<FnvHashSet<NodeId>>,
}

impl<N: Node> GraphInner<N> {
    fn ensure_node(&mut self, node: N) -> NodeId {
        if let Some(&id) = self.ids.get(&node) {
            return id;
        }
        let id = self.cells.len() as NodeId;
        self.cells.push(Arc::new(NodeCell::new(node.clone())));
        self.deps.push(FnvHashSet::default());
        self.dependents.push(FnvHashSet::default());
        self.ids.insert(node, id);
        id
    }

    fn cell(&self, id: NodeId) -> &Arc<NodeCell<N>> {
        &self.cells[id as usize]
    }

    ///
    /// Search for a dependency path from `from` back to `to` along registered dependency
    /// edges. Returns the ids along the path (ending with `to`) if one exists.
    ///
    fn dependency_path(&self, from: NodeId, to: NodeId) -> Option<Vec<NodeId>> {
        if from == to {
            return Some(vec![to]);
        }

        let mut came_from: HashMap<NodeId, NodeId> = HashMap::new();
        let mut frontier = VecDeque::from([from]);
        while let Some(id) = frontier.pop_front() {
            for &dep in &self.deps[id as usize] {
                if came_from.contains_key(&dep) || dep == from {
                    continue;
                }
                came_from.insert(dep, id);
                if dep == to {
                    // Reconstruct the path by walking backwards.
                    let mut path = vec![to];
                    let mut current = to;
                    while current != from {
                        current = came_from[&current];
                        path.push(current);
                    }
                    path.reverse();
                    return Some(path);
                }
                frontier.push_back(dep);
            }
        }
        None
    }

    ///
    /// Check whether registering the edge src -> dst would complete a dependency ring, and if
    /// so, return the Nodes along it.
    ///
    /// A ring through a node which is merely revalidating is not necessarily real: its
    /// registered edges are the previous run's, and may not survive a re-run. Such members are
    /// reset to run from scratch (dropping their stale edges) and the check repeats.
    ///
    fn check_for_cycle(&mut self, src: NodeId, dst: NodeId) -> Option<Vec<N>> {
        loop {
            let path = self.dependency_path(dst, src)?;

            if let Some(&cleaning_id) = path.iter().find(|&&id| self.cell(id).is_cleaning()) {
                self.cell(cleaning_id).clear();
                self.deps[cleaning_id as usize].clear();
                continue;
            }

            // A genuine ring: render it from the requesting node around to itself.
            let mut ring = vec![self.cell(src).node.clone()];
            ring.extend(path.into_iter().map(|id| self.cell(id).node.clone()));
            return Some(ring);
        }
    }

    ///
    /// Walk dependents (transitively) of the given roots, without re-visiting, stopping at
    /// non-restartable running nodes.
    ///
    fn transitive_dependents(&self, roots: &[NodeId]) -> Vec<NodeId> {
        let mut visited: FnvHashSet<NodeId> = roots.iter().cloned().collect();
        let mut frontier: VecDeque<NodeId> = roots.iter().cloned().collect();
        let mut result = Vec::new();
        while let Some(id) = frontier.pop_front() {
            for &dependent in &self.dependents[id as usize] {
                if !visited.insert(dependent) {
                    continue;
                }
                let cell = self.cell(dependent);
                if !cell.node.restartable() && cell.is_running() {
                    continue;
                }
                result.push(dependent);
                frontier.push_back(dependent);
            }
        }
        result
    }
}

///
/// How a demand should observe a Node: computed under the locks, acted on outside of them.
///
enum Dispatch<N: Node> {
    Ready(Observed<N>),
    Wait(Subscription<N>, InterestGuard),
}

///
/// A DAG (enforced as demands arrive) of memoized Nodes.
///
pub struct Graph<N: Node> {
    inner: Arc<Mutex<GraphInner<N>>>,
    run_id_source: Arc<AtomicU32>,
    invalidation_delay: Duration,
    pub(crate) executor: Executor,
}

impl<N: Node> Clone for Graph<N> {
    fn clone(&self) -> Self {
        Graph {
            inner: self.inner.clone(),
            run_id_source: self.run_id_source.clone(),
            invalidation_delay: self.invalidation_delay,
            executor: self.executor.clone(),
        }
    }
}

impl<N: Node> Graph<N> {
    pub fn new(executor: Executor) -> Graph<N> {
        Self::new_with_invalidation_delay(executor, Duration::from_millis(500))
    }

    pub fn new_with_invalidation_delay(
        executor: Executor,
        invalidation_delay: Duration,
    ) -> Graph<N> {
        Graph {
            inner: Arc::new(Mutex::new(GraphInner {
                ids: HashMap::new(),
                cells: Vec::new(),
                deps: Vec::new(),
                dependents: Vec::new(),
            })),
            run_id_source: Arc::new(AtomicU32::new(0)),
            invalidation_delay,
            executor,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ids.len()
    }

    pub fn generate_run_id(&self) -> RunId {
        RunId(self.run_id_source.fetch_add(1, atomic::Ordering::SeqCst))
    }

    ///
    /// Creates a new Context (i.e., a new Run) for this Graph with the given application
    /// context value.
    ///
    pub fn context(&self, context: N::Context) -> Context<N> {
        let run_id = self.generate_run_id();
        Context::new(self.clone(), context, run_id)
    }

    ///
    /// Request the given Node from outside of the Graph.
    ///
    pub async fn create(&self, node: N, context: &Context<N>) -> Result<N::Item, N::Error> {
        let (result, _generation, _run_scoped) = self.demand(None, context, node).await;
        result
    }

    ///
    /// Request the value of `dst_node`, optionally on behalf of the running node `src`.
    ///
    /// External demands (no `src`) retry when the observed run is invalidated out from under
    /// them; demands from running nodes propagate the interruption, so that the requesting run
    /// restarts as a unit.
    ///
    pub(crate) async fn demand(
        &self,
        src: Option<NodeId>,
        context: &Context<N>,
        dst_node: N,
    ) -> (Result<N::Item, N::Error>, Generation, bool) {
        let mut to_intern = Some(dst_node);
        let mut dst_id = None;
        loop {
            let dispatch = {
                let mut inner = self.inner.lock();
                let id =
                    *dst_id.get_or_insert_with(|| inner.ensure_node(to_intern.take().unwrap()));

                if let Some(src) = src {
                    if let Some(ring) = inner.check_for_cycle(src, id) {
                        let ring_refs: Vec<&N> = ring.iter().collect();
                        return (
                            Err(N::cyclic_error(&ring_refs)),
                            Generation::default(),
                            true,
                        );
                    }
                    inner.deps[src as usize].insert(id);
                    inner.dependents[id as usize].insert(src);
                }

                self.dispatch(&mut inner, id, context)
            };

            let observed = match dispatch {
                Dispatch::Ready(observed) => Some(observed),
                Dispatch::Wait(subscription, guard) => {
                    let observed = await_broadcast(subscription).await;
                    std::mem::drop(guard);
                    observed
                }
            };

            let Some(observed) = observed else {
                // The run we were waiting on was obsoleted before producing a value.
                if src.is_none() {
                    info!(
                        "Inputs changed while running: retrying in {:?}...",
                        self.invalidation_delay
                    );
                    sleep(self.invalidation_delay).await;
                    continue;
                }
                return (Err(N::Error::invalidated()), Generation::default(), true);
            };

            if src.is_some() {
                if let Err(err) =
                    context.record_dep(dst_id.unwrap(), observed.generation, observed.run_scoped)
                {
                    return (Err(err), observed.generation, observed.run_scoped);
                }
            }
            return (observed.result, observed.generation, observed.run_scoped);
        }
    }

    ///
    /// Under the graph lock: observe a valid value, subscribe to an in-flight run, or start
    /// one.
    ///
    fn dispatch(&self, inner: &mut GraphInner<N>, id: NodeId, context: &Context<N>) -> Dispatch<N> {
        let cell = inner.cell(id).clone();
        let mut state = cell.state.lock();

        match &*state {
            CellState::Done {
                finished,
                needs_check: false,
                ..
            } if finished.liveness.valid_in(context.run_id()) => {
                return Dispatch::Ready(Observed {
                    result: Ok(finished.value.clone()),
                    generation: finished.generation,
                    run_scoped: finished.liveness.is_run_scoped(),
                });
            }
            CellState::Running {
                subscription,
                interest,
                ..
            } => {
                return Dispatch::Wait(subscription.clone(), interest.acquire());
            }
            _ => (),
        }

        // The value is absent, stale for this run, or requires revalidation: start a run.
        let (epoch, generation, previous, check_deps) = match &*state {
            CellState::Idle {
                epoch,
                generation,
                previous,
            } => (*epoch, *generation, previous.clone(), None),
            CellState::Done {
                epoch, finished, ..
            } => {
                // Revalidation is only meaningful for a durable value: a run-scoped value from
                // another run must be recomputed outright.
                let check = match finished.liveness {
                    Liveness::ScopedToRun(_) => None,
                    Liveness::Durable | Liveness::DepsScopedToRun(_) => {
                        Some(finished.dep_generations.clone())
                    }
                };
                (*epoch, finished.generation, Some(finished.clone()), check)
            }
            CellState::Running { .. } => unreachable!("Handled above."),
        };

        let epoch = epoch + 1;
        let cleaning = check_deps.is_some();
        if !cleaning {
            // A fresh run re-registers its dependencies from scratch.
            inner.deps[id as usize].clear();
        }

        let (broadcast, subscription) = watch::channel(None);
        let interest = Interest::new();
        let dirtied = AsyncLatch::new();
        let guard = interest.acquire();

        *state = CellState::Running {
            epoch,
            subscription: subscription.clone(),
            interest: interest.clone(),
            dirtied: dirtied.clone(),
            cleaning,
            generation,
            previous: previous.clone(),
        };
        std::mem::drop(state);

        self.spawn_run(RunArgs {
            cell,
            id,
            epoch,
            generation,
            previous,
            check_deps,
            broadcast,
            interest,
            dirtied,
            context: context.clone_for(id),
        });

        Dispatch::Wait(subscription, guard)
    }

    ///
    /// Re-demand the recorded dependencies of a revalidating Node, and compare generations.
    ///
    /// Returns Ok(any_run_scoped) when every dependency still has its recorded generation, and
    /// Err(()) as soon as one differs (or fails).
    ///
    async fn verify_dependencies(
        &self,
        for_id: NodeId,
        recorded: &[(NodeId, Generation)],
        context: &Context<N>,
    ) -> Result<bool, ()> {
        let checks = recorded.iter().map(|&(dep_id, recorded_generation)| {
            let graph = self.clone();
            let context = context.clone();
            async move {
                let dep_node = {
                    let inner = graph.inner.lock();
                    inner.cell(dep_id).node.clone()
                };
                let (result, generation, run_scoped) =
                    graph.demand(Some(for_id), &context, dep_node).await;
                match result {
                    Ok(_) if generation == recorded_generation => Ok(run_scoped),
                    _ => Err(()),
                }
            }
        });

        // try_join_all gives fail-fast semantics: the first changed dependency cancels the
        // remaining checks.
        let run_scoped_flags = future::try_join_all(checks).await?;
        Ok(run_scoped_flags.into_iter().any(|scoped| scoped))
    }

    fn spawn_run(&self, args: RunArgs<N>) {
        let graph = self.clone();
        self.executor.native_spawn(async move {
            graph.run_node(args).await;
        });
    }

    ///
    /// The body of one run of a Node: revalidate if possible, otherwise execute, and publish
    /// the outcome (unless obsoleted in the meantime).
    ///
    async fn run_node(&self, args: RunArgs<N>) {
        let RunArgs {
            cell,
            id,
            epoch,
            generation,
            previous,
            check_deps,
            broadcast,
            interest,
            dirtied,
            context,
        } = args;

        let work = {
            let graph = self.clone();
            let cell = cell.clone();
            let context = context.clone();
            async move {
                if let Some(recorded) = &check_deps {
                    match graph.verify_dependencies(id, recorded, &context).await {
                        Ok(run_scoped_deps) => {
                            context.counters().cleaning_succeeded();
                            return Work::StillValid { run_scoped_deps };
                        }
                        Err(()) => {
                            // The recorded inputs changed: discard them and run in earnest.
                            context.counters().cleaning_failed();
                            graph.reset_deps_for(id);
                            context.reset_deps();
                        }
                    }
                }

                let result = cell.node.clone().run(context.clone()).await;
                context.counters().ran();
                Work::<N>::Ran(result)
            }
        };
        tokio::pin!(work);

        let outcome = tokio::select! {
            _ = interest.aborted.triggered() => None,
            _ = dirtied.triggered() => None,
            outcome = &mut work => Some(outcome),
        };

        let mut state = cell.state.lock();
        match &*state {
            CellState::Running {
                epoch: current_epoch,
                ..
            } if *current_epoch == epoch => (),
            _ => {
                // The run was obsoleted (cleared, dirtied, or restarted): discard the work.
                return;
            }
        }

        let Some(outcome) = outcome else {
            // Canceled: all waiters went away, or the inputs changed. Return to Idle so that
            // the next demand restarts.
            *state = CellState::Idle {
                epoch: epoch + 1,
                generation,
                previous,
            };
            return;
        };

        let tracker = context.take_deps();
        let run_id = context.run_id();
        match outcome {
            // Revalidation succeeded: the previous value stands, generation untouched.
            Work::StillValid { run_scoped_deps } => {
                let prior = previous.expect("Revalidated a Node which had no previous value.");
                let liveness = if run_scoped_deps {
                    Liveness::DepsScopedToRun(run_id)
                } else {
                    Liveness::Durable
                };
                let finished = Finished { liveness, ..prior };
                publish_and_complete(&mut state, epoch, finished, broadcast);
            }
            // The Node ran to completion.
            Work::Ran(Ok(value)) => {
                let unchanged = previous
                    .as_ref()
                    .map(|previous| previous.value == value)
                    .unwrap_or(false);
                let generation = if unchanged || previous.is_none() {
                    generation
                } else {
                    generation.next()
                };
                let liveness = if !cell.node.cacheable() || !cell.node.cacheable_item(&value) {
                    Liveness::ScopedToRun(run_id)
                } else if tracker.saw_run_scoped {
                    Liveness::DepsScopedToRun(run_id)
                } else {
                    Liveness::Durable
                };
                let finished = Finished {
                    value,
                    generation,
                    dep_generations: tracker.generations,
                    liveness,
                };
                publish_and_complete(&mut state, epoch, finished, broadcast);
            }
            // The Node failed: deliver the error to current waiters, but memoize nothing.
            Work::Ran(Err(err)) => {
                let generation = generation.next();
                let _ = broadcast.send(Some(Observed {
                    result: Err(err),
                    generation,
                    run_scoped: true,
                }));
                *state = CellState::Idle {
                    epoch: epoch + 1,
                    generation,
                    previous,
                };
            }
        }
    }

    fn reset_deps_for(&self, id: NodeId) {
        self.inner.lock().deps[id as usize].clear();
    }

    ///
    /// Clears the values of all Nodes matching the predicate ("invalidation roots": Nodes whose
    /// external inputs may have changed), and marks their transitive dependents as requiring
    /// revalidation.
    ///
    pub fn invalidate_from_roots<P: Fn(&N) -> bool>(
        &self,
        log_dirtied: bool,
        predicate: P,
    ) -> InvalidationResult {
        let mut inner = self.inner.lock();

        let root_ids: Vec<NodeId> = inner
            .ids
            .iter()
            .filter(|(node, &id)| predicate(node) && inner.cell(id).is_started())
            .map(|(_, &id)| id)
            .collect();

        let mut dirtied = 0;
        for dependent_id in inner.transitive_dependents(&root_ids) {
            let cell = inner.cell(dependent_id);
            if cell.mark_needs_check() {
                if log_dirtied {
                    info!("Dirtying {}", cell.node);
                }
                dirtied += 1;
            }
        }

        for &root_id in &root_ids {
            inner.cell(root_id).clear();
        }
        for &root_id in &root_ids {
            inner.deps[root_id as usize].clear();
        }

        InvalidationResult {
            cleared: root_ids.len(),
            dirtied,
        }
    }

    ///
    /// Visit every Node which currently holds a valid value for the given Context.
    ///
    pub fn visit_live(&self, context: &Context<N>, mut f: impl FnMut(&N, N::Item)) {
        let cells: Vec<_> = self.inner.lock().cells.clone();
        for cell in cells {
            if let Some(item) = cell.peek(context) {
                f(&cell.node, item);
            }
        }
    }

    ///
    /// Visit the valid values of Nodes reachable from the given roots.
    ///
    pub fn visit_live_reachable(
        &self,
        roots: &[N],
        context: &Context<N>,
        mut f: impl FnMut(&N, N::Item),
    ) {
        let reachable: Vec<Arc<NodeCell<N>>> = {
            let inner = self.inner.lock();
            let root_ids: Vec<NodeId> = roots
                .iter()
                .filter_map(|node| inner.ids.get(node).cloned())
                .collect();

            let mut visited: FnvHashSet<NodeId> = root_ids.iter().cloned().collect();
            let mut frontier: VecDeque<NodeId> = root_ids.into();
            let mut result = Vec::new();
            while let Some(id) = frontier.pop_front() {
                result.push(inner.cell(id).clone());
                for &dep in &inner.deps[id as usize] {
                    if visited.insert(dep) {
                        frontier.push_back(dep);
                    }
                }
            }
            result
        };

        for cell in reachable {
            if let Some(item) = cell.peek(context) {
                f(&cell.node, item);
            }
        }
    }

    ///
    /// Formats the given Node (if it exists in the Graph) for debugging purposes.
    ///
    pub fn format_node(&self, node: &N, context: &Context<N>) -> Option<String> {
        let cell = {
            let inner = self.inner.lock();
            inner.ids.get(node).map(|&id| inner.cell(id).clone())
        }?;
        let value = match cell.peek(context) {
            Some(item) => format!("{item:?}"),
            None => "<pending>".to_owned(),
        };
        Some(format!("{} == {}", cell.node, value))
    }

    ///
    /// Drop the values of all Nodes in the Graph.
    ///
    pub fn clear(&self) {
        let inner = self.inner.lock();
        for cell in &inner.cells {
            cell.clear();
        }
    }
}

///
/// What one run produced.
///
enum Work<N: Node> {
    StillValid { run_scoped_deps: bool },
    Ran(Result<N::Item, N::Error>),
}

///
/// Everything a spawned run needs, bundled to keep the spawn site readable.
///
struct RunArgs<N: Node> {
    cell: Arc<NodeCell<N>>,
    id: NodeId,
    epoch: Epoch,
    generation: Generation,
    previous: Option<Finished<N>>,
    check_deps: Option<Vec<(NodeId, Generation)>>,
    broadcast: Broadcast<N>,
    interest: Arc<Interest>,
    dirtied: AsyncLatch,
    context: Context<N>,
}

///
/// Publish a Finished value to waiters, and store it.
///
fn publish_and_complete<N: Node>(
    state: &mut CellState<N>,
    epoch: Epoch,
    finished: Finished<N>,
    broadcast: Broadcast<N>,
) {
    let _ = broadcast.send(Some(Observed {
        result: Ok(finished.value.clone()),
        generation: finished.generation,
        run_scoped: finished.liveness.is_run_scoped(),
    }));
    *state = CellState::Done {
        epoch,
        finished,
        needs_check: false,
    };
}

#[cfg(test)]
mod tests;
