// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{self, AtomicUsize};
use std::sync::Arc;

use async_latch::AsyncLatch;
use parking_lot::Mutex;
use tokio::sync::watch;
use workunit_store::RunId;

use crate::context::Context;
use crate::node::Node;
use crate::NodeId;

///
/// A monotonic counter identifying one run of a Node. Any state transition which obsoletes the
/// current run bumps the epoch: a task which finds a different epoch than the one it was
/// spawned with discards its work.
///
pub(crate) type Epoch = u64;

///
/// A counter which is bumped when (and only when) a Node's value changes. Dependents record the
/// generation at which they observed each dependency, which is what makes revalidation and
/// early cutoff cheap: a dependency whose generation still matches did not change, regardless
/// of how many times it re-ran.
///
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct Generation(u64);

impl Generation {
    pub(crate) fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

///
/// When a completed value may be reused.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Liveness {
    /// Reusable by any run, until invalidated.
    Durable,
    /// Computed from run-scoped inputs: in a later run, the recorded dependencies must be
    /// re-verified before reuse.
    DepsScopedToRun(RunId),
    /// Itself run-scoped (an uncacheable Node): a later run must re-run it from scratch.
    ScopedToRun(RunId),
}

impl Liveness {
    pub(crate) fn valid_in(&self, run_id: RunId) -> bool {
        match self {
            Liveness::Durable => true,
            Liveness::DepsScopedToRun(run) | Liveness::ScopedToRun(run) => *run == run_id,
        }
    }

    pub(crate) fn is_run_scoped(&self) -> bool {
        !matches!(self, Liveness::Durable)
    }
}

///
/// A successfully completed run of a Node. Failed runs are never retained: they are broadcast
/// to the demands which were waiting, and the Node returns to Idle.
///
#[derive(Clone)]
pub(crate) struct Finished<N: Node> {
    pub value: N::Item,
    pub generation: Generation,
    /// The dependencies observed by the producing run, in demand order, with the generations at
    /// which they were observed.
    pub dep_generations: Vec<(NodeId, Generation)>,
    pub liveness: Liveness,
}

///
/// The value (or error) broadcast to everything waiting on one run of a Node.
///
#[derive(Clone)]
pub(crate) struct Observed<N: Node> {
    pub result: Result<N::Item, N::Error>,
    pub generation: Generation,
    pub run_scoped: bool,
}

pub(crate) type Broadcast<N> = watch::Sender<Option<Observed<N>>>;
pub(crate) type Subscription<N> = watch::Receiver<Option<Observed<N>>>;

pub(crate) enum CellState<N: Node> {
    /// No reusable value. `previous` (when present) is not valid for consumption: it is
    /// retained solely so that the next run can detect an unchanged output and keep its
    /// generation.
    Idle {
        epoch: Epoch,
        generation: Generation,
        previous: Option<Finished<N>>,
    },
    /// A task is computing (or revalidating) the value. The `generation`/`previous` pair
    /// mirrors Idle, so that obsoleting the run does not lose the equality baseline.
    Running {
        epoch: Epoch,
        subscription: Subscription<N>,
        interest: Arc<Interest>,
        dirtied: AsyncLatch,
        cleaning: bool,
        generation: Generation,
        previous: Option<Finished<N>>,
    },
    /// A valid value, possibly awaiting revalidation (`needs_check`) after the invalidation of
    /// a transitive dependency.
    Done {
        epoch: Epoch,
        finished: Finished<N>,
        needs_check: bool,
    },
}

///
/// One Node's slot in the Graph arena.
///
pub(crate) struct NodeCell<N: Node> {
    pub node: N,
    pub state: Mutex<CellState<N>>,
}

impl<N: Node> NodeCell<N> {
    pub(crate) fn new(node: N) -> NodeCell<N> {
        NodeCell {
            node,
            state: Mutex::new(CellState::Idle {
                epoch: 0,
                generation: Generation::default(),
                previous: None,
            }),
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        match *self.state.lock() {
            CellState::Idle { .. } => false,
            CellState::Running { .. } | CellState::Done { .. } => true,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(*self.state.lock(), CellState::Running { .. })
    }

    pub(crate) fn is_cleaning(&self) -> bool {
        matches!(
            *self.state.lock(),
            CellState::Running { cleaning: true, .. }
        )
    }

    ///
    /// If this Node holds a value which is valid for the given Context without revalidation,
    /// return a clone of it.
    ///
    pub(crate) fn peek(&self, context: &Context<N>) -> Option<N::Item> {
        match &*self.state.lock() {
            CellState::Done {
                finished,
                needs_check: false,
                ..
            } if finished.liveness.valid_in(context.run_id()) => Some(finished.value.clone()),
            _ => None,
        }
    }

    ///
    /// Drop this Node's value (because its external inputs changed). The previous value is
    /// retained for generation comparison, but can never be served or revalidated.
    ///
    /// If a run is in flight, it is obsoleted by the epoch bump; the latch wakes it so that it
    /// stops working.
    ///
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        let (epoch, generation, previous) = match &*state {
            CellState::Idle {
                epoch,
                generation,
                previous,
            } => (*epoch, *generation, previous.clone()),
            CellState::Running {
                epoch,
                interest,
                generation,
                previous,
                ..
            } => {
                interest.aborted.trigger();
                (*epoch, *generation, previous.clone())
            }
            CellState::Done {
                epoch, finished, ..
            } => (*epoch, finished.generation, Some(finished.clone())),
        };
        *state = CellState::Idle {
            epoch: epoch + 1,
            generation,
            previous,
        };
    }

    ///
    /// Mark this Node's value as requiring revalidation (because a transitive dependency was
    /// invalidated). Returns true if the Node was affected.
    ///
    pub(crate) fn mark_needs_check(&self) -> bool {
        let mut state = self.state.lock();
        match &mut *state {
            CellState::Done { needs_check, .. } => {
                *needs_check = true;
                return true;
            }
            CellState::Idle { .. } => return false,
            CellState::Running { .. } => (),
        }

        // Cancel the in-flight run: its output would be based on stale inputs. The next
        // demand restarts it.
        let placeholder = CellState::Idle {
            epoch: 0,
            generation: Generation::default(),
            previous: None,
        };
        if let CellState::Running {
            epoch,
            dirtied,
            interest,
            generation,
            previous,
            ..
        } = std::mem::replace(&mut *state, placeholder)
        {
            dirtied.trigger();
            interest.aborted.trigger();
            *state = CellState::Idle {
                epoch: epoch + 1,
                generation,
                previous,
            };
        }
        true
    }
}

///
/// Tracks how many demands are waiting on a run: when the count returns to zero, the run is
/// aborted (its work can no longer be observed by anyone).
///
pub(crate) struct Interest {
    waiters: AtomicUsize,
    pub(crate) aborted: AsyncLatch,
}

impl Interest {
    pub(crate) fn new() -> Arc<Interest> {
        Arc::new(Interest {
            waiters: AtomicUsize::new(0),
            aborted: AsyncLatch::new(),
        })
    }

    pub(crate) fn acquire(self: &Arc<Interest>) -> InterestGuard {
        self.waiters.fetch_add(1, atomic::Ordering::SeqCst);
        InterestGuard {
            interest: self.clone(),
        }
    }
}

pub(crate) struct InterestGuard {
    interest: Arc<Interest>,
}

impl Drop for InterestGuard {
    fn drop(&mut self) {
        if self.interest.waiters.fetch_sub(1, atomic::Ordering::SeqCst) == 1 {
            self.interest.aborted.trigger();
        }
    }
}

///
/// Await a broadcast value: resolves to None if the producing run was canceled without
/// publishing one.
///
pub(crate) async fn await_broadcast<N: Node>(
    mut subscription: Subscription<N>,
) -> Option<Observed<N>> {
    loop {
        {
            let current = subscription.borrow_and_update();
            if let Some(observed) = &*current {
                return Some(observed.clone());
            }
        }
        if subscription.changed().await.is_err() {
            // The sender went away: if it published on the way out we would have seen the
            // value above, so check one final time.
            return subscription.borrow().clone();
        }
    }
}
