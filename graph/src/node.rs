// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::{Debug, Display};
use std::hash::Hash;

use async_trait::async_trait;

use crate::context::Context;

///
/// A memoizable unit of work: the Graph holds one slot per distinct Node value, so a Node must
/// be a cheap, hashable identity for its computation.
///
#[async_trait]
pub trait Node: Clone + Debug + Display + Eq + Hash + Send + Sync + 'static {
    /// An application-defined value made available to every run via `Context::context`.
    type Context: Send + Sync + 'static;

    type Item: Clone + Debug + Eq + Send + Sync + 'static;
    type Error: NodeError;

    async fn run(self, context: Context<Self>) -> Result<Self::Item, Self::Error>;

    ///
    /// False for Nodes which must not be re-run once started (because their side effects have
    /// escaped the sandbox): invalidation will not pass through them while they run.
    ///
    fn restartable(&self) -> bool;

    ///
    /// False for Nodes whose output is only meaningful within the run which produced it.
    ///
    fn cacheable(&self) -> bool;

    ///
    /// Some Nodes compute cacheability from their output value (e.g. a process result which may
    /// only be reused when it succeeded).
    ///
    fn cacheable_item(&self, _item: &Self::Item) -> bool {
        true
    }

    ///
    /// Render the error for a demand which would have completed a dependency ring.
    ///
    fn cyclic_error(path: &[&Self]) -> Self::Error;
}

pub trait NodeError: Clone + Debug + Eq + Send + Sync {
    ///
    /// An instance representing that a Node's run was obsoleted by invalidation while it was
    /// being observed.
    ///
    fn invalidated() -> Self;

    ///
    /// An instance carrying an uncategorized message.
    ///
    fn generic(message: String) -> Self;
}

///
/// Implemented by node subtypes: a value which converts into the Graph's node type, and whose
/// typed output can be recovered from the Graph's item type. `Context::get` uses this pair of
/// conversions to offer typed access to heterogeneous Nodes.
///
pub trait CompoundNode<N: Node>: Into<N> {
    type Item: TryFrom<N::Item>;
}

///
/// Counts of what the Graph did during a run, exposed for tests and introspection.
///
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    pub ran: usize,
    pub cleaning_succeeded: usize,
    pub cleaning_failed: usize,
}
