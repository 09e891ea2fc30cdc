// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use async_latch::AsyncLatch;
use parking_lot::Mutex;
use workunit_store::WorkunitStore;

use crate::context::{Context, Core, SessionCore};

///
/// A Session is a rooted scope for demands and cancellation.
///
/// Sessions are cheap to clone: all clones share cancellation and the workunit timeline. Each
/// Session gets a distinct RunId in the node graph, which scopes the validity of uncacheable
/// (per-session) node results.
///
#[derive(Clone)]
pub struct Session {
    core: Arc<Core>,
    state: Arc<SessionState>,
}

struct SessionState {
    build_id: String,
    workunit_store: WorkunitStore,
    cancelled: AsyncLatch,
    // The graph Context for this Session, created lazily (because it contains the Session).
    context: Mutex<Option<Context>>,
}

impl Session {
    pub fn new(core: Arc<Core>, build_id: String, max_workunit_level: log::Level) -> Session {
        let workunit_store = WorkunitStore::new(false, max_workunit_level);
        workunit_store.init_thread_state(None);
        Session {
            core,
            state: Arc::new(SessionState {
                build_id,
                workunit_store,
                cancelled: AsyncLatch::new(),
                context: Mutex::default(),
            }),
        }
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn build_id(&self) -> &str {
        &self.state.build_id
    }

    pub fn workunit_store(&self) -> WorkunitStore {
        self.state.workunit_store.clone()
    }

    ///
    /// Cancels this Session: all of its root demands are dropped, and any node with no
    /// remaining dependents is transitively canceled. Canceling is sticky for the life of the
    /// Session.
    ///
    pub fn cancel(&self) {
        self.state.cancelled.trigger();
    }

    ///
    /// Returns when the Session has been canceled.
    ///
    pub async fn cancelled(&self) {
        self.state.cancelled.triggered().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.poll_triggered()
    }

    ///
    /// The graph Context for this Session: created once, so that all demands in the Session
    /// share one RunId.
    ///
    pub fn graph_context(&self) -> Context {
        let mut maybe_context = self.state.context.lock();
        if let Some(context) = maybe_context.as_ref() {
            return context.clone();
        }
        let context = self.core.graph.context(SessionCore {
            core: self.core.clone(),
            session: self.clone(),
        });
        *maybe_context = Some(context.clone());
        context
    }

    ///
    /// Move to a new RunId, which renders per-session ("uncacheable") node results from prior
    /// runs of this Session invalid.
    ///
    pub fn new_run_id(&self) {
        if let Some(context) = self.state.context.lock().as_ref() {
            context.new_run_id();
        }
    }
}
