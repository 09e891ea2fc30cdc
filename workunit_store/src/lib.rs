// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{self, AtomicBool};
use std::sync::Arc;
use std::time::SystemTime;

use concrete_time::TimeSpan;
use parking_lot::Mutex;
use rand::Rng;
use tokio::task_local;

pub use log::Level;

mod metrics;
pub use crate::metrics::{Metric, ObservationMetric};

///
/// A unique id for a single run within a single Scheduler.
///
/// RunIds are not comparable across Scheduler instances: only equality is meaningful, not
/// ordering.
///
/// NB: This type is defined here to make it easily accessible to both the `process_execution`
/// and `engine` crates: it's not actually used by the WorkunitStore.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RunId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct SpanId(pub u64);

impl SpanId {
    pub fn new() -> SpanId {
        SpanId(rand::rng().random())
    }
}

impl std::fmt::Display for SpanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016.x}", self.0)
    }
}

///
/// One unit of work on the timeline. The `state` distinguishes the copy recorded when the work
/// started from the copy recorded when it finished.
///
#[derive(Clone, Debug)]
pub struct Workunit {
    pub name: &'static str,
    pub level: Level,
    pub span_id: SpanId,
    pub parent_ids: Vec<SpanId>,
    pub state: WorkunitState,
    pub metadata: Option<WorkunitMetadata>,
}

impl Workunit {
    /// If the workunit has completed, its TimeSpan.
    pub fn time_span(&self) -> Option<TimeSpan> {
        match self.state {
            WorkunitState::Started { .. } => None,
            WorkunitState::Completed { time_span } => Some(time_span),
        }
    }

    fn log_state(&self, verb: &str) {
        if !log::log_enabled!(self.level) {
            return;
        }
        let Some(metadata) = self.metadata.as_ref() else {
            return;
        };

        let mut line = String::new();
        line.push_str(verb);
        line.push(' ');
        match &metadata.desc {
            Some(desc) => push_truncated(&mut line, desc),
            None => line.push_str(self.name),
        }
        if let Some(message) = &metadata.message {
            line.push_str(" - ");
            push_truncated(&mut line, message);
        }
        log::log!(self.level, "{line}");
    }
}

// Keep log lines from individual workunits bounded.
const MAX_LOGGED_DESC_CHARS: usize = 256;

fn push_truncated(line: &mut String, text: &str) {
    if text.chars().count() <= MAX_LOGGED_DESC_CHARS {
        line.push_str(text);
    } else {
        line.extend(text.chars().take(MAX_LOGGED_DESC_CHARS));
        line.push_str("...");
    }
}

#[derive(Clone, Debug)]
pub enum WorkunitState {
    Started {
        start_time: SystemTime,
        blocked: Arc<AtomicBool>,
    },
    Completed {
        time_span: TimeSpan,
    },
}

impl WorkunitState {
    pub fn blocked(&self) -> bool {
        match self {
            WorkunitState::Started { blocked, .. } => blocked.load(atomic::Ordering::Relaxed),
            WorkunitState::Completed { .. } => false,
        }
    }
}

// NB: Only implemented for `fs::DirectoryDigest`, but boxed to avoid a cycle between this crate
// and the `fs` crate.
pub trait DirectoryDigest: Any + Debug + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
}

#[derive(Clone, Debug)]
pub enum ArtifactOutput {
    FileDigest(hashing::Digest),
    Snapshot(Arc<dyn DirectoryDigest>),
}

#[derive(Clone, Debug, Default)]
pub struct WorkunitMetadata {
    pub desc: Option<String>,
    pub message: Option<String>,
    pub stdout: Option<hashing::Digest>,
    pub stderr: Option<hashing::Digest>,
    pub artifacts: Vec<(String, ArtifactOutput)>,
}

///
/// The store of workunits and engine metrics: the structured timeline surface consumed by
/// drivers and UIs.
///
/// Readers poll with `latest_workunits`, which drains everything recorded since the previous
/// poll. Workunit mutation happens on the stack copy held by `RunningWorkunit` while the work
/// runs: the store only ever receives immutable snapshots, so there is no reconciliation
/// machinery here, just two append-only buffers.
///
#[derive(Clone)]
pub struct WorkunitStore {
    log_starting_workunits: bool,
    max_level: Level,
    timeline: Arc<Mutex<Timeline>>,
    metrics: Arc<MetricsData>,
}

#[derive(Default)]
struct Timeline {
    started: Vec<Workunit>,
    completed: Vec<Workunit>,
}

impl WorkunitStore {
    pub fn new(log_starting_workunits: bool, max_level: Level) -> WorkunitStore {
        WorkunitStore {
            log_starting_workunits,
            max_level,
            timeline: Arc::default(),
            metrics: Arc::default(),
        }
    }

    pub fn init_thread_state(&self, parent_id: Option<SpanId>) {
        set_thread_workunit_store_handle(Some(WorkunitStoreHandle {
            store: self.clone(),
            parent_id,
        }))
    }

    pub fn max_level(&self) -> Level {
        self.max_level
    }

    ///
    /// Record the start of a unit of work, and return the live handle which will record its
    /// completion (or cancellation, if dropped without completing).
    ///
    pub fn start_workunit(
        &self,
        name: &'static str,
        level: Level,
        parent_id: Option<SpanId>,
        metadata: Option<WorkunitMetadata>,
    ) -> RunningWorkunit {
        let workunit = Workunit {
            name,
            level,
            span_id: SpanId::new(),
            parent_ids: parent_id.into_iter().collect(),
            state: WorkunitState::Started {
                start_time: SystemTime::now(),
                blocked: Arc::new(AtomicBool::new(false)),
            },
            metadata,
        };

        self.timeline.lock().started.push(workunit.clone());
        if self.log_starting_workunits {
            workunit.log_state("Starting:");
        }

        RunningWorkunit {
            store: self.clone(),
            workunit: Some(workunit),
        }
    }

    fn complete_workunit(&self, mut workunit: Workunit) {
        if let WorkunitState::Started { start_time, .. } = workunit.state {
            workunit.state = WorkunitState::Completed {
                time_span: TimeSpan::since(&start_time),
            };
        }
        workunit.log_state("Completed:");
        self.timeline.lock().completed.push(workunit);
    }

    fn cancel_workunit(&self, workunit: Workunit) {
        // Canceled workunits never reach the completed buffer: the started record is the only
        // trace of them.
        workunit.log_state("Canceled:");
    }

    ///
    /// Add an already-finished workunit to the timeline with explicit start and end times.
    ///
    pub fn add_completed_workunit(
        &self,
        name: &'static str,
        level: Level,
        start_time: SystemTime,
        end_time: SystemTime,
        parent_id: Option<SpanId>,
        metadata: WorkunitMetadata,
    ) {
        let duration = end_time.duration_since(start_time).unwrap_or_default();
        let workunit = Workunit {
            name,
            level,
            span_id: SpanId::new(),
            parent_ids: parent_id.into_iter().collect(),
            state: WorkunitState::Completed {
                time_span: TimeSpan {
                    start: start_time
                        .duration_since(SystemTime::UNIX_EPOCH)
                        .unwrap_or_default()
                        .into(),
                    duration: duration.into(),
                },
            },
            metadata: Some(metadata),
        };
        let mut timeline = self.timeline.lock();
        timeline.started.push(workunit.clone());
        timeline.completed.push(workunit);
    }

    ///
    /// Drain and return the workunits started and completed since the last call, at or below
    /// the given verbosity.
    ///
    pub fn latest_workunits(&self, max_verbosity: log::Level) -> (Vec<Workunit>, Vec<Workunit>) {
        let (started, completed) = {
            let mut timeline = self.timeline.lock();
            (
                std::mem::take(&mut timeline.started),
                std::mem::take(&mut timeline.completed),
            )
        };
        let visible = |workunit: &Workunit| workunit.level <= max_verbosity;
        (
            started.into_iter().filter(visible).collect(),
            completed.into_iter().filter(visible).collect(),
        )
    }

    pub fn increment_counter(&self, counter_name: Metric, change: u64) {
        *self.metrics.counters.lock().entry(counter_name).or_insert(0) += change;
    }

    pub fn get_metrics(&self) -> HashMap<&'static str, u64> {
        self.metrics
            .counters
            .lock()
            .iter()
            .map(|(metric, value)| (metric.into(), *value))
            .collect()
    }

    ///
    /// Records an observation of a time-like metric.
    ///
    pub fn record_observation(&self, metric: ObservationMetric, value: u64) {
        self.metrics
            .observations
            .lock()
            .entry(metric)
            .or_default()
            .record(value);
    }

    pub fn get_observations(&self) -> HashMap<&'static str, ObservationSummary> {
        self.metrics
            .observations
            .lock()
            .iter()
            .map(|(metric, summary)| (metric.into(), *summary))
            .collect()
    }

    pub fn setup_for_tests() -> (WorkunitStore, RunningWorkunit) {
        let store = WorkunitStore::new(false, Level::Trace);
        store.init_thread_state(None);
        let workunit = store.start_workunit("testing", Level::Info, None, None);
        (store, workunit)
    }
}

///
/// A (count, sum, max) summary of a time-like metric.
///
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ObservationSummary {
    pub count: u64,
    pub sum: u64,
    pub max: u64,
}

impl ObservationSummary {
    fn record(&mut self, value: u64) {
        self.count += 1;
        self.sum += value;
        self.max = std::cmp::max(self.max, value);
    }
}

#[derive(Default)]
struct MetricsData {
    counters: Mutex<HashMap<Metric, u64>>,
    observations: Mutex<HashMap<ObservationMetric, ObservationSummary>>,
}

///
/// The per-thread/task state that tracks the current workunit store and workunit parent id.
///
#[derive(Clone)]
pub struct WorkunitStoreHandle {
    pub store: WorkunitStore,
    pub parent_id: Option<SpanId>,
}

thread_local! {
  static THREAD_WORKUNIT_STORE_HANDLE: RefCell<Option<WorkunitStoreHandle>> = const { RefCell::new(None) }
}

task_local! {
  static TASK_WORKUNIT_STORE_HANDLE: Option<WorkunitStoreHandle>;
}

///
/// Set the current parent_id for a Thread, but _not_ for a Task. Tasks must always be spawned by
/// callers using the `scope_task_workunit_store_handle` helper (generally via
/// `task_executor::Executor`).
///
pub fn set_thread_workunit_store_handle(workunit_store_handle: Option<WorkunitStoreHandle>) {
    THREAD_WORKUNIT_STORE_HANDLE.with(|handle| {
        *handle.borrow_mut() = workunit_store_handle;
    })
}

pub fn get_workunit_store_handle() -> Option<WorkunitStoreHandle> {
    // The task-local wins when set: thread-locals are only the fallback for threads which are
    // not running as tasks.
    TASK_WORKUNIT_STORE_HANDLE
        .try_with(|handle| handle.clone())
        .ok()
        .flatten()
        .or_else(|| THREAD_WORKUNIT_STORE_HANDLE.with(|handle| handle.borrow().clone()))
}

pub fn expect_workunit_store_handle() -> WorkunitStoreHandle {
    get_workunit_store_handle().expect("A WorkunitStore has not been set for this thread.")
}

///
/// Run the given async block inside of a workunit recorded in the workunit store.
///
/// NB: This macro may only be used on a thread with a WorkunitStore configured (via
/// `WorkunitStore::init_thread_state`).
///
#[macro_export]
macro_rules! in_workunit {
  ($workunit_name: expr, $workunit_level: expr $(, $workunit_field_name:ident = $workunit_field_value:expr)*, |$workunit: ident| $f: expr $(,)?) => {{
    use futures::future::FutureExt;
    let mut store_handle = $crate::expect_workunit_store_handle();
    let level: log::Level = $workunit_level;
    let metadata = if store_handle.store.max_level() >= level {
      Some($crate::WorkunitMetadata {
        $(
              $workunit_field_name: $workunit_field_value,
        )*
        ..Default::default()
      })
    } else {
      None
    };
    let mut $workunit =
      store_handle
        .store
        .start_workunit($workunit_name, level, store_handle.parent_id, metadata);
    store_handle.parent_id = Some($workunit.span_id());
    $crate::scope_task_workunit_store_handle(Some(store_handle), async move {
      let result = {
        let $workunit = &mut $workunit;
        $f
      }
      .await;
      $workunit.complete();
      result
    })
    .boxed()
  }};
}

///
/// The live handle to a started workunit: completes it on `complete`, or records a cancellation
/// if dropped while still running.
///
pub struct RunningWorkunit {
    store: WorkunitStore,
    workunit: Option<Workunit>,
}

impl RunningWorkunit {
    pub fn span_id(&self) -> SpanId {
        self.workunit
            .as_ref()
            .map(|workunit| workunit.span_id)
            .expect("The workunit has already completed.")
    }

    pub fn record_observation(&mut self, metric: ObservationMetric, value: u64) {
        self.store.record_observation(metric, value);
    }

    pub fn increment_counter(&mut self, counter_name: Metric, change: u64) {
        self.store.increment_counter(counter_name, change);
    }

    ///
    /// If the workunit is enabled, receives its current metadata. If Some((metadata, level)) is
    /// returned by the function, the workunit will complete with the new metadata and level.
    ///
    pub fn update_metadata<F>(&mut self, f: F)
    where
        F: FnOnce(Option<(WorkunitMetadata, Level)>) -> Option<(WorkunitMetadata, Level)>,
    {
        if let Some(workunit) = self.workunit.as_mut() {
            if let Some((metadata, level)) =
                f(workunit.metadata.clone().map(|m| (m, workunit.level)))
            {
                workunit.level = level;
                workunit.metadata = Some(metadata);
            }
        }
    }

    ///
    /// Marks the workunit as being blocked until the returned token is dropped.
    ///
    pub fn blocking(&mut self) -> BlockingWorkunitToken {
        let mut token = BlockingWorkunitToken(None);
        if let Some(workunit) = self.workunit.as_mut() {
            if let WorkunitState::Started { blocked, .. } = &workunit.state {
                blocked.store(true, atomic::Ordering::Relaxed);
                token.0 = Some(blocked.clone());
            }
        }
        token
    }

    pub fn complete(&mut self) {
        if let Some(workunit) = self.workunit.take() {
            self.store.complete_workunit(workunit);
        }
    }
}

impl Drop for RunningWorkunit {
    fn drop(&mut self) {
        if let Some(workunit) = self.workunit.take() {
            self.store.cancel_workunit(workunit);
        }
    }
}

pub struct BlockingWorkunitToken(Option<Arc<AtomicBool>>);

impl Drop for BlockingWorkunitToken {
    fn drop(&mut self) {
        if let Some(blocked) = self.0.take() {
            blocked.store(false, atomic::Ordering::Relaxed);
        }
    }
}

///
/// Propagate the given WorkunitStoreHandle to a Future representing a newly spawned Task.
///
pub async fn scope_task_workunit_store_handle<F>(
    workunit_store_handle: Option<WorkunitStoreHandle>,
    f: F,
) -> F::Output
where
    F: Future,
{
    TASK_WORKUNIT_STORE_HANDLE
        .scope(workunit_store_handle, f)
        .await
}

#[cfg(test)]
mod tests;
