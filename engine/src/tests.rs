// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::context::{Core, ExecutionStrategyOptions, LocalStoreOptions};
use crate::core::{Failure, Key, Params, TypeId, Value};
use crate::nodes::{ProcessResult, TaskContext};
use crate::scheduler::{ExecutionRequest, ExecutionTermination, Scheduler};
use crate::session::Session;
use crate::tasks::{RuleFn, Tasks};
use crate::types::Types;

fn rule_fn<F, Fut>(f: F) -> RuleFn
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Failure>> + Send + 'static,
{
    Arc::new(move |context| f(context).boxed())
}

///
/// Counts how many times each rule body has run.
///
#[derive(Clone, Default)]
struct RunCounts(Arc<Mutex<HashMap<String, usize>>>);

impl RunCounts {
    fn record(&self, id: &str) {
        *self.0.lock().entry(id.to_owned()).or_insert(0) += 1;
    }

    fn get(&self, id: &str) -> usize {
        self.0.lock().get(id).cloned().unwrap_or(0)
    }
}

struct TestSetup {
    scheduler: Scheduler,
    session: Session,
    counts: RunCounts,
    build_root: TempDir,
    _store_dir: TempDir,
    execution_dir: TempDir,
    _named_caches_dir: TempDir,
}

async fn setup(register: impl FnOnce(&mut Tasks, &Types, &RunCounts)) -> TestSetup {
    setup_with_dirs(register, None, ExecutionStrategyOptions::default()).await
}

async fn setup_with_dirs(
    register: impl FnOnce(&mut Tasks, &Types, &RunCounts),
    store_dir: Option<TempDir>,
    exec_strategy_opts: ExecutionStrategyOptions,
) -> TestSetup {
    let build_root = TempDir::new().unwrap();
    let store_dir = store_dir.unwrap_or_else(|| TempDir::new().unwrap());
    let execution_dir = TempDir::new().unwrap();
    let named_caches_dir = TempDir::new().unwrap();

    let types = Types::new();
    let counts = RunCounts::default();
    let mut tasks = Tasks::new();
    register(&mut tasks, &types, &counts);

    let executor = task_executor::Executor::new();
    let core = Core::new(
        executor,
        tasks,
        types,
        build_root.path().to_owned(),
        vec![],
        execution_dir.path().to_owned(),
        named_caches_dir.path().to_owned(),
        LocalStoreOptions {
            store_dir: store_dir.path().to_owned(),
            ..LocalStoreOptions::default()
        },
        exec_strategy_opts,
        // Tests drive invalidation explicitly rather than watching.
        false,
    )
    .await
    .unwrap();

    let scheduler = Scheduler::new(core);
    let session = Session::new(scheduler.core.clone(), "test".to_owned(), log::Level::Debug);
    TestSetup {
        scheduler,
        session,
        counts,
        build_root,
        _store_dir: store_dir,
        execution_dir,
        _named_caches_dir: named_caches_dir,
    }
}

fn input_type() -> TypeId {
    TypeId::new("Input")
}

fn output_type() -> TypeId {
    TypeId::new("Output")
}

fn middle_type() -> TypeId {
    TypeId::new("Middle")
}

///
/// Registers `R : (Input) -> Output`, which produces a string derived from its input.
///
fn register_simple_rule(tasks: &mut Tasks, _types: &Types, counts: &RunCounts) {
    let counts = counts.clone();
    tasks.task_begin(
        "make_output".to_owned(),
        output_type(),
        true,
        rule_fn(move |context| {
            let counts = counts.clone();
            async move {
                counts.record("make_output");
                let input: String = context.get_param(input_type())?.extract()?;
                Ok(Value::new(format!("output for {input}")))
            }
        }),
    );
    tasks.add_parameter(input_type());
    tasks.task_end();
    tasks.query_add(output_type(), vec![input_type()]);
}

async fn execute_with_input(
    setup: &TestSetup,
    input: &str,
) -> Result<Vec<Result<Value, Failure>>, ExecutionTermination> {
    let mut request = ExecutionRequest::new();
    setup
        .scheduler
        .add_root_select(
            &mut request,
            Params::new(vec![Key::new(input_type(), input.to_owned())]).unwrap(),
            output_type(),
        )
        .unwrap();
    setup.scheduler.execute(&request, &setup.session).await
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_run_executes_once() {
    let setup = setup(register_simple_rule).await;

    let results = execute_with_input(&setup, "42").await.unwrap();
    let value = results.into_iter().next().unwrap().unwrap();
    assert_eq!(value.extract::<String>().unwrap(), "output for 42");
    assert_eq!(setup.counts.get("make_output"), 1);

    // The node table contains the Root and exactly one `make_output` node.
    assert_eq!(setup.scheduler.node_count(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_run_resolves_from_memo() {
    let setup = setup(register_simple_rule).await;

    execute_with_input(&setup, "42").await.unwrap();
    let results = execute_with_input(&setup, "42").await.unwrap();
    let value = results.into_iter().next().unwrap().unwrap();
    assert_eq!(value.extract::<String>().unwrap(), "output for 42");

    // No rule body ran for the second request.
    assert_eq!(setup.counts.get("make_output"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn changed_input_reruns() {
    let setup = setup(register_simple_rule).await;

    execute_with_input(&setup, "42").await.unwrap();
    let results = execute_with_input(&setup, "43").await.unwrap();
    let value = results.into_iter().next().unwrap().unwrap();
    assert_eq!(value.extract::<String>().unwrap(), "output for 43");
    assert_eq!(setup.counts.get("make_output"), 2);
}

///
/// Registers a chain `Output <- Middle <- Snapshot(*.txt)`, where the middle rule masks file
/// content (it returns only the file count), so that content changes must not rerun the top
/// rule.
///
fn register_masking_chain(tasks: &mut Tasks, types: &Types, counts: &RunCounts) {
    let counts2 = counts.clone();
    let types = *types;
    tasks.task_begin(
        "measure_sources".to_owned(),
        middle_type(),
        true,
        rule_fn(move |context| {
            let counts = counts2.clone();
            async move {
                counts.record("measure_sources");
                let path_globs = fs::PathGlobs::new(
                    vec!["*.txt".to_owned()],
                    fs::StrictGlobMatching::Ignore,
                    fs::GlobExpansionConjunction::AllMatch,
                );
                let snapshot: store::Snapshot = context
                    .get(types.snapshot, vec![Key::new(types.path_globs, path_globs)])
                    .await?
                    .extract()?;
                // Mask the content: only the number of captured files is observable.
                Ok(Value::new(format!("{} files", snapshot.files().len())))
            }
        }),
    );
    tasks.add_get(types.snapshot, vec![types.path_globs]);
    tasks.task_end();

    let counts3 = counts.clone();
    tasks.task_begin(
        "make_output".to_owned(),
        output_type(),
        true,
        rule_fn(move |context| {
            let counts = counts3.clone();
            async move {
                counts.record("make_output");
                let middle: String = context.get(middle_type(), vec![]).await?.extract()?;
                Ok(Value::new(format!("output from {middle}")))
            }
        }),
    );
    tasks.add_get(middle_type(), vec![]);
    tasks.task_end();
    tasks.query_add(output_type(), vec![]);
}

#[tokio::test(flavor = "multi_thread")]
async fn early_cutoff_for_equal_values() {
    let setup = setup(register_masking_chain).await;
    let file_path = setup.build_root.path().join("source.txt");
    std::fs::write(&file_path, b"one").unwrap();

    let mut request = ExecutionRequest::new();
    setup
        .scheduler
        .add_root_select(&mut request, Params::new(vec![]).unwrap(), output_type())
        .unwrap();

    setup.scheduler.execute(&request, &setup.session).await.unwrap();
    assert_eq!(setup.counts.get("measure_sources"), 1);
    assert_eq!(setup.counts.get("make_output"), 1);

    // Changing the file's content reruns the capturing rule, but its (masked) value is equal:
    // the downstream consumer must not rerun.
    std::fs::write(&file_path, b"two").unwrap();
    setup.scheduler.invalidate_all_paths();
    setup.scheduler.execute(&request, &setup.session).await.unwrap();
    assert_eq!(setup.counts.get("measure_sources"), 2);
    assert_eq!(setup.counts.get("make_output"), 1);
}

///
/// Registers a rule which runs a process (via the process intrinsic) and returns its stdout
/// digest rendered as a string.
///
fn register_process_rule(tasks: &mut Tasks, types: &Types, counts: &RunCounts) {
    let counts = counts.clone();
    let types = *types;
    tasks.task_begin(
        "run_process".to_owned(),
        output_type(),
        true,
        rule_fn(move |context| {
            let counts = counts.clone();
            async move {
                counts.record("run_process");
                let process = process_execution::Process::new(vec![
                    "/bin/bash".to_owned(),
                    "-c".to_owned(),
                    "echo -n 'process output' > out.txt".to_owned(),
                ])
                .output_files(
                    vec![fs::RelativePath::new("out.txt").unwrap()]
                        .into_iter()
                        .collect(),
                )
                .description("a test process".to_owned());
                let result: ProcessResult = context
                    .get(types.process_result, vec![Key::new(types.process, process)])
                    .await?
                    .extract()?;
                Ok(Value::new(format!(
                    "{:?}",
                    result.result.output_directory.as_digest()
                )))
            }
        }),
    );
    tasks.add_get(types.process_result, vec![types.process]);
    tasks.task_end();
    tasks.query_add(output_type(), vec![input_type()]);
}

fn count_sandboxes(execution_dir: &TempDir) -> usize {
    std::fs::read_dir(execution_dir.path())
        .unwrap()
        .filter(|entry| {
            entry
                .as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with("process-execution")
        })
        .count()
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_identical_processes_launch_once() {
    let setup = setup_with_dirs(
        register_process_rule,
        None,
        ExecutionStrategyOptions {
            local_keep_sandboxes: process_execution::KeepSandboxes::Always,
            ..ExecutionStrategyOptions::default()
        },
    )
    .await;

    // Two concurrent demands whose rules run the identical process: the node graph identity
    // dedupes them into a single launch (and thus a single sandbox).
    let execute1 = execute_with_input(&setup, "left");
    let execute2 = execute_with_input(&setup, "right");
    let (results1, results2) = futures::join!(execute1, execute2);

    let value1 = results1.unwrap().into_iter().next().unwrap().unwrap();
    let value2 = results2.unwrap().into_iter().next().unwrap().unwrap();
    assert_eq!(
        value1.extract::<String>().unwrap(),
        value2.extract::<String>().unwrap()
    );
    assert_eq!(count_sandboxes(&setup.execution_dir), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn process_cache_hit_across_sessions() {
    let store_dir = TempDir::new().unwrap();
    let opts = ExecutionStrategyOptions {
        local_keep_sandboxes: process_execution::KeepSandboxes::Always,
        ..ExecutionStrategyOptions::default()
    };

    // Session A runs the process.
    let store_dir = {
        let setup_a = setup_with_dirs(register_process_rule, Some(store_dir), opts.clone()).await;
        execute_with_input(&setup_a, "a").await.unwrap();
        assert_eq!(count_sandboxes(&setup_a.execution_dir), 1);
        setup_a._store_dir
    };

    // Session B (a fresh Core sharing the same store) hits the persistent process cache: no
    // sandbox is materialized.
    let setup_b = setup_with_dirs(register_process_rule, Some(store_dir), opts).await;
    execute_with_input(&setup_b, "b").await.unwrap();
    assert_eq!(count_sandboxes(&setup_b.execution_dir), 0);
}

///
/// Registers rules `A -> gets B` and `B -> gets A`: statically constructible, dynamically a
/// cycle.
///
fn register_cycle(tasks: &mut Tasks, _types: &Types, _counts: &RunCounts) {
    tasks.task_begin(
        "rule_a".to_owned(),
        output_type(),
        true,
        rule_fn(|context| async move {
            context.get(middle_type(), vec![]).await
        }),
    );
    tasks.add_get(middle_type(), vec![]);
    tasks.task_end();

    tasks.task_begin(
        "rule_b".to_owned(),
        middle_type(),
        true,
        rule_fn(|context| async move {
            context.get(output_type(), vec![]).await
        }),
    );
    tasks.add_get(output_type(), vec![]);
    tasks.task_end();
    tasks.query_add(output_type(), vec![]);
}

#[tokio::test(flavor = "multi_thread")]
async fn dynamic_cycles_fail_the_demand() {
    let setup = setup(register_cycle).await;

    let mut request = ExecutionRequest::new();
    setup
        .scheduler
        .add_root_select(&mut request, Params::new(vec![]).unwrap(), output_type())
        .unwrap();
    let results = setup
        .scheduler
        .execute(&request, &setup.session)
        .await
        .unwrap();
    let failure = results.into_iter().next().unwrap().expect_err("want err");
    match failure {
        Failure::Throw { val, .. } => {
            assert!(val.contains("cycle"), "Got: {val}");
            assert!(val.contains("rule_a") && val.contains("rule_b"), "Got: {val}");
        }
        other => panic!("Expected a cycle failure, got: {other:?}"),
    }
}

///
/// Registers a rule which captures a file from the build root via the snapshot intrinsic.
///
fn register_snapshot_rule(tasks: &mut Tasks, types: &Types, counts: &RunCounts) {
    let counts = counts.clone();
    let types = *types;
    tasks.task_begin(
        "digest_sources".to_owned(),
        output_type(),
        true,
        rule_fn(move |context| {
            let counts = counts.clone();
            async move {
                counts.record("digest_sources");
                let path_globs = fs::PathGlobs::new(
                    vec!["*.txt".to_owned()],
                    fs::StrictGlobMatching::Ignore,
                    fs::GlobExpansionConjunction::AllMatch,
                );
                let snapshot: store::Snapshot = context
                    .get(types.snapshot, vec![Key::new(types.path_globs, path_globs)])
                    .await?
                    .extract()?;
                Ok(Value::new(format!("{:?}", snapshot.digest)))
            }
        }),
    );
    tasks.add_get(types.snapshot, vec![types.path_globs]);
    tasks.task_end();
    tasks.query_add(output_type(), vec![input_type()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalidation_reruns_only_on_content_change() {
    let setup = setup(register_snapshot_rule).await;
    let file_path = setup.build_root.path().join("source.txt");
    std::fs::write(&file_path, b"one").unwrap();

    let first = execute_with_input(&setup, "x").await.unwrap();
    let first = first.into_iter().next().unwrap().unwrap();
    assert_eq!(setup.counts.get("digest_sources"), 1);

    // A touch which does not change content invalidates the file node, but its re-read
    // produces an equal digest: the rule must not rerun.
    std::fs::write(&file_path, b"one").unwrap();
    setup.scheduler.invalidate_all_paths();
    let second = execute_with_input(&setup, "x").await.unwrap();
    let second = second.into_iter().next().unwrap().unwrap();
    assert_eq!(first.extract::<String>().unwrap(), second.extract::<String>().unwrap());
    assert_eq!(setup.counts.get("digest_sources"), 1);

    // A content change invalidates and reruns.
    std::fs::write(&file_path, b"two").unwrap();
    setup.scheduler.invalidate_all_paths();
    let third = execute_with_input(&setup, "x").await.unwrap();
    let third = third.into_iter().next().unwrap().unwrap();
    assert_ne!(
        first.extract::<String>().unwrap(),
        third.extract::<String>().unwrap()
    );
    assert_eq!(setup.counts.get("digest_sources"), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_terminates_execution() {
    let setup = setup(|tasks, _types, _counts| {
        tasks.task_begin(
            "hangs".to_owned(),
            output_type(),
            true,
            rule_fn(|_context| async move {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok(Value::new("unreachable".to_owned()))
            }),
        );
        tasks.task_end();
        tasks.query_add(output_type(), vec![]);
    })
    .await;

    let mut request = ExecutionRequest::new();
    setup
        .scheduler
        .add_root_select(&mut request, Params::new(vec![]).unwrap(), output_type())
        .unwrap();

    let session = setup.session.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        session.cancel();
    });

    let result = setup.scheduler.execute(&request, &setup.session).await;
    assert_eq!(result.err(), Some(ExecutionTermination::Cancelled));
}

#[tokio::test(flavor = "multi_thread")]
async fn uncacheable_rules_rerun_per_session() {
    let setup = setup(|tasks, _types, counts| {
        let counts = counts.clone();
        tasks.task_begin(
            "per_session".to_owned(),
            output_type(),
            // NB: Not cacheable: the value is only valid within one run.
            false,
            rule_fn(move |_context| {
                let counts = counts.clone();
                async move {
                    counts.record("per_session");
                    Ok(Value::new("session value".to_owned()))
                }
            }),
        );
        tasks.task_end();
        tasks.query_add(output_type(), vec![]);
    })
    .await;

    let mut request = ExecutionRequest::new();
    setup
        .scheduler
        .add_root_select(&mut request, Params::new(vec![]).unwrap(), output_type())
        .unwrap();

    setup.scheduler.execute(&request, &setup.session).await.unwrap();
    setup.scheduler.execute(&request, &setup.session).await.unwrap();
    // Within one run of the session, the value is reused.
    assert_eq!(setup.counts.get("per_session"), 1);

    // In a new run, it must be recomputed.
    setup.session.new_run_id();
    setup.scheduler.execute(&request, &setup.session).await.unwrap();
    assert_eq!(setup.counts.get("per_session"), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn workunits_record_a_timeline() {
    let setup = setup(register_simple_rule).await;
    execute_with_input(&setup, "42").await.unwrap();

    let (_started, completed) = setup
        .session
        .workunit_store()
        .latest_workunits(log::Level::Trace);
    assert!(
        completed.iter().any(|workunit| workunit.name == "rule"),
        "Expected a rule workunit in: {:?}",
        completed.iter().map(|wu| wu.name).collect::<Vec<_>>()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn types_are_available() {
    // Smoke test for the Types surface.
    let types = Types::new();
    assert_ne!(types.process, types.process_result);
    assert_eq!(types.process, Types::new().process);
}
