// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::time::Duration;

use maplit::{btreemap, btreeset};
use store::{ImmutableInputs, Store};
use testutil::TestData;
use tempfile::TempDir;
use workunit_store::{RunningWorkunit, WorkunitStore};

use crate::{
    local::KeepSandboxes, CacheName, CommandRunner as CommandRunnerTrait, Context,
    FallibleProcessResultWithPlatform, InputDigests, NamedCaches, Process, ProcessError,
};

#[derive(PartialEq, Debug)]
struct LocalTestResult {
    original: FallibleProcessResultWithPlatform,
    stdout_bytes: Vec<u8>,
    stderr_bytes: Vec<u8>,
}

struct TestHarness {
    store: Store,
    runner: crate::local::CommandRunner,
    _store_dir: TempDir,
    _work_dir: TempDir,
    _named_caches_dir: TempDir,
}

fn harness() -> TestHarness {
    harness_with_keep(KeepSandboxes::Never)
}

fn harness_with_keep(keep_sandboxes: KeepSandboxes) -> TestHarness {
    let store_dir = TempDir::new().unwrap();
    let work_dir = TempDir::new().unwrap();
    let named_caches_dir = TempDir::new().unwrap();
    let executor = task_executor::Executor::new();
    let store = Store::local_only(executor.clone(), store_dir.path()).unwrap();
    let runner = crate::local::CommandRunner::new(
        store.clone(),
        executor,
        work_dir.path().to_owned(),
        NamedCaches::new_local(named_caches_dir.path().to_owned()),
        ImmutableInputs::new(store.clone(), work_dir.path()).unwrap(),
        keep_sandboxes,
    );
    TestHarness {
        store,
        runner,
        _store_dir: store_dir,
        _work_dir: work_dir,
        _named_caches_dir: named_caches_dir,
    }
}

async fn run(
    harness: &TestHarness,
    req: Process,
) -> Result<LocalTestResult, ProcessError> {
    let (_, mut workunit) = WorkunitStore::setup_for_tests();
    run_in_workunit(harness, req, &mut workunit).await
}

async fn run_in_workunit(
    harness: &TestHarness,
    req: Process,
    workunit: &mut RunningWorkunit,
) -> Result<LocalTestResult, ProcessError> {
    let original = harness
        .runner
        .run(Context::default(), workunit, req)
        .await?;
    let (stdout, stderr) = crate::load_stdio(&harness.store, &original).await?;
    Ok(LocalTestResult {
        original,
        stdout_bytes: stdout.to_vec(),
        stderr_bytes: stderr.to_vec(),
    })
}

fn bash(script: &str) -> Process {
    Process::new(vec![
        "/bin/bash".to_owned(),
        "-c".to_owned(),
        script.to_owned(),
    ])
    .description("a bash script".to_owned())
}

#[tokio::test]
async fn stdout() {
    let harness = harness();
    let result = run(&harness, bash("echo -n foo")).await.unwrap();
    assert_eq!(result.stdout_bytes, "foo".as_bytes());
    assert_eq!(result.stderr_bytes, "".as_bytes());
    assert_eq!(result.original.exit_code, 0);
}

#[tokio::test]
async fn stdout_and_stderr_and_exit_code() {
    let harness = harness();
    let result = run(&harness, bash("echo -n foo ; echo >&2 -n bar ; exit 1"))
        .await
        .unwrap();
    assert_eq!(result.stdout_bytes, "foo".as_bytes());
    assert_eq!(result.stderr_bytes, "bar".as_bytes());
    assert_eq!(result.original.exit_code, 1);
}

#[tokio::test]
async fn env_is_only_what_is_declared() {
    let harness = harness();
    let env: BTreeMap<String, String> = btreemap! {
        "FOO".to_owned() => "foo".to_owned(),
        "BAR".to_owned() => "not foo".to_owned(),
    };
    let result = run(&harness, bash("env").env(env)).await.unwrap();

    let stdout = String::from_utf8(result.stdout_bytes).unwrap();
    let mut got_env: Vec<&str> = stdout
        .lines()
        .filter(|line| {
            // The shell sets a few variables of its own.
            line.starts_with("FOO=") || line.starts_with("BAR=") || line.starts_with("PATH=")
        })
        .collect();
    got_env.sort();
    assert_eq!(got_env, vec!["BAR=not foo", "FOO=foo", "PATH="]);
}

#[tokio::test]
async fn output_files_are_captured() {
    let harness = harness();
    let testdata = TestData::catnip();
    let result = run(
        &harness,
        bash(&format!("echo -n {} > feed.txt", testdata.string()))
            .output_files(btreeset![fs::RelativePath::new("feed.txt").unwrap()]),
    )
    .await
    .unwrap();

    assert_eq!(
        result.original.output_directory.as_digest(),
        testutil::TestDirectory::containing_catnip().digest()
    );
}

#[tokio::test]
async fn output_directories_are_captured_recursively() {
    let harness = harness();
    let testdata = TestData::catnip();
    let result = run(
        &harness,
        bash(&format!(
            "mkdir -p pets && echo -n {} > pets/feed.txt",
            testdata.string()
        ))
        .output_directories(btreeset![fs::RelativePath::new("pets").unwrap()]),
    )
    .await
    .unwrap();

    assert_eq!(
        result.original.output_directory.as_digest(),
        testutil::TestDirectory::nested().digest()
    );
}

#[tokio::test]
async fn absent_declared_outputs_are_fatal() {
    // A successful process which did not produce its declared outputs is an error for the
    // calling rule, not an empty result.
    let harness = harness();
    let error = run(
        &harness,
        bash("exit 0").output_files(btreeset![fs::RelativePath::new("missing.txt").unwrap()]),
    )
    .await
    .expect_err("want err");
    assert!(
        matches!(error, ProcessError::Unclassified(ref msg) if msg.contains("did not produce")),
        "Got: {error:?}"
    );
}

#[tokio::test]
async fn absent_outputs_of_failed_processes_are_tolerated() {
    let harness = harness();
    let result = run(
        &harness,
        bash("exit 1").output_files(btreeset![fs::RelativePath::new("missing.txt").unwrap()]),
    )
    .await
    .unwrap();
    assert_eq!(result.original.exit_code, 1);
    assert_eq!(
        result.original.output_directory.as_digest(),
        hashing::EMPTY_DIGEST
    );
}

#[tokio::test]
async fn working_directory_is_respected() {
    let harness = harness();
    let result = run(
        &harness,
        Process::new(vec![
            "/bin/bash".to_owned(),
            "-c".to_owned(),
            "echo -n catnip > feed.txt".to_owned(),
        ])
        .working_directory(Some(fs::RelativePath::new("pets").unwrap()))
        .output_directories(btreeset![fs::RelativePath::new(".").unwrap()])
        .description("working directory".to_owned()),
    )
    .await
    .unwrap();
    assert_eq!(
        result.original.output_directory.as_digest(),
        testutil::TestDirectory::containing_catnip().digest()
    );
}

#[tokio::test]
async fn timeout_results_in_termination() {
    let harness = harness();
    let result = run(
        &harness,
        bash("echo -n started ; sleep 30 ; echo -n finished")
            .timeout(Duration::from_millis(200)),
    )
    .await
    .unwrap();

    assert_eq!(result.original.exit_code, -15);
    let stderr = String::from_utf8(result.stderr_bytes).unwrap();
    assert!(stderr.contains("Exceeded timeout"), "Got: {stderr}");
}

#[tokio::test]
async fn chroot_placeholder_is_replaced() {
    let harness = harness();
    let result = run(
        &harness,
        bash("echo -n $SANDBOX").env(btreemap! {
            "SANDBOX".to_owned() => "{chroot}".to_owned(),
        }),
    )
    .await
    .unwrap();
    let stdout = String::from_utf8(result.stdout_bytes).unwrap();
    assert!(
        stdout.contains("process-execution"),
        "Expected the sandbox path, got: {stdout}"
    );
}

#[tokio::test]
async fn append_only_caches_are_symlinked() {
    let harness = harness();
    let result = run(
        &harness,
        bash("test -L .cache/test_cache && echo -n linked").append_only_caches(btreemap! {
            CacheName::new("test_cache".to_owned()).unwrap() =>
                fs::RelativePath::new(".cache/test_cache").unwrap(),
        }),
    )
    .await
    .unwrap();
    assert_eq!(result.stdout_bytes, "linked".as_bytes());
    assert_eq!(result.original.exit_code, 0);
}

#[tokio::test]
async fn input_files_are_materialized() {
    let harness = harness();
    let testdata = TestData::catnip();
    harness
        .store
        .store_file_bytes(testdata.bytes(), false)
        .await
        .unwrap();
    harness
        .store
        .record_directory(&testutil::TestDirectory::containing_catnip().directory(), false)
        .await
        .unwrap();

    let input_digests = InputDigests::with_input_files(fs::DirectoryDigest::from_persisted_digest(
        testutil::TestDirectory::containing_catnip().digest(),
    ));
    let result = run(&harness, bash("cat feed.txt").input_digests(input_digests))
        .await
        .unwrap();
    assert_eq!(result.stdout_bytes, testdata.bytes());
}

#[tokio::test]
async fn missing_input_digest_is_an_error() {
    let harness = harness();
    let input_digests = InputDigests::with_input_files(fs::DirectoryDigest::from_persisted_digest(
        testutil::TestDirectory::containing_catnip().digest(),
    ));
    let error = run(&harness, bash("cat feed.txt").input_digests(input_digests))
        .await
        .expect_err("want err");
    assert!(
        matches!(error, ProcessError::Unclassified(ref msg) if msg.contains("Failed to execute")),
        "Got: {error:?}"
    );
}

#[tokio::test]
async fn sandboxes_are_removed_by_default() {
    let harness = harness();
    run(&harness, bash("exit 0")).await.unwrap();
    let remaining = std::fs::read_dir(harness._work_dir.path())
        .unwrap()
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let name = entry.file_name().to_string_lossy().to_string();
            name.starts_with("process-execution").then_some(name)
        })
        .collect::<Vec<_>>();
    assert_eq!(remaining, Vec::<String>::new());
}

#[tokio::test]
async fn kept_sandboxes_contain_a_run_script() {
    let harness = harness_with_keep(KeepSandboxes::Always);
    run(&harness, bash("exit 0")).await.unwrap();
    let sandbox = std::fs::read_dir(harness._work_dir.path())
        .unwrap()
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let name = entry.file_name().to_string_lossy().to_string();
            name.starts_with("process-execution")
                .then_some(entry.path())
        })
        .next()
        .expect("Expected a preserved sandbox");
    assert!(sandbox.join("__run.sh").is_file());
}
