// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use workunit_store::{RunningWorkunit, WorkunitStore};

use crate::{
    bounded, Context, FallibleProcessResultWithPlatform, Platform, Process, ProcessError,
    ProcessExecutionEnvironment, ProcessExecutionStrategy, ProcessResultMetadata,
    ProcessResultSource,
};

///
/// A runner which records its maximum concurrency, and completes after a short delay.
///
struct ConcurrencyRecordingRunner {
    current: AtomicUsize,
    max_observed: AtomicUsize,
    delay: Duration,
}

impl fmt::Debug for ConcurrencyRecordingRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyRecordingRunner").finish()
    }
}

fn empty_result(env: &std::collections::BTreeMap<String, String>) -> FallibleProcessResultWithPlatform {
    FallibleProcessResultWithPlatform {
        stdout_digest: hashing::Digest::of_bytes(
            format!("{env:?}").as_bytes(),
        ),
        stderr_digest: hashing::EMPTY_DIGEST,
        exit_code: 0,
        output_directory: fs::EMPTY_DIRECTORY_DIGEST.clone(),
        metadata: ProcessResultMetadata::new(
            None,
            ProcessResultSource::Ran,
            ProcessExecutionEnvironment {
                name: None,
                platform: Platform::current().unwrap(),
                strategy_cache_value: ProcessExecutionStrategy::Local.cache_value(),
            },
            workunit_store::RunId(0),
        ),
    }
}

#[async_trait]
impl crate::CommandRunner for ConcurrencyRecordingRunner {
    async fn run(
        &self,
        _context: Context,
        _workunit: &mut RunningWorkunit,
        process: Process,
    ) -> Result<FallibleProcessResultWithPlatform, ProcessError> {
        let concurrent = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed.fetch_max(concurrent, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(empty_result(&process.env))
    }

    async fn shutdown(&self) -> Result<(), String> {
        Ok(())
    }
}

async fn run_many(bound: usize, processes: usize) -> usize {
    let (_, _workunit) = WorkunitStore::setup_for_tests();
    let inner = Arc::new(ConcurrencyRecordingRunner {
        current: AtomicUsize::new(0),
        max_observed: AtomicUsize::new(0),
        delay: Duration::from_millis(50),
    });
    let runner = Arc::new(bounded::CommandRunner::new(
        Box::new(ArcRunner(inner.clone())),
        bound,
    ));

    let mut tasks = Vec::new();
    for i in 0..processes {
        let runner = runner.clone();
        tasks.push(tokio::spawn(async move {
            let (_, mut workunit) = WorkunitStore::setup_for_tests();
            let process = Process::new(vec![format!("process-{i}")]);
            crate::CommandRunner::run(&*runner, Context::default(), &mut workunit, process).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    inner.max_observed.load(Ordering::SeqCst)
}

///
/// A newtype to share one inner runner across the Box the bounded runner requires.
///
#[derive(Debug)]
struct ArcRunner(Arc<ConcurrencyRecordingRunner>);

#[async_trait]
impl crate::CommandRunner for ArcRunner {
    async fn run(
        &self,
        context: Context,
        workunit: &mut RunningWorkunit,
        process: Process,
    ) -> Result<FallibleProcessResultWithPlatform, ProcessError> {
        self.0.run(context, workunit, process).await
    }

    async fn shutdown(&self) -> Result<(), String> {
        self.0.shutdown().await
    }
}

#[tokio::test]
async fn at_most_bound_processes_run_concurrently() {
    let max_observed = run_many(2, 8).await;
    assert!(
        max_observed <= 2,
        "Expected at most 2 concurrent processes, saw {max_observed}"
    );
}

#[tokio::test]
async fn all_processes_complete_with_a_single_permit() {
    let max_observed = run_many(1, 4).await;
    assert_eq!(max_observed, 1);
}

#[tokio::test]
async fn execution_slot_variable_is_set() {
    let (_, mut workunit) = WorkunitStore::setup_for_tests();

    #[derive(Debug)]
    struct EnvCapturingRunner(Arc<parking_lot::Mutex<Option<String>>>);

    #[async_trait]
    impl crate::CommandRunner for EnvCapturingRunner {
        async fn run(
            &self,
            _context: Context,
            _workunit: &mut RunningWorkunit,
            process: Process,
        ) -> Result<FallibleProcessResultWithPlatform, ProcessError> {
            *self.0.lock() = process.env.get("SLOT").cloned();
            Ok(empty_result(&process.env))
        }

        async fn shutdown(&self) -> Result<(), String> {
            Ok(())
        }
    }

    let captured = Arc::new(parking_lot::Mutex::new(None));
    let runner =
        bounded::CommandRunner::new(Box::new(EnvCapturingRunner(captured.clone())), 4);

    let mut process = Process::new(vec!["slotted".to_owned()]);
    process.execution_slot_variable = Some("SLOT".to_owned());
    crate::CommandRunner::run(&runner, Context::default(), &mut workunit, process)
        .await
        .unwrap();

    let slot = captured.lock().clone().expect("SLOT should have been set");
    let slot: usize = slot.parse().unwrap();
    assert!(slot < 4);
}
