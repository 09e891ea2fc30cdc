// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cache::PersistentCache;
use store::Store;
use tempfile::TempDir;
use workunit_store::{RunningWorkunit, WorkunitStore};

use crate::{
    CacheContentBehavior, Context, FallibleProcessResultWithPlatform, Platform, Process,
    ProcessCacheScope, ProcessError, ProcessExecutionEnvironment, ProcessExecutionStrategy,
    ProcessResultMetadata, ProcessResultSource,
};

///
/// An inner runner which counts its runs and returns a configured exit code.
///
struct CountingRunner {
    store: Store,
    runs: AtomicUsize,
    exit_code: i32,
}

impl fmt::Debug for CountingRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingRunner").finish()
    }
}

#[async_trait]
impl crate::CommandRunner for CountingRunner {
    async fn run(
        &self,
        _context: Context,
        _workunit: &mut RunningWorkunit,
        _process: Process,
    ) -> Result<FallibleProcessResultWithPlatform, ProcessError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let stdout_digest = self
            .store
            .store_file_bytes(bytes::Bytes::from_static(b"ran"), true)
            .await?;
        let stderr_digest = self
            .store
            .store_file_bytes(bytes::Bytes::new(), true)
            .await?;
        Ok(FallibleProcessResultWithPlatform {
            stdout_digest,
            stderr_digest,
            exit_code: self.exit_code,
            output_directory: fs::EMPTY_DIRECTORY_DIGEST.clone(),
            metadata: ProcessResultMetadata::new(
                Some(std::time::Duration::from_millis(100).into()),
                ProcessResultSource::Ran,
                ProcessExecutionEnvironment {
                    name: None,
                    platform: Platform::current().unwrap(),
                    strategy_cache_value: ProcessExecutionStrategy::Local.cache_value(),
                },
                workunit_store::RunId(0),
            ),
        })
    }

    async fn shutdown(&self) -> Result<(), String> {
        Ok(())
    }
}

struct CacheHarness {
    runner: crate::cache::CommandRunner,
    inner: Arc<CountingRunner>,
    _store_dir: TempDir,
    _cache_dir: TempDir,
}

fn harness(exit_code: i32) -> CacheHarness {
    let store_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let executor = task_executor::Executor::new();
    let store = Store::local_only(executor, store_dir.path()).unwrap();
    let inner = Arc::new(CountingRunner {
        store: store.clone(),
        runs: AtomicUsize::new(0),
        exit_code,
    });

    #[derive(Debug)]
    struct ArcRunner(Arc<CountingRunner>);

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

    let runner = crate::cache::CommandRunner::new(
        Arc::new(ArcRunner(inner.clone())),
        PersistentCache::new(cache_dir.path()).unwrap(),
        store,
        true,
        CacheContentBehavior::Validate,
        None,
    );
    CacheHarness {
        runner,
        inner,
        _store_dir: store_dir,
        _cache_dir: cache_dir,
    }
}

async fn run_twice(
    harness: &CacheHarness,
    process: Process,
) -> (FallibleProcessResultWithPlatform, FallibleProcessResultWithPlatform) {
    let (_, mut workunit) = WorkunitStore::setup_for_tests();
    let first = crate::CommandRunner::run(
        &harness.runner,
        Context::default(),
        &mut workunit,
        process.clone(),
    )
    .await
    .unwrap();
    let second = crate::CommandRunner::run(
        &harness.runner,
        Context::default(),
        &mut workunit,
        process,
    )
    .await
    .unwrap();
    (first, second)
}

#[tokio::test]
async fn successful_results_are_cached() {
    let harness = harness(0);
    let process = Process::new(vec!["this-does-not-run".to_owned()]);

    let (first, second) = run_twice(&harness, process).await;

    // The second invocation must be served from the cache, with an identical output digest.
    assert_eq!(harness.inner.runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        first.output_directory.as_digest(),
        second.output_directory.as_digest()
    );
    assert_eq!(second.metadata.source, ProcessResultSource::HitLocally);
}

#[tokio::test]
async fn failed_results_are_not_cached_by_default() {
    let harness = harness(1);
    let process = Process::new(vec!["fails".to_owned()]);

    let (_, _) = run_twice(&harness, process).await;
    assert_eq!(harness.inner.runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_results_are_cached_with_scope_always() {
    let harness = harness(1);
    let process =
        Process::new(vec!["fails".to_owned()]).cache_scope(ProcessCacheScope::Always);

    let (_, second) = run_twice(&harness, process).await;
    assert_eq!(harness.inner.runs.load(Ordering::SeqCst), 1);
    assert_eq!(second.exit_code, 1);
}

#[tokio::test]
async fn per_restart_scopes_are_not_persisted() {
    let harness = harness(0);
    let process = Process::new(vec!["per-restart".to_owned()])
        .cache_scope(ProcessCacheScope::PerRestartSuccessful);

    let (_, _) = run_twice(&harness, process).await;
    assert_eq!(harness.inner.runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cache_scope_is_part_of_the_key() {
    let harness = harness(0);
    let process = Process::new(vec!["scoped".to_owned()]);

    let (_, mut workunit) = WorkunitStore::setup_for_tests();
    crate::CommandRunner::run(
        &harness.runner,
        Context::default(),
        &mut workunit,
        process.clone().cache_scope(ProcessCacheScope::Successful),
    )
    .await
    .unwrap();
    crate::CommandRunner::run(
        &harness.runner,
        Context::default(),
        &mut workunit,
        process.cache_scope(ProcessCacheScope::Always),
    )
    .await
    .unwrap();

    // Changing only the scope changes the key, so both invocations ran.
    assert_eq!(harness.inner.runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cache_hits_across_runner_instances() {
    // Simulates a cache hit across sessions/processes: a new cache::CommandRunner backed by
    // the same persistent directories.
    let store_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let executor = task_executor::Executor::new();

    let run_in_fresh_instance = || async {
        let store = Store::local_only(executor.clone(), store_dir.path()).unwrap();
        let inner = Arc::new(CountingRunner {
            store: store.clone(),
            runs: AtomicUsize::new(0),
            exit_code: 0,
        });

        #[derive(Debug)]
        struct ArcRunner(Arc<CountingRunner>);

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

        let runner = crate::cache::CommandRunner::new(
            Arc::new(ArcRunner(inner.clone())),
            PersistentCache::new(cache_dir.path()).unwrap(),
            store,
            true,
            CacheContentBehavior::Validate,
            None,
        );
        let (_, mut workunit) = WorkunitStore::setup_for_tests();
        let result = crate::CommandRunner::run(
            &runner,
            Context::default(),
            &mut workunit,
            Process::new(vec!["cross-session".to_owned()]),
        )
        .await
        .unwrap();
        (inner.runs.load(Ordering::SeqCst), result)
    };

    let (first_runs, first) = run_in_fresh_instance().await;
    let (second_runs, second) = run_in_fresh_instance().await;

    assert_eq!(first_runs, 1);
    // No sandbox/inner run in the second instance: the stored result is returned.
    assert_eq!(second_runs, 0);
    assert_eq!(
        first.output_directory.as_digest(),
        second.output_directory.as_digest()
    );
}
