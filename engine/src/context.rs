// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cache::PersistentCache;
use fs::{GitignoreStyleExcludes, PosixFS};
use graph::{Graph, InvalidationResult};
use log::info;
use process_execution::{
    bounded, docker, local, nailgun, remote, CacheContentBehavior, CommandRunner, KeepSandboxes,
    NamedCaches, ProcessExecutionStrategy,
};
use remote_provider::RemoteStoreOptions;
use rule_graph::RuleGraph;
use store::{ImmutableInputs, Store};
use task_executor::Executor;
use watch::{Invalidatable, InvalidationWatcher};
use workunit_store::RunningWorkunit;

use crate::intrinsics::Intrinsics;
use crate::nodes::NodeKey;
use crate::session::Session;
use crate::tasks::{Rule, Tasks};
use crate::types::Types;

///
/// The context threaded through all running Nodes: the process-wide Core, plus the Session the
/// demand belongs to.
///
pub type Context = graph::Context<NodeKey>;

#[derive(Clone)]
pub struct SessionCore {
    pub core: Arc<Core>,
    pub session: Session,
}

impl Deref for SessionCore {
    type Target = Arc<Core>;

    fn deref(&self) -> &Arc<Core> {
        &self.core
    }
}

///
/// Configuration for the composition of the process execution stack.
///
#[derive(Clone, Debug)]
pub struct ExecutionStrategyOptions {
    /// The maximum number of concurrent local processes: the size of the execution semaphore.
    pub local_parallelism: usize,
    /// Whether (and when) to preserve process sandboxes on disk.
    pub local_keep_sandboxes: KeepSandboxes,
    /// The number of persistent nailgun servers to allow.
    pub nailgun_pool_size: usize,
    /// Whether to read/write process results from the persistent local cache.
    pub local_cache: bool,
    /// How to validate the content of local cache hits.
    pub local_cache_content_behavior: CacheContentBehavior,
    /// The address of a Remote Execution API service, if remote execution is enabled.
    pub remote_execution_address: Option<String>,
    /// A deadline for each remote execution (including queuing).
    pub remote_execution_overall_deadline: Duration,
}

impl Default for ExecutionStrategyOptions {
    fn default() -> Self {
        ExecutionStrategyOptions {
            local_parallelism: num_cpus::get(),
            local_keep_sandboxes: KeepSandboxes::Never,
            nailgun_pool_size: 2,
            local_cache: true,
            local_cache_content_behavior: CacheContentBehavior::Fetch,
            remote_execution_address: None,
            remote_execution_overall_deadline: Duration::from_secs(60 * 60),
        }
    }
}

///
/// Configuration for the local (and optional remote) store.
///
#[derive(Clone, Debug)]
pub struct LocalStoreOptions {
    /// The root of the persisted store layout (`files/`, `directories/`, `processes/`, `tmp/`).
    pub store_dir: PathBuf,
    /// The target size for garbage collection.
    pub target_size_bytes: usize,
    /// A remote store to mirror to/from, if any.
    pub remote_store_options: Option<RemoteStoreOptions>,
}

impl Default for LocalStoreOptions {
    fn default() -> Self {
        LocalStoreOptions {
            store_dir: Store::default_path(),
            target_size_bytes: store::DEFAULT_LOCAL_STORE_GC_TARGET_BYTES,
            remote_store_options: None,
        }
    }
}

///
/// The process-wide engine core: initialized once at startup, and immutable afterwards aside
/// from the node graph it contains. Everything session-scoped is plumbed through explicit
/// Session handles instead.
///
pub struct Core {
    pub graph: Arc<InvalidatableGraph>,
    pub rule_graph: RuleGraph<Rule>,
    pub types: Types,
    pub intrinsics: Intrinsics,
    pub executor: Executor,
    store: Store,
    pub command_runner: Arc<dyn CommandRunner>,
    pub vfs: PosixFS,
    pub build_root: PathBuf,
    pub watcher: Option<Arc<InvalidationWatcher>>,
    pub local_cache: PersistentCache,
}

impl Core {
    pub async fn new(
        executor: Executor,
        mut tasks: Tasks,
        types: Types,
        build_root: PathBuf,
        ignore_patterns: Vec<String>,
        local_execution_root_dir: PathBuf,
        named_caches_dir: PathBuf,
        local_store_options: LocalStoreOptions,
        exec_strategy_opts: ExecutionStrategyOptions,
        watch_filesystem: bool,
    ) -> Result<Core, String> {
        let intrinsics = Intrinsics::new(&types);
        tasks.intrinsics_set(intrinsics.keys());

        let rule_graph = RuleGraph::new(tasks.rules().clone(), tasks.queries().clone())?;
        rule_graph.validate_reachability(tasks.rules())?;

        std::fs::create_dir_all(&local_execution_root_dir)
            .map_err(|e| format!("Failed to create {local_execution_root_dir:?}: {e}"))?;

        let store = {
            let store = Store::local_only(executor.clone(), &local_store_options.store_dir)?;
            match &local_store_options.remote_store_options {
                Some(options) => store.into_with_remote(options.clone()).await?,
                None => store,
            }
        };
        let local_cache = PersistentCache::new(&local_store_options.store_dir)?;

        let command_runner = Self::make_command_runner(
            &executor,
            &store,
            &local_cache,
            &local_execution_root_dir,
            &named_caches_dir,
            &exec_strategy_opts,
        )
        .await?;

        let ignorer = GitignoreStyleExcludes::create(ignore_patterns)
            .map_err(|e| format!("Could not parse build ignore patterns: {e}"))?;
        let vfs = PosixFS::new(&build_root, ignorer.clone(), executor.clone())?;

        let graph = Arc::new(InvalidatableGraph(Graph::new(executor.clone())));

        let watcher = if watch_filesystem {
            let watcher = InvalidationWatcher::new(executor.clone(), build_root.clone(), ignorer)?;
            watcher.start(&graph);
            Some(watcher)
        } else {
            None
        };

        Ok(Core {
            graph,
            rule_graph,
            types,
            intrinsics,
            executor,
            store,
            command_runner,
            vfs,
            build_root,
            watcher,
            local_cache,
        })
    }

    async fn make_command_runner(
        executor: &Executor,
        store: &Store,
        local_cache: &PersistentCache,
        local_execution_root_dir: &PathBuf,
        named_caches_dir: &PathBuf,
        exec_strategy_opts: &ExecutionStrategyOptions,
    ) -> Result<Arc<dyn CommandRunner>, String> {
        let named_caches = NamedCaches::new_local(named_caches_dir.clone());
        let immutable_inputs = ImmutableInputs::new(store.clone(), local_execution_root_dir)?;

        let local_runner = local::CommandRunner::new(
            store.clone(),
            executor.clone(),
            local_execution_root_dir.clone(),
            named_caches.clone(),
            immutable_inputs.clone(),
            exec_strategy_opts.local_keep_sandboxes,
        );
        // Nailgun-eligible requests run on persistent workers: all others pass through to the
        // local runner.
        let nailgun_runner = nailgun::CommandRunner::new(
            local_runner,
            local_execution_root_dir.clone(),
            store.clone(),
            executor.clone(),
            exec_strategy_opts.nailgun_pool_size,
        );
        let docker_runner = docker::CommandRunner::new(
            store.clone(),
            executor.clone(),
            local_execution_root_dir.clone(),
            named_caches,
            immutable_inputs,
            exec_strategy_opts.local_keep_sandboxes,
        );
        let remote_runner = match &exec_strategy_opts.remote_execution_address {
            Some(address) => Some(
                remote::CommandRunner::new(
                    address,
                    None,
                    None,
                    None,
                    std::collections::BTreeMap::new(),
                    store.clone(),
                    exec_strategy_opts.remote_execution_overall_deadline,
                    Duration::from_millis(500),
                )
                .await?,
            ),
            None => None,
        };

        let leaf: Box<dyn CommandRunner> = Box::new(SwitchedCommandRunner {
            local: nailgun_runner,
            docker: docker_runner,
            remote: remote_runner,
        });
        let bounded = bounded::CommandRunner::new(leaf, exec_strategy_opts.local_parallelism);

        let runner: Arc<dyn CommandRunner> = if exec_strategy_opts.local_cache {
            Arc::new(process_execution::cache::CommandRunner::new(
                Arc::new(bounded),
                local_cache.clone(),
                store.clone(),
                true,
                exec_strategy_opts.local_cache_content_behavior,
                None,
            ))
        } else {
            Arc::new(bounded)
        };
        Ok(runner)
    }

    pub fn store(&self) -> Store {
        self.store.clone()
    }

    ///
    /// Shuts down this Core.
    ///
    pub async fn shutdown(&self) {
        if let Err(msg) = self.command_runner.shutdown().await {
            log::warn!("Failed to shutdown command runner: {msg}");
        }
    }
}

///
/// Dispatches each process to the runner for its declared execution strategy.
///
struct SwitchedCommandRunner {
    local: nailgun::CommandRunner,
    docker: docker::CommandRunner,
    remote: Option<remote::CommandRunner>,
}

impl fmt::Debug for SwitchedCommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwitchedCommandRunner")
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CommandRunner for SwitchedCommandRunner {
    async fn run(
        &self,
        context: process_execution::Context,
        workunit: &mut RunningWorkunit,
        req: process_execution::Process,
    ) -> Result<process_execution::FallibleProcessResultWithPlatform, process_execution::ProcessError>
    {
        match req.execution_strategy {
            ProcessExecutionStrategy::Local => self.local.run(context, workunit, req).await,
            ProcessExecutionStrategy::Docker(_) => self.docker.run(context, workunit, req).await,
            ProcessExecutionStrategy::RemoteExecution(_) => match &self.remote {
                Some(remote) => remote.run(context, workunit, req).await,
                None => Err(process_execution::ProcessError::Unclassified(
                    "The Process requested remote execution, but remote execution is not \
                    configured."
                        .to_owned(),
                )),
            },
        }
    }

    async fn shutdown(&self) -> Result<(), String> {
        self.local.shutdown().await
    }
}

///
/// A Graph of NodeKeys which can be invalidated by the filesystem watcher: translating a set of
/// changed paths into cleared/dirtied nodes.
///
pub struct InvalidatableGraph(pub Graph<NodeKey>);

impl Invalidatable for InvalidatableGraph {
    fn invalidate(&self, paths: &HashSet<PathBuf>, caller: &str) -> usize {
        let InvalidationResult { cleared, dirtied } =
            self.invalidate_from_roots(true, move |node| {
                if let Some(fs_subject) = node.fs_subject() {
                    paths.contains(fs_subject)
                } else {
                    false
                }
            });
        info!(
            "{caller} invalidation: cleared {cleared} and dirtied {dirtied} nodes for: {paths:?}"
        );
        cleared + dirtied
    }
}

impl Deref for InvalidatableGraph {
    type Target = Graph<NodeKey>;

    fn deref(&self) -> &Graph<NodeKey> {
        &self.0
    }
}
