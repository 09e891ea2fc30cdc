// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(unused_must_use)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Display};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use concrete_time::TimeSpan;
use fs::{DirectoryDigest, RelativePath, EMPTY_DIRECTORY_DIGEST};
use grpc_util::prost::MessageExt;
use hashing::Digest;
use itertools::Itertools;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use serde::{Deserialize, Serialize};
use store::{Store, StoreError};
use workunit_store::{RunId, RunningWorkunit, WorkunitStore};

pub mod bounded;
#[cfg(test)]
mod bounded_tests;
pub mod cache;
#[cfg(test)]
mod cache_tests;
mod children;
pub mod docker;
pub mod local;
#[cfg(test)]
mod local_tests;
pub mod nailgun;
mod named_caches;
pub mod remote;

pub use children::ManagedChild;
pub use local::KeepSandboxes;
pub use named_caches::{CacheName, NamedCaches};

// Convention: all sandboxes are materialized under a directory with this prefix.
const SANDBOX_PREFIX: &str = "process-execution";

///
/// An error that may be (but isn't necessarily) caused by a missing digest.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProcessError {
    /// A Digest was not present in either of the local or remote Stores.
    MissingDigest(String, Digest),
    /// All other error types.
    Unclassified(String),
}

impl ProcessError {
    pub fn enrich(self, prefix: &str) -> Self {
        match self {
            Self::MissingDigest(s, d) => Self::MissingDigest(format!("{prefix}: {s}"), d),
            Self::Unclassified(s) => Self::Unclassified(format!("{prefix}: {s}")),
        }
    }
}

impl Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDigest(s, d) => {
                write!(f, "{s}: {d:?}")
            }
            Self::Unclassified(s) => write!(f, "{s}"),
        }
    }
}

impl From<StoreError> for ProcessError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MissingDigest(s, d) => Self::MissingDigest(s, d),
            StoreError::Unclassified(s) => Self::Unclassified(s),
        }
    }
}

impl From<String> for ProcessError {
    fn from(err: String) -> Self {
        Self::Unclassified(err)
    }
}

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, strum_macros::EnumString,
)]
#[allow(non_camel_case_types)]
#[strum(serialize_all = "snake_case")]
pub enum Platform {
    Macos_x86_64,
    Macos_arm64,
    Linux_x86_64,
    Linux_arm64,
}

impl Platform {
    pub fn current() -> Result<Platform, String> {
        match (std::env::consts::OS, std::env::consts::ARCH) {
            ("linux", "x86_64") => Ok(Platform::Linux_x86_64),
            ("linux", "aarch64") => Ok(Platform::Linux_arm64),
            ("macos", "x86_64") => Ok(Platform::Macos_x86_64),
            ("macos", "aarch64") => Ok(Platform::Macos_arm64),
            (os, arch) => Err(format!("Unsupported platform: {os} {arch}")),
        }
    }
}

impl From<Platform> for String {
    fn from(platform: Platform) -> String {
        match platform {
            Platform::Linux_x86_64 => "linux_x86_64".to_string(),
            Platform::Linux_arm64 => "linux_arm64".to_string(),
            Platform::Macos_arm64 => "macos_arm64".to_string(),
            Platform::Macos_x86_64 => "macos_x86_64".to_string(),
        }
    }
}

///
/// The policy for whether (and for how long) a process result may be served from the cache.
///
/// The scope is part of the process's cache key: changing it changes the key, so a relaxed
/// policy can never mask a stricter one.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ProcessCacheScope {
    // Cached in all locations, regardless of success or failure.
    Always,
    // Cached in all locations, but only if the process exits successfully.
    Successful,
    // Cached only in memory (i.e. memoized in the graph), but never persistently, regardless
    // of success vs. failure.
    PerRestartAlways,
    // Cached only in memory (i.e. memoized in the graph), but never persistently, and only if
    // the process exits successfully.
    PerRestartSuccessful,
    // Will run once per Session, i.e. once per run of the consumer, and only cached in memory.
    PerSession,
}

///
/// The executor to use for a process, and the strategy-specific inputs that are part of its
/// identity (e.g. the container image).
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum ProcessExecutionStrategy {
    Local,
    /// Stores platform_properties.
    RemoteExecution(Vec<(String, String)>),
    /// Stores the image name.
    Docker(String),
}

impl ProcessExecutionStrategy {
    /// What to insert into the Command proto so that the cache key reflects the execution
    /// strategy where it affects the result.
    pub fn cache_value(&self) -> String {
        match self {
            Self::Local => "local_execution: true".to_string(),
            Self::RemoteExecution(_) => "remote_execution: true".to_string(),
            Self::Docker(image) => format!("docker_image: {image}"),
        }
    }
}

///
/// The collection of input digests for a process: its input root, plus trees which are exposed
/// via symlinks into an immutable, materialize-once cache, plus (for nailgun processes) the
/// subset of inputs which constitute the persistent server's classpath.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct InputDigests {
    /// All of the input Digests, merged: this is the digest used for cache keys and for remote
    /// execution, where the sandboxing tricks below do not apply.
    pub complete: DirectoryDigest,

    /// The input Digests which will be materialized into the sandbox.
    pub inputs: DirectoryDigest,

    /// Sub-trees which will be exposed read-only at their RelativePaths via symlinks into an
    /// immutable cache, rather than being materialized per-sandbox.
    pub immutable_inputs: BTreeMap<RelativePath, DirectoryDigest>,

    /// If non-empty, the relative paths (within `inputs`) which constitute a nailgun server's
    /// startup classpath: the process is eligible to run on a persistent nailgun worker.
    pub use_nailgun: BTreeSet<RelativePath>,
}

impl InputDigests {
    pub async fn new(
        store: &Store,
        inputs: DirectoryDigest,
        immutable_inputs: BTreeMap<RelativePath, DirectoryDigest>,
        use_nailgun: BTreeSet<RelativePath>,
    ) -> Result<Self, StoreError> {
        // The complete digest is the merged view of the inputs with the immutable inputs
        // applied at their prefixes.
        let mut trees = vec![store.load_digest_trie(inputs.clone()).await?];
        for (path, digest) in &immutable_inputs {
            let tree = store.load_digest_trie(digest.clone()).await?;
            trees.push(tree.add_prefix(path)?);
        }
        let complete = fs::DigestTrie::merge(trees)?.into();

        Ok(Self {
            complete,
            inputs,
            immutable_inputs,
            use_nailgun,
        })
    }

    pub fn with_input_files(inputs: DirectoryDigest) -> Self {
        Self {
            complete: inputs.clone(),
            inputs,
            immutable_inputs: BTreeMap::new(),
            use_nailgun: BTreeSet::new(),
        }
    }
}

impl Default for InputDigests {
    fn default() -> Self {
        Self {
            complete: EMPTY_DIRECTORY_DIGEST.clone(),
            inputs: EMPTY_DIRECTORY_DIGEST.clone(),
            immutable_inputs: BTreeMap::new(),
            use_nailgun: BTreeSet::new(),
        }
    }
}

///
/// A process to be executed.
///
/// When executing a `Process` using the `local::CommandRunner`, any `{chroot}` placeholders in
/// the environment variables are replaced with the temporary sandbox path.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Process {
    ///
    /// The arguments to execute.
    ///
    /// The first argument should be an absolute or relative path to the binary to execute.
    ///
    /// No PATH lookup will be performed unless a PATH environment variable is specified.
    ///
    /// No shell expansion will take place.
    ///
    pub argv: Vec<String>,
    ///
    /// The environment variables to set for the execution.
    ///
    /// No other environment variables will be set (except possibly for an empty PATH variable).
    ///
    pub env: BTreeMap<String, String>,

    ///
    /// A relative path to a directory existing in the `input_files` digest to execute the
    /// process from.
    ///
    pub working_directory: Option<RelativePath>,

    pub input_digests: InputDigests,

    pub output_files: BTreeSet<RelativePath>,

    pub output_directories: BTreeSet<RelativePath>,

    pub timeout: Option<Duration>,

    /// If not None, then a bounded::CommandRunner executing this Process will set an environment
    /// variable with this name containing a unique execution slot number.
    pub execution_slot_variable: Option<String>,

    pub description: String,

    // NB: We serialize with a function to avoid adding a serde dep to the logging crate.
    pub level: log::Level,

    ///
    /// Declares that this process uses the given named caches (which might have associated
    /// config in the future) at the associated relative paths within its workspace. Cache names
    /// must contain only lowercase ascii characters or underscores.
    ///
    pub append_only_caches: BTreeMap<CacheName, RelativePath>,

    ///
    /// If present, a symlink will be created at .jdk which points to this directory for local
    /// execution.
    ///
    pub jdk_home: Option<PathBuf>,

    pub cache_scope: ProcessCacheScope,

    pub execution_strategy: ProcessExecutionStrategy,
}

impl Process {
    ///
    /// Constructs a Process with default values for most fields, and the given argv.
    ///
    pub fn new(argv: Vec<String>) -> Process {
        Process {
            argv,
            env: BTreeMap::new(),
            working_directory: None,
            input_digests: InputDigests::default(),
            output_files: BTreeSet::new(),
            output_directories: BTreeSet::new(),
            timeout: None,
            description: "".to_string(),
            level: log::Level::Info,
            append_only_caches: BTreeMap::new(),
            jdk_home: None,
            execution_slot_variable: None,
            cache_scope: ProcessCacheScope::Successful,
            execution_strategy: ProcessExecutionStrategy::Local,
        }
    }

    ///
    /// Replaces the environment for this process.
    ///
    pub fn env(mut self, env: BTreeMap<String, String>) -> Process {
        self.env = env;
        self
    }

    pub fn working_directory(mut self, working_directory: Option<RelativePath>) -> Process {
        self.working_directory = working_directory;
        self
    }

    pub fn output_files(mut self, output_files: BTreeSet<RelativePath>) -> Process {
        self.output_files = output_files;
        self
    }

    pub fn output_directories(mut self, output_directories: BTreeSet<RelativePath>) -> Process {
        self.output_directories = output_directories;
        self
    }

    pub fn input_digests(mut self, input_digests: InputDigests) -> Process {
        self.input_digests = input_digests;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Process {
        self.timeout = Some(timeout);
        self
    }

    pub fn description(mut self, description: String) -> Process {
        self.description = description;
        self
    }

    pub fn level(mut self, level: log::Level) -> Process {
        self.level = level;
        self
    }

    pub fn append_only_caches(
        mut self,
        append_only_caches: BTreeMap<CacheName, RelativePath>,
    ) -> Process {
        self.append_only_caches = append_only_caches;
        self
    }

    pub fn jdk_home(mut self, jdk_home: Option<PathBuf>) -> Process {
        self.jdk_home = jdk_home;
        self
    }

    pub fn cache_scope(mut self, cache_scope: ProcessCacheScope) -> Process {
        self.cache_scope = cache_scope;
        self
    }

    pub fn docker(mut self, image: String) -> Process {
        self.execution_strategy = ProcessExecutionStrategy::Docker(image);
        self
    }

    pub fn remote_execution_platform_properties(
        mut self,
        properties: Vec<(String, String)>,
    ) -> Process {
        self.execution_strategy = ProcessExecutionStrategy::RemoteExecution(properties);
        self
    }
}

///
/// The execution environment that a process result was produced in, which is part of deciding
/// whether a cached result is usable.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ProcessExecutionEnvironment {
    /// The name of the environment the process ran in, if any.
    pub name: Option<String>,
    pub platform: Platform,
    pub strategy_cache_value: String,
}

///
/// The result of running a process.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct FallibleProcessResultWithPlatform {
    pub stdout_digest: Digest,
    pub stderr_digest: Digest,
    pub exit_code: i32,
    pub output_directory: DirectoryDigest,
    pub metadata: ProcessResultMetadata,
}

///
/// Metadata about a process result: timings, source, and environment.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ProcessResultMetadata {
    /// The time from starting to completion, including preparing the chroot and cleanup.
    pub total_elapsed: Option<concrete_time::Duration>,
    /// The environment that the process ran in.
    pub environment: ProcessExecutionEnvironment,
    /// Whether the process result came from the cache or was run directly.
    pub source: ProcessResultSource,
    /// The RunId of the Session in which the result was produced.
    pub origin_run_id: RunId,
    /// The time saved by a cache hit, if any.
    pub saved_by_cache: Option<concrete_time::Duration>,
}

impl ProcessResultMetadata {
    pub fn new(
        total_elapsed: Option<concrete_time::Duration>,
        source: ProcessResultSource,
        environment: ProcessExecutionEnvironment,
        origin_run_id: RunId,
    ) -> Self {
        Self {
            total_elapsed,
            environment,
            source,
            origin_run_id,
            saved_by_cache: None,
        }
    }

    pub fn new_from_metadata(
        metadata: Option<remexec::ExecutedActionMetadata>,
        source: ProcessResultSource,
        environment: ProcessExecutionEnvironment,
        origin_run_id: RunId,
    ) -> Self {
        let total_elapsed = metadata
            .and_then(|metadata| {
                match (
                    metadata.worker_start_timestamp,
                    metadata.worker_completed_timestamp,
                ) {
                    (Some(started), Some(completed)) => {
                        TimeSpan::from_start_and_end(&started, &completed).ok()
                    }
                    _ => None,
                }
            })
            .map(|time_span| time_span.duration);
        Self::new(total_elapsed, source, environment, origin_run_id)
    }

    pub fn update_cache_hit_elapsed(&mut self, cache_lookup_elapsed: Duration) {
        self.saved_by_cache = self.total_elapsed.map(|total_elapsed| {
            let total_elapsed: Duration = total_elapsed.into();
            total_elapsed
                .checked_sub(cache_lookup_elapsed)
                .unwrap_or_default()
                .into()
        });
        self.source = ProcessResultSource::HitLocally;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ProcessResultSource {
    Ran,
    HitLocally,
    HitRemotely,
}

///
/// The behavior for validating the content of a cache hit before using it.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum CacheContentBehavior {
    Fetch,
    Validate,
    Defer,
}

///
/// Optionally validate that all digests in the result are loadable, returning false if any
/// are not.
///
pub async fn check_cache_content(
    response: &FallibleProcessResultWithPlatform,
    store: &Store,
    cache_content_behavior: CacheContentBehavior,
) -> Result<bool, StoreError> {
    match cache_content_behavior {
        CacheContentBehavior::Fetch => {
            let response = response.clone();
            let fetch_result = store
                .ensure_local_has_recursive_directory(response.output_directory)
                .await;
            match fetch_result {
                Err(StoreError::MissingDigest(..)) => Ok(false),
                Ok(_) => Ok(true),
                Err(e) => Err(e),
            }
        }
        CacheContentBehavior::Validate => {
            let directory_digests = vec![response.output_directory.clone()];
            let file_digests = vec![response.stdout_digest, response.stderr_digest];
            store
                .exists_recursive(directory_digests, file_digests)
                .await
        }
        CacheContentBehavior::Defer => Ok(true),
    }
}

#[derive(Clone)]
pub struct Context {
    pub workunit_store: WorkunitStore,
    pub build_id: String,
    pub run_id: RunId,
}

impl Default for Context {
    fn default() -> Self {
        Context {
            workunit_store: WorkunitStore::new(false, log::Level::Debug),
            build_id: String::default(),
            run_id: RunId(0),
        }
    }
}

impl Context {
    pub fn new(workunit_store: WorkunitStore, build_id: String, run_id: RunId) -> Context {
        Context {
            workunit_store,
            build_id,
            run_id,
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync + Debug {
    ///
    /// Submit a request for execution on the underlying runtime, and return a future for it.
    ///
    async fn run(
        &self,
        context: Context,
        workunit: &mut RunningWorkunit,
        req: Process,
    ) -> Result<FallibleProcessResultWithPlatform, ProcessError>;

    /// Shutdown this CommandRunner cleanly.
    async fn shutdown(&self) -> Result<(), String>;
}

#[async_trait]
impl<T: CommandRunner + ?Sized> CommandRunner for Box<T> {
    async fn run(
        &self,
        context: Context,
        workunit: &mut RunningWorkunit,
        req: Process,
    ) -> Result<FallibleProcessResultWithPlatform, ProcessError> {
        (**self).run(context, workunit, req).await
    }

    async fn shutdown(&self) -> Result<(), String> {
        (**self).shutdown().await
    }
}

///
/// Construct the REAPI `Command` and `Action` protos for the given process. The Action also
/// embeds the strategy-dependent inputs (e.g. the docker image) and the cache scope via
/// platform properties, so that the serialized Action is the process's cache key.
///
pub fn make_execute_request(
    req: &Process,
    instance_name: Option<String>,
    cache_key_gen_version: Option<String>,
) -> Result<EntireExecuteRequest, String> {
    let mut command = remexec::Command {
        arguments: req.argv.clone(),
        environment_variables: req
            .env
            .iter()
            .map(|(name, value)| remexec::EnvironmentVariable {
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect(),
        working_directory: req
            .working_directory
            .as_ref()
            .map(|relpath| relpath.to_str().unwrap_or_default().to_owned())
            .unwrap_or_default(),
        output_paths: req
            .output_files
            .iter()
            .chain(req.output_directories.iter())
            .map(|relpath| relpath.to_str().unwrap_or_default().to_owned())
            .sorted()
            .collect(),
        ..remexec::Command::default()
    };

    let mut platform_properties = match &req.execution_strategy {
        ProcessExecutionStrategy::RemoteExecution(properties) => properties.clone(),
        _ => vec![],
    };
    platform_properties.push((
        "execution-strategy".to_owned(),
        req.execution_strategy.cache_value(),
    ));
    platform_properties.push(("cache-scope".to_owned(), format!("{:?}", req.cache_scope)));
    if let Some(cache_key_gen_version) = cache_key_gen_version {
        platform_properties.push(("cache-key-gen-version".to_owned(), cache_key_gen_version));
    }
    for (name, value) in &req.append_only_caches {
        platform_properties.push((
            "append-only-cache".to_owned(),
            format!("{}: {}", name.name(), value),
        ));
    }
    if req.jdk_home.is_some() {
        // Ideally, the JDK would be brought along as part of the input directory, but that
        // directory is large. The platform property is a placeholder for a hermetic JDK
        // selection.
        platform_properties.push(("JDK_SYMLINK".to_owned(), ".jdk".to_owned()));
    }
    platform_properties.sort();

    command.platform = Some(remexec::Platform {
        properties: platform_properties
            .into_iter()
            .map(|(name, value)| remexec::platform::Property { name, value })
            .collect(),
    });

    let command_digest = Digest::of_bytes(&command.to_bytes());
    let action = remexec::Action {
        command_digest: Some((&command_digest).into()),
        input_root_digest: Some(req.input_digests.complete.as_digest().into()),
        timeout: req.timeout.map(|timeout| prost_types::Duration {
            seconds: timeout.as_secs() as i64,
            nanos: timeout.subsec_nanos() as i32,
        }),
        ..remexec::Action::default()
    };
    let action_digest = Digest::of_bytes(&action.to_bytes());

    Ok(EntireExecuteRequest {
        action,
        command,
        execute_request: remexec::ExecuteRequest {
            action_digest: Some((&action_digest).into()),
            instance_name: instance_name.unwrap_or_default(),
            ..remexec::ExecuteRequest::default()
        },
    })
}

///
/// The REAPI request protos for one process.
///
#[derive(Clone, Debug, PartialEq)]
pub struct EntireExecuteRequest {
    pub action: remexec::Action,
    pub command: remexec::Command,
    pub execute_request: remexec::ExecuteRequest,
}

impl EntireExecuteRequest {
    pub fn action_digest(&self) -> Digest {
        Digest::of_bytes(&self.action.to_bytes())
    }
}

///
/// Compute the cache key Digest for the given process: the digest of its canonical Action
/// serialization, which includes the strategy-dependent inputs and the cache scope.
///
pub async fn get_digest(
    process: &Process,
    instance_name: Option<String>,
    process_cache_namespace: Option<String>,
) -> Result<Digest, String> {
    let request = make_execute_request(process, instance_name, process_cache_namespace)?;
    Ok(request.action_digest())
}

///
/// Ensure that the Action and Command protos for a request are persisted in the given Store,
/// so that they can be uploaded for remote execution or caching.
///
pub async fn ensure_action_stored_locally(
    store: &Store,
    request: &EntireExecuteRequest,
) -> Result<(Digest, Digest), String> {
    let (command_digest, action_digest) = futures::try_join!(
        store.store_file_bytes(request.command.to_bytes(), true),
        store.store_file_bytes(request.action.to_bytes(), true),
    )?;
    Ok((action_digest, command_digest))
}

///
/// Convert a REAPI `ActionResult` into a `FallibleProcessResultWithPlatform`, fetching or
/// storing any inlined blobs.
///
/// If `treat_tree_digest_as_final_directory_digest` is true, the root OutputDirectory's
/// tree_digest is interpreted as a directly-stored Directory digest (the local process cache's
/// convention); otherwise it identifies a REAPI `Tree` proto to be fetched from the remote
/// store.
///
pub async fn populate_fallible_execution_result(
    store: Store,
    run_id: RunId,
    action_result: &remexec::ActionResult,
    treat_tree_digest_as_final_directory_digest: bool,
    source: ProcessResultSource,
    environment: ProcessExecutionEnvironment,
) -> Result<FallibleProcessResultWithPlatform, StoreError> {
    let (stdout_digest, stderr_digest, output_directory) = futures::try_join!(
        extract_stdout(&store, action_result),
        extract_stderr(&store, action_result),
        extract_output_directory(
            &store,
            action_result,
            treat_tree_digest_as_final_directory_digest
        ),
    )?;

    Ok(FallibleProcessResultWithPlatform {
        stdout_digest,
        stderr_digest,
        exit_code: action_result.exit_code,
        output_directory,
        metadata: ProcessResultMetadata::new_from_metadata(
            action_result.execution_metadata.clone(),
            source,
            environment,
            run_id,
        ),
    })
}

async fn extract_stdout(
    store: &Store,
    action_result: &remexec::ActionResult,
) -> Result<Digest, StoreError> {
    if let Some(digest_proto) = &action_result.stdout_digest {
        let stdout_digest: Digest = digest_proto.try_into().map_err(StoreError::Unclassified)?;
        Ok(stdout_digest)
    } else {
        let stdout_raw = action_result.stdout_raw.clone();
        let digest = store.store_file_bytes(stdout_raw, true).await?;
        Ok(digest)
    }
}

async fn extract_stderr(
    store: &Store,
    action_result: &remexec::ActionResult,
) -> Result<Digest, StoreError> {
    if let Some(digest_proto) = &action_result.stderr_digest {
        let stderr_digest: Digest = digest_proto.try_into().map_err(StoreError::Unclassified)?;
        Ok(stderr_digest)
    } else {
        let stderr_raw = action_result.stderr_raw.clone();
        let digest = store.store_file_bytes(stderr_raw, true).await?;
        Ok(digest)
    }
}

async fn extract_output_directory(
    store: &Store,
    action_result: &remexec::ActionResult,
    treat_tree_digest_as_final_directory_digest: bool,
) -> Result<DirectoryDigest, StoreError> {
    let Some(output_directory) = action_result.output_directories.first() else {
        return Ok(EMPTY_DIRECTORY_DIGEST.clone());
    };
    let digest: Digest = protos::require_digest(output_directory.tree_digest.as_ref())?;

    if treat_tree_digest_as_final_directory_digest {
        return Ok(DirectoryDigest::from_persisted_digest(digest));
    }

    // The digest identifies a Tree proto in the remote store: fetch and persist it.
    match store.load_tree_from_remote(digest).await? {
        Some(directory_digest) => Ok(directory_digest),
        None => Err(StoreError::MissingDigest(
            "Could not fetch the output Tree".to_owned(),
            digest,
        )),
    }
}

///
/// Convert a local process result into an ActionResult proto for persistence in the process
/// cache or the remote action cache.
///
pub async fn make_action_result(
    store: &Store,
    result: &FallibleProcessResultWithPlatform,
) -> Result<remexec::ActionResult, StoreError> {
    // Ensure that the process output is persisted before the ActionResult refers to it.
    store
        .ensure_directory_digest_persisted(result.output_directory.clone())
        .await?;

    Ok(remexec::ActionResult {
        exit_code: result.exit_code,
        output_directories: vec![remexec::OutputDirectory {
            path: String::new(),
            tree_digest: Some((&result.output_directory.as_digest()).into()),
            is_topologically_sorted: false,
        }],
        stdout_digest: Some((&result.stdout_digest).into()),
        stderr_digest: Some((&result.stderr_digest).into()),
        ..remexec::ActionResult::default()
    })
}

///
/// The bytes of stdout or stderr for a completed process, loaded from the store.
///
pub async fn load_stdio(
    store: &Store,
    result: &FallibleProcessResultWithPlatform,
) -> Result<(Bytes, Bytes), StoreError> {
    let stdout = store
        .load_file_bytes_with(result.stdout_digest, Bytes::copy_from_slice)
        .await?;
    let stderr = store
        .load_file_bytes_with(result.stderr_digest, Bytes::copy_from_slice)
        .await?;
    Ok((stdout, stderr))
}
