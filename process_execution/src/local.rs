// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::BTreeSet;
use std::fmt::{self, Debug};
use std::fs::create_dir_all;
use std::io::Write;
use std::ops::Neg;
use std::os::unix::fs::{symlink, OpenOptionsExt};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use fs::{
    GitignoreStyleExcludes, GlobExpansionConjunction, GlobMatching, PathGlobs, Permissions,
    RelativePath, StrictGlobMatching, SymlinkBehavior,
};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use futures::{try_join, FutureExt, TryFutureExt};
use log::debug;
use shell_quote::{Bash, QuoteRefExt};
use store::{ImmutableInputs, OneOffStoreFileByDigest, Snapshot, Store};
use task_executor::Executor;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};
use tokio_util::codec::{BytesCodec, FramedRead};
use workunit_store::{in_workunit, Metric, RunningWorkunit};

use crate::{
    Context, FallibleProcessResultWithPlatform, ManagedChild, NamedCaches, Platform, Process,
    ProcessError, ProcessExecutionEnvironment, ProcessExecutionStrategy, ProcessResultMetadata,
    ProcessResultSource,
};

pub const USER_EXECUTABLE_MODE: u32 = 0o100755;

// The maximum number of bytes of stdout or stderr retained in memory: if a process produces
// more, the head is discarded and only the tail is persisted.
const MAX_CAPTURED_STDIO_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum KeepSandboxes {
    Always,
    Never,
    OnFailure,
}

pub struct CommandRunner {
    pub store: Store,
    executor: Executor,
    work_dir_base: PathBuf,
    named_caches: NamedCaches,
    immutable_inputs: ImmutableInputs,
    keep_sandboxes: KeepSandboxes,
    spawn_lock: Arc<RwLock<()>>,
}

impl CommandRunner {
    pub fn new(
        store: Store,
        executor: Executor,
        work_dir_base: PathBuf,
        named_caches: NamedCaches,
        immutable_inputs: ImmutableInputs,
        keep_sandboxes: KeepSandboxes,
    ) -> CommandRunner {
        CommandRunner {
            store,
            executor,
            work_dir_base,
            named_caches,
            immutable_inputs,
            keep_sandboxes,
            spawn_lock: Arc::new(RwLock::new(())),
        }
    }

    pub fn named_caches(&self) -> &NamedCaches {
        &self.named_caches
    }

    pub fn immutable_inputs(&self) -> &ImmutableInputs {
        &self.immutable_inputs
    }

    async fn construct_output_snapshot(
        store: Store,
        posix_fs: Arc<fs::PosixFS>,
        output_file_paths: BTreeSet<RelativePath>,
        output_dir_paths: BTreeSet<RelativePath>,
    ) -> Result<Snapshot, String> {
        let output_paths = output_dir_paths
            .into_iter()
            .flat_map(|p| {
                let dir = PathBuf::from(p).into_os_string();
                if dir.is_empty() {
                    // Capturing the root of the workdir captures everything beneath it.
                    return vec!["**".to_owned().into()];
                }
                let mut dir_glob = dir.clone();
                dir_glob.push("/**");
                vec![dir, dir_glob]
            })
            .chain(
                output_file_paths
                    .into_iter()
                    .map(|p| PathBuf::from(p).into_os_string()),
            )
            .map(|s| {
                s.into_string()
                    .map_err(|e| format!("Error stringifying output paths: {e:?}"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let output_globs = PathGlobs::new(
            output_paths,
            StrictGlobMatching::Ignore,
            GlobExpansionConjunction::AllMatch,
        )
        .parse()?;

        let path_stats = posix_fs
            .expand_globs(output_globs, SymlinkBehavior::Aware, None)
            .map_err(|err| format!("Error expanding output globs: {err}"))
            .await?;
        Snapshot::from_path_stats(
            OneOffStoreFileByDigest::new(store, posix_fs, true),
            path_stats,
        )
        .await
    }
}

impl Debug for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("local::CommandRunner")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChildOutput {
    Stdout(Bytes),
    Stderr(Bytes),
    Exit(i32),
}

///
/// Collect the outputs of a child process, respecting the in-memory stdio cap.
///
pub async fn collect_child_outputs<'a, 'b>(
    stdout: &'a mut BytesMut,
    stderr: &'a mut BytesMut,
    mut stream: BoxStream<'b, Result<ChildOutput, String>>,
) -> Result<i32, String> {
    let mut exit_code = 1;

    while let Some(child_output_res) = stream.next().await {
        match child_output_res? {
            ChildOutput::Stdout(bytes) => append_capped(stdout, &bytes),
            ChildOutput::Stderr(bytes) => append_capped(stderr, &bytes),
            ChildOutput::Exit(code) => exit_code = code,
        };
    }

    Ok(exit_code)
}

fn append_capped(buffer: &mut BytesMut, bytes: &[u8]) {
    buffer.extend_from_slice(bytes);
    if buffer.len() > MAX_CAPTURED_STDIO_BYTES {
        let excess = buffer.len() - MAX_CAPTURED_STDIO_BYTES;
        let _head = buffer.split_to(excess);
    }
}

#[async_trait]
impl super::CommandRunner for CommandRunner {
    ///
    /// Runs a command on this machine in a fresh sandbox under the workdir base.
    ///
    async fn run(
        &self,
        context: Context,
        _workunit: &mut RunningWorkunit,
        req: Process,
    ) -> Result<FallibleProcessResultWithPlatform, ProcessError> {
        let req_debug_repr = format!("{req:#?}");
        in_workunit!(
            "run_local_process",
            req.level,
            // NB: See engine::nodes::NodeKey::workunit_level for more information on why this
            // workunit renders at the Process's level.
            desc = Some(req.description.clone()),
            |workunit| async move {
                let mut workdir = create_sandbox(
                    self.executor.clone(),
                    &self.work_dir_base,
                    &req.description,
                    self.keep_sandboxes,
                )?;

                // Start working on a mutable version of the process.
                let mut req = req;
                // Update env and argv, replacing `{chroot}` placeholders with the sandbox path.
                apply_chroot(workdir.path().to_str().unwrap(), &mut req);

                // Prepare the workdir.
                let exclusive_spawn = prepare_workdir(
                    workdir.path().to_owned(),
                    &req,
                    req.input_digests.inputs.clone(),
                    &self.store,
                    &self.named_caches,
                    &self.immutable_inputs,
                )
                .await?;

                workunit.increment_counter(Metric::LocalExecutionRequests, 1);
                // NB: The constraint on `CapturedWorkdir` is that any child processes spawned
                // here have exited (or been killed in their `Drop` handlers), so this function
                // can rely on the usual Drop order of local variables to assume that the
                // sandbox is cleaned up after the process is.
                let res = self
                    .run_and_capture_workdir(
                        req.clone(),
                        context,
                        self.store.clone(),
                        self.executor.clone(),
                        workdir.path().to_owned(),
                        (),
                        exclusive_spawn,
                    )
                    .map_err(|msg| {
                        // Processes that experience no infrastructure issues should result in
                        // an "Ok" return, potentially with an exit code that indicates that
                        // they failed (with more information on stderr). Actually failing at
                        // this level indicates a failure to start or otherwise interact with
                        // the process, which would generally be an infrastructure or
                        // implementation error (something missing from the sandbox, incorrect
                        // permissions, etc).
                        //
                        // Given that this is expected to be rare, we dump the entire process
                        // definition in the error.
                        ProcessError::Unclassified(format!(
                            "Failed to execute: {req_debug_repr}\n\n{msg}"
                        ))
                    })
                    .await;

                if self.keep_sandboxes == KeepSandboxes::Always
                    || self.keep_sandboxes == KeepSandboxes::OnFailure
                        && res.as_ref().map(|r| r.exit_code).unwrap_or(1) != 0
                {
                    workdir.keep(&req.description);
                    setup_run_sh_script(
                        workdir.path(),
                        &req.env,
                        &req.working_directory,
                        &req.argv,
                        workdir.path(),
                    )?;
                }

                res
            }
        )
        .await
    }

    async fn shutdown(&self) -> Result<(), String> {
        Ok(())
    }
}

#[async_trait]
impl CapturedWorkdir for CommandRunner {
    type WorkdirToken = ();

    async fn run_in_workdir<'s, 'c, 'w, 'r>(
        &'s self,
        _context: &'c Context,
        workdir_path: &'w Path,
        _workdir_token: (),
        req: Process,
        exclusive_spawn: bool,
    ) -> Result<BoxStream<'r, Result<ChildOutput, String>>, String> {
        let cwd = if let Some(ref working_directory) = req.working_directory {
            workdir_path.join(working_directory)
        } else {
            workdir_path.to_owned()
        };
        let mut command = Command::new(&req.argv[0]);
        command
            .env_clear()
            // It would be really nice not to have to manually set PATH but this is sadly the
            // only way to stop automatic PATH searching.
            .env("PATH", "")
            .args(&req.argv[1..])
            .current_dir(cwd)
            .envs(&req.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // See the documentation of the `CapturedWorkdir::run_in_workdir` method, but
        // `exclusive_spawn` indicates the binary we're spawning was written out by the current
        // thread, and, as such, there may be open file handles against it. This will occur
        // whenever a concurrent call of this method proceeds through its fork point while the
        // current thread is in the middle of writing the binary and thus captures a clone of
        // the open file handle, but that concurrent call has not yet gotten to its exec point
        // where the operating system will close the cloned file handle (via O_CLOEXEC being
        // set on all files opened by Rust). To prevent a race like this holding this thread's
        // binary open leading to an ETXTBSY error, we maintain an RwLock that allows
        // non-`exclusive_spawn` binaries to spawn concurrently but ensures all such concurrent
        // spawns have completed (and thus closed any cloned file handles) before proceeding to
        // spawn the `exclusive_spawn` binary this thread has written.
        //
        // See: https://github.com/golang/go/issues/22315 for an excellent description of this
        // generic unix problem.
        let mut fork_exec = move || ManagedChild::spawn(&mut command, None);
        let mut child = {
            if exclusive_spawn {
                let _write_locked = self.spawn_lock.write().await;

                // Despite the mitigations taken against racing our own forks, forks can happen
                // in our process but outside of our control (in libraries). As such, we
                // back-stop by sleeping and trying again for a while if we do hit one of these
                // fork races we do not control.
                const MAX_ETXTBSY_WAIT: Duration = Duration::from_millis(100);
                let mut retries: u32 = 0;
                let mut sleep_millis = 1;

                let start_time = Instant::now();
                loop {
                    match fork_exec() {
                        Err(e) => {
                            if e.raw_os_error() == Some(libc::ETXTBSY)
                                && start_time.elapsed() < MAX_ETXTBSY_WAIT
                            {
                                tokio::time::sleep(Duration::from_millis(sleep_millis)).await;
                                retries += 1;
                                sleep_millis *= 2;
                                continue;
                            } else if retries > 0 {
                                break Err(format!(
                                    "Error launching process after {} {} for ETXTBSY. Final \
                                    error was: {:?}",
                                    retries,
                                    if retries == 1 { "retry" } else { "retries" },
                                    e
                                ));
                            } else {
                                break Err(format!("Error launching process: {e:?}"));
                            }
                        }
                        Ok(child) => break Ok(child),
                    }
                }
            } else {
                let _read_locked = self.spawn_lock.read().await;
                fork_exec().map_err(|e| format!("Error launching process: {e:?}"))
            }
        }?;

        debug!("spawned local process as {:?} for {:?}", child.id(), req);
        let stdout_stream = FramedRead::new(child.stdout.take().unwrap(), BytesCodec::new())
            .map_ok(|bytes| ChildOutput::Stdout(bytes.into()))
            .fuse()
            .boxed();
        let stderr_stream = FramedRead::new(child.stderr.take().unwrap(), BytesCodec::new())
            .map_ok(|bytes| ChildOutput::Stderr(bytes.into()))
            .fuse()
            .boxed();
        let exit_stream = async move {
            child
                .wait()
                .map_ok(|exit_status| {
                    ChildOutput::Exit(
                        exit_status
                            .code()
                            .or_else(|| exit_status.signal().map(Neg::neg))
                            .expect("Child process should exit via returned code or signal."),
                    )
                })
                .await
        }
        .into_stream()
        .boxed();
        let result_stream =
            futures::stream::select_all(vec![stdout_stream, stderr_stream, exit_stream]);

        Ok(result_stream
            .map_err(|e| format!("Failed to consume process outputs: {e:?}"))
            .boxed())
    }
}

///
/// A CommandRunner variant which runs a process in a prepared workdir, captures its declared
/// outputs, and handles timeouts.
///
#[async_trait]
pub trait CapturedWorkdir {
    type WorkdirToken: Clone + Send + Sync;

    async fn run_and_capture_workdir(
        &self,
        req: Process,
        context: Context,
        store: Store,
        executor: Executor,
        workdir_path: PathBuf,
        workdir_token: Self::WorkdirToken,
        exclusive_spawn: bool,
    ) -> Result<FallibleProcessResultWithPlatform, String> {
        let start_time = Instant::now();
        let mut stdout = BytesMut::with_capacity(8192);
        let mut stderr = BytesMut::with_capacity(8192);

        // Spawn the process.
        //
        // NB: We fully buffer the stdout/stderr in memory (up to a cap), rather than incrementally
        // persisting them to the store: they are persisted on termination.
        let exit_code_result = {
            let exit_code_future = collect_child_outputs(
                &mut stdout,
                &mut stderr,
                self.run_in_workdir(
                    &context,
                    &workdir_path,
                    workdir_token,
                    req.clone(),
                    exclusive_spawn,
                )
                .await?,
            );
            if let Some(req_timeout) = req.timeout {
                timeout(req_timeout, exit_code_future)
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|r| r)
            } else {
                exit_code_future.await
            }
        };

        // Capture the process outputs.
        let output_snapshot = if req.output_files.is_empty() && req.output_directories.is_empty()
        {
            Snapshot::empty()
        } else {
            let root = if let Some(ref working_directory) = req.working_directory {
                workdir_path.join(working_directory)
            } else {
                workdir_path.clone()
            };
            // Use no ignore patterns, because we are looking for explicitly listed paths.
            let posix_fs = Arc::new(
                fs::PosixFS::new(root, GitignoreStyleExcludes::empty(), executor.clone())
                    .map_err(|err| {
                        format!(
                            "Error making PosixFS to fetch local process execution output files: \
                            {err}"
                        )
                    })?,
            );
            CommandRunner::construct_output_snapshot(
                store.clone(),
                posix_fs,
                req.output_files.clone(),
                req.output_directories.clone(),
            )
            .await?
        };

        let elapsed = start_time.elapsed();
        let result_metadata = ProcessResultMetadata::new(
            Some(elapsed.into()),
            ProcessResultSource::Ran,
            environment_for_local(&req)?,
            context.run_id,
        );

        let (stdout_digest, stderr_digest) = match exit_code_result {
            Err(ref timeout_msg) if timeout_msg.contains("deadline has elapsed") => {
                stderr.extend_from_slice(
                    format!(
                        "\n\nExceeded timeout of {:.1} seconds when executing local process: {}",
                        req.timeout.map(|dur| dur.as_secs_f32()).unwrap_or(-1.0),
                        req.description
                    )
                    .as_bytes(),
                );
                store_stdio(&store, &stdout, &stderr).await?
            }
            _ => store_stdio(&store, &stdout, &stderr).await?,
        };

        match exit_code_result {
            Ok(exit_code) => {
                // A successful process must have produced its declared output files: an absent
                // output is fatal to the calling rule rather than silently empty.
                if exit_code == 0 {
                    let produced = output_snapshot
                        .files()
                        .into_iter()
                        .collect::<std::collections::HashSet<_>>();
                    let missing = req
                        .output_files
                        .iter()
                        .filter(|output_file| !produced.contains(output_file.as_ref() as &Path))
                        .collect::<Vec<_>>();
                    if !missing.is_empty() {
                        return Err(format!(
                            "Process `{}` succeeded but did not produce declared output \
                            file(s): {missing:?}",
                            req.description
                        ));
                    }
                }
                Ok(FallibleProcessResultWithPlatform {
                    stdout_digest,
                    stderr_digest,
                    exit_code,
                    output_directory: output_snapshot.into(),
                    metadata: result_metadata,
                })
            }
            Err(timeout_msg) if timeout_msg.contains("deadline has elapsed") => {
                // The child has been killed by the timeout: its exit is reported as the
                // terminating signal, and the result is not cacheable (non-zero exit).
                Ok(FallibleProcessResultWithPlatform {
                    stdout_digest,
                    stderr_digest,
                    exit_code: -(libc::SIGTERM),
                    output_directory: output_snapshot.into(),
                    metadata: result_metadata,
                })
            }
            Err(msg) => Err(msg),
        }
    }

    ///
    /// Spawn the given process in the given workdir, and return a stream of its output events.
    ///
    /// The implementation of this method must guarantee that any child processes spawned have
    /// exited (or been killed in their Drop handlers) before the returned stream is dropped.
    ///
    async fn run_in_workdir<'s, 'c, 'w, 'r>(
        &'s self,
        context: &'c Context,
        workdir_path: &'w Path,
        workdir_token: Self::WorkdirToken,
        req: Process,
        exclusive_spawn: bool,
    ) -> Result<BoxStream<'r, Result<ChildOutput, String>>, String>;
}

fn environment_for_local(_req: &Process) -> Result<ProcessExecutionEnvironment, String> {
    Ok(ProcessExecutionEnvironment {
        name: None,
        platform: Platform::current()?,
        strategy_cache_value: ProcessExecutionStrategy::Local.cache_value(),
    })
}

async fn store_stdio(
    store: &Store,
    stdout: &BytesMut,
    stderr: &BytesMut,
) -> Result<(hashing::Digest, hashing::Digest), String> {
    let (stdout_digest, stderr_digest) = try_join!(
        store.store_file_bytes(Bytes::copy_from_slice(stdout), true),
        store.store_file_bytes(Bytes::copy_from_slice(stderr), true),
    )?;
    Ok((stdout_digest, stderr_digest))
}

///
/// Create a new sandbox for a process to execute in, under the given base path.
///
pub fn create_sandbox(
    executor: Executor,
    base_directory: &Path,
    description: &str,
    keep_sandboxes: KeepSandboxes,
) -> Result<AsyncDropSandbox, String> {
    let workdir = tempfile::Builder::new()
        .prefix(crate::SANDBOX_PREFIX)
        .tempdir_in(base_directory)
        .map_err(|err| format!("Error making tempdir for local process execution: {err:?}"))?;

    let (workdir_path, maybe_workdir) = if keep_sandboxes == KeepSandboxes::Always {
        // On the Always behavior we eagerly release the TempDir so that it is never deleted.
        (workdir.keep(), None)
    } else {
        (workdir.path().to_owned(), Some(workdir))
    };

    if keep_sandboxes == KeepSandboxes::Always {
        log::info!("Preserving local process execution dir {workdir_path:?} for {description}");
    }

    Ok(AsyncDropSandbox(executor, workdir_path, maybe_workdir))
}

///
/// A sandbox directory which cleans itself up on a background thread when dropped (tempdir
/// deletion is synchronous I/O, which must not run on the async runtime).
///
pub struct AsyncDropSandbox(Executor, PathBuf, Option<TempDir>);

impl AsyncDropSandbox {
    pub fn path(&self) -> &Path {
        &self.1
    }

    ///
    /// Consume the `TempDir` without deleting the directory on the filesystem, meaning that the
    /// temporary directory will no longer be automatically deleted when dropped.
    ///
    pub fn keep(&mut self, description: &str) {
        if let Some(workdir) = self.2.take() {
            let _ = workdir.keep();
            log::info!(
                "Preserving local process execution dir {:?} for {description}",
                self.1,
            );
        }
    }
}

impl Drop for AsyncDropSandbox {
    fn drop(&mut self) {
        if let Some(sandbox) = self.2.take() {
            let _background_cleanup = self.0.native_spawn_blocking(|| std::mem::drop(sandbox));
        }
    }
}

///
/// Apply the `{chroot}` replacement to all environment variables and argv members.
///
pub fn apply_chroot(chroot_path: &str, req: &mut Process) {
    for value in req.env.values_mut() {
        if value.contains("{chroot}") {
            *value = value.replace("{chroot}", chroot_path);
        }
    }
    for value in &mut req.argv {
        if value.contains("{chroot}") {
            *value = value.replace("{chroot}", chroot_path);
        }
    }
}

///
/// Prepares the given workdir for use by the given Process.
///
/// Returns true if the executable for the Process was created in the workdir, indicating that
/// `exclusive_spawn` is required.
///
pub async fn prepare_workdir(
    workdir_path: PathBuf,
    req: &Process,
    materialized_input_digest: fs::DirectoryDigest,
    store: &Store,
    named_caches: &NamedCaches,
    immutable_inputs: &ImmutableInputs,
) -> Result<bool, ProcessError> {
    // Collect the symlinks to create for immutable inputs and for named caches, and the
    // parent directories of declared outputs.
    let mut workdir_symlinks = immutable_inputs
        .local_paths(&req.input_digests.immutable_inputs)
        .await?;
    workdir_symlinks.extend(named_caches.paths(&req.append_only_caches).await?);

    // Capture argv0 as the executable path so that we can test whether we have created it in
    // the sandbox.
    let maybe_executable_path = {
        let mut executable_path = PathBuf::from(&req.argv[0]);
        if executable_path.is_relative() {
            if let Some(working_directory) = &req.working_directory {
                executable_path = working_directory.as_ref().join(executable_path)
            }
            Some(workdir_path.join(executable_path))
        } else {
            None
        }
    };

    // Materialize the inputs.
    store
        .materialize_directory(
            workdir_path.clone(),
            materialized_input_digest,
            Permissions::Writable,
        )
        .await?;

    let workdir_path2 = workdir_path.clone();
    let output_file_paths = req.output_files.clone();
    let output_dir_paths = req.output_directories.clone();
    let working_directory = req.working_directory.clone();
    let jdk_home = req.jdk_home.clone();
    let exists = tokio::task::spawn_blocking(move || {
        // Create the symlinks.
        for workdir_symlink in workdir_symlinks {
            let src = workdir_path2.join(&workdir_symlink.src);
            if let Some(parent) = src.parent() {
                create_dir_all(parent).map_err(|err| {
                    format!("Error making parent dir for symlink {src:?}: {err:?}")
                })?;
            }
            symlink(&workdir_symlink.dst, &src).map_err(|err| {
                format!(
                    "Error linking {src:?} -> {:?}: {err:?}",
                    workdir_symlink.dst
                )
            })?;
        }

        // Create the JDK symlink if requested.
        if let Some(jdk_home) = jdk_home {
            symlink(&jdk_home, workdir_path2.join(".jdk"))
                .map_err(|err| format!("Error making JDK symlink for local execution: {err:?}"))?;
        }

        // Create the parent directories of declared outputs.
        let workdir_with_cwd = match working_directory {
            Some(ref cwd) => workdir_path2.join(cwd),
            None => workdir_path2.clone(),
        };
        // The process may or may not be run from its working_directory: create it either way.
        create_dir_all(&workdir_with_cwd)
            .map_err(|err| format!("Error making working directory: {err:?}"))?;
        for output in output_file_paths.iter().chain(output_dir_paths.iter()) {
            if let Some(parent) = output.as_ref().parent() {
                create_dir_all(workdir_with_cwd.join(parent)).map_err(|err| {
                    format!("Error making parent dirs for output {output:?}: {err:?}")
                })?;
            }
        }

        let exe_was_materialized = maybe_executable_path
            .as_ref()
            .map(|path| path.exists())
            .unwrap_or(false);
        Ok::<_, String>(exe_was_materialized)
    })
    .await
    .map_err(|e| format!("Sandbox preparation task failed: {e}"))??;

    Ok(exists)
}

///
/// Creates an optionally-executable script at `{workdir_path}/__run.sh` which can be used to
/// re-execute the process in its sandbox.
///
pub fn setup_run_sh_script(
    sandbox_path: &Path,
    env: &std::collections::BTreeMap<String, String>,
    working_directory: &Option<RelativePath>,
    argv: &[String],
    workdir_path: &Path,
) -> Result<(), String> {
    let mut env_var_strings: Vec<String> = vec![];
    for (key, value) in env.iter() {
        let quoted_arg: String = value.quoted(Bash);
        let env_var_string = format!("{key}={quoted_arg}");
        env_var_strings.push(env_var_string);
    }
    let stringified_env_vars: String = env_var_strings.join(" ");

    // Shell-quote every command-line argument.
    let mut full_command_line: Vec<String> = vec![];
    for arg in argv.iter() {
        let quoted_arg: String = arg.quoted(Bash);
        full_command_line.push(quoted_arg);
    }

    let stringified_cwd = {
        let cwd = if let Some(ref working_directory) = working_directory {
            workdir_path.join(working_directory)
        } else {
            workdir_path.to_owned()
        };
        let quoted_cwd: String = cwd.as_os_str().to_string_lossy().to_string().quoted(Bash);
        format!("cd {quoted_cwd} && ")
    };

    let stringified_command_line: String = full_command_line.join(" ");
    let full_script = format!(
        "#!/bin/bash\n\
        # This command line should execute the same process as pants did internally.\n\
        export {stringified_env_vars}\n\
        \n\
        {stringified_cwd}{stringified_command_line}\n",
    );

    let full_file_path = sandbox_path.join("__run.sh");

    std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(USER_EXECUTABLE_MODE) // Executable for user, read-only for others.
        .open(full_file_path)
        .map_err(|err| format!("Error making run script: {err:?}"))?
        .write_all(full_script.as_bytes())
        .map_err(|err| format!("Error writing run script: {err:?}"))
}
