// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::fmt::{self, Debug};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_oncecell::OnceCell;
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, LogOutput, RemoveContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::service::HostConfig;
use bollard::Docker;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use futures::{FutureExt, TryFutureExt};
use log::debug;
use store::{ImmutableInputs, Store};
use task_executor::Executor;
use workunit_store::{in_workunit, Metric, RunningWorkunit};

use crate::local::{
    apply_chroot, create_sandbox, prepare_workdir, CapturedWorkdir, ChildOutput, KeepSandboxes,
};
use crate::{
    Context, FallibleProcessResultWithPlatform, NamedCaches, Process, ProcessError,
    ProcessExecutionStrategy,
};

///
/// The absolute path at which a process's sandbox is bind-mounted within its container.
///
/// The named-cache and immutable-input bases are additionally mounted at their host paths, so
/// that the symlinks created while preparing the sandbox resolve inside the container as well.
///
pub const SANDBOX_BASE_PATH_IN_CONTAINER: &str = "/pants-sandbox";

///
/// A command runner which executes processes in containers of their requested images.
///
pub struct CommandRunner {
    store: Store,
    executor: Executor,
    docker: Arc<OnceCell<Docker>>,
    work_dir_base: PathBuf,
    named_caches: NamedCaches,
    immutable_inputs: ImmutableInputs,
    keep_sandboxes: KeepSandboxes,
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
            docker: Arc::new(OnceCell::new()),
            work_dir_base,
            named_caches,
            immutable_inputs,
            keep_sandboxes,
        }
    }

    async fn docker(&self) -> Result<&Docker, String> {
        self.docker
            .get_or_try_init(async {
                let docker = Docker::connect_with_local_defaults()
                    .map_err(|err| format!("Failed to connect to the Docker daemon: {err:?}"))?;
                docker
                    .ping()
                    .await
                    .map_err(|err| format!("Failed to ping the Docker daemon: {err:?}"))?;
                Ok(docker)
            })
            .await
    }

    ///
    /// Pull the given image if it is not already present locally.
    ///
    async fn ensure_image(&self, image: &str) -> Result<(), String> {
        let docker = self.docker().await?;
        if docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        debug!("Pulling Docker image: {image}");
        let mut pull_stream = docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..CreateImageOptions::default()
            }),
            None,
            None,
        );
        while let Some(event) = pull_stream.next().await {
            event.map_err(|err| format!("Failed to pull Docker image {image}: {err:?}"))?;
        }
        Ok(())
    }
}

impl Debug for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("docker::CommandRunner")
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl super::CommandRunner for CommandRunner {
    async fn run(
        &self,
        context: Context,
        _workunit: &mut RunningWorkunit,
        req: Process,
    ) -> Result<FallibleProcessResultWithPlatform, ProcessError> {
        let req_debug_repr = format!("{req:#?}");
        in_workunit!(
            "run_local_process_via_docker",
            req.level,
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
                // Update env and argv, replacing `{chroot}` placeholders with the in-container
                // sandbox path.
                let sandbox_path_in_container = Path::new(SANDBOX_BASE_PATH_IN_CONTAINER)
                    .to_str()
                    .unwrap()
                    .to_owned();
                apply_chroot(&sandbox_path_in_container, &mut req);

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

                let res = self
                    .run_and_capture_workdir(
                        req.clone(),
                        context,
                        self.store.clone(),
                        self.executor.clone(),
                        workdir.path().to_owned(),
                        sandbox_path_in_container,
                        exclusive_spawn,
                    )
                    .map_err(|msg| {
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
    // The path at which the sandbox is mounted within the container.
    type WorkdirToken = String;

    async fn run_in_workdir<'s, 'c, 'w, 'r>(
        &'s self,
        _context: &'c Context,
        workdir_path: &'w Path,
        workdir_token: String,
        req: Process,
        _exclusive_spawn: bool,
    ) -> Result<BoxStream<'r, Result<ChildOutput, String>>, String> {
        let ProcessExecutionStrategy::Docker(ref image) = req.execution_strategy else {
            return Err(
                "The docker runner was used for a Process which does not declare an image."
                    .to_owned(),
            );
        };
        self.ensure_image(image).await?;
        let docker = self.docker().await?.clone();

        let working_dir = {
            let mut dir = PathBuf::from(&workdir_token);
            if let Some(ref working_directory) = req.working_directory {
                dir = dir.join(working_directory);
            }
            dir.to_str().unwrap().to_owned()
        };

        // The sandbox is bind-mounted into the container, along with the named cache and
        // immutable input bases (at their host paths, so that sandbox symlinks resolve).
        let binds = vec![
            format!("{}:{}", workdir_path.display(), workdir_token),
            format!(
                "{0}:{0}",
                self.named_caches.base_path().display()
            ),
            format!("{0}:{0}", self.immutable_inputs.workdir().display()),
        ];

        let config = Config {
            image: Some(image.clone()),
            cmd: Some(req.argv.clone()),
            env: Some(
                req.env
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect(),
            ),
            working_dir: Some(working_dir),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                binds: Some(binds),
                init: Some(true),
                ..HostConfig::default()
            }),
            ..Config::default()
        };

        let container = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: format!("pants-sandbox-{}", uuid::Uuid::new_v4()),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|err| format!("Failed to create Docker container: {err:?}"))?;
        let container_id = container.id;
        debug!("Created Docker container {container_id} for {:?}", req.description);

        let attach = docker
            .attach_container(
                &container_id,
                Some(AttachContainerOptions::<String> {
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    ..AttachContainerOptions::default()
                }),
            )
            .await
            .map_err(|err| format!("Failed to attach to Docker container: {err:?}"))?;

        docker
            .start_container::<String>(&container_id, None)
            .await
            .map_err(|err| format!("Failed to start Docker container: {err:?}"))?;

        let output_stream = attach
            .output
            .filter_map(|output| async move {
                match output {
                    Ok(LogOutput::StdOut { message }) => Some(Ok(ChildOutput::Stdout(message))),
                    Ok(LogOutput::StdErr { message }) => Some(Ok(ChildOutput::Stderr(message))),
                    Ok(_) => None,
                    Err(err) => Some(Err(format!("Failed to read container output: {err:?}"))),
                }
            })
            .boxed();

        let docker2 = docker.clone();
        let container_id2 = container_id.clone();
        let exit_stream = async move {
            let exit_code = docker2
                .wait_container(&container_id2, None::<WaitContainerOptions<String>>)
                .map_err(|err| format!("Failed to wait for Docker container: {err:?}"))
                .try_fold(0i64, |_, response| async move { Ok(response.status_code) })
                .await;

            // The container is one-shot: remove it regardless of the outcome.
            let _ = docker2
                .remove_container(
                    &container_id2,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..RemoveContainerOptions::default()
                    }),
                )
                .await;

            exit_code.map(|code| ChildOutput::Exit(code as i32))
        }
        .into_stream()
        .boxed();

        Ok(futures::stream::select(output_stream, exit_stream).boxed())
    }
}
