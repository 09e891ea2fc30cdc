// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use workunit_store::{in_workunit, Level, RunningWorkunit};

use crate::{Context, FallibleProcessResultWithPlatform, Process, ProcessError};

///
/// A CommandRunner wrapper which limits the number of concurrent requests: one permit is held
/// for the lifetime of each launched process. The permit number is exposed to the process via
/// its `execution_slot_variable`, if it declares one.
///
#[derive(Clone)]
pub struct CommandRunner {
    inner: Arc<dyn crate::CommandRunner>,
    sema: Arc<Semaphore>,
    total_concurrency: usize,
}

impl CommandRunner {
    pub fn new(inner: Box<dyn crate::CommandRunner>, bound: usize) -> CommandRunner {
        CommandRunner {
            inner: inner.into(),
            sema: Arc::new(Semaphore::new(bound)),
            total_concurrency: bound,
        }
    }
}

impl Debug for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("bounded::CommandRunner")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl crate::CommandRunner for CommandRunner {
    async fn run(
        &self,
        context: Context,
        workunit: &mut RunningWorkunit,
        mut process: Process,
    ) -> Result<FallibleProcessResultWithPlatform, ProcessError> {
        log::debug!(
            "Acquiring a concurrency permit for {} (of {} permits)",
            process.description,
            self.total_concurrency,
        );
        let semaphore_acquisition = self.sema.acquire();
        let permit = in_workunit!(
            "acquire_command_runner_slot",
            // NB: The UI uses the presence of a blocked workunit below a parent as an
            // indication that the parent is blocked.
            Level::Trace,
            |workunit| async move {
                let _blocking_token = workunit.blocking();
                semaphore_acquisition.await
            }
        )
        .await
        .map_err(|e| format!("Failed to acquire a concurrency permit: {e}"))?;

        // The permit id is stable for the lifetime of the semaphore and serves as the
        // execution slot number.
        if let Some(execution_slot_env_var) = &process.execution_slot_variable {
            let slot = self.total_concurrency - self.sema.available_permits() - 1;
            process.env.insert(
                execution_slot_env_var.clone(),
                format!("{slot}"),
            );
        }

        let result = self.inner.run(context, workunit, process).await;
        std::mem::drop(permit);
        result
    }

    async fn shutdown(&self) -> Result<(), String> {
        self.inner.shutdown().await
    }
}
