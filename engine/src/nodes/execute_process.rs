// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::hash;

use graph::Context;
use process_execution::{self, FallibleProcessResultWithPlatform, Process};
use workunit_store::RunningWorkunit;

use super::{NodeKey, NodeResult};

///
/// A Node that represents the execution of a sandboxed process. Identity (and thus the graph's
/// at-most-one-in-flight guarantee) is by the full process description: any number of
/// concurrent demands for one description share a single launch.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ExecuteProcess {
    pub process: Process,
}

impl ExecuteProcess {
    pub(super) async fn run_node(
        self,
        context: Context<NodeKey>,
        workunit: &mut RunningWorkunit,
    ) -> NodeResult<ProcessResult> {
        let request = self.process;
        let core = context.core.clone();
        let session = context.session.clone();

        let execution_context = process_execution::Context::new(
            session.workunit_store(),
            session.build_id().to_owned(),
            context.run_id(),
        );

        let command_runner = core.command_runner.clone();
        let res = command_runner
            .run(execution_context, workunit, request.clone())
            .await?;

        // Lease the outputs of the process for as long as this node retains its value.
        core.store().lease_all(
            res.output_directory
                .digests()
                .into_iter()
                .chain([res.stdout_digest, res.stderr_digest]),
        );

        Ok(ProcessResult { result: res })
    }
}

///
/// The result of running a process, as the engine's product type.
///
/// NB: Equality is by the observable outputs (exit code and output digests), not by timing
/// metadata, which is what makes a re-run with identical outputs invisible to dependents.
///
#[derive(Clone, Debug)]
pub struct ProcessResult {
    pub result: FallibleProcessResultWithPlatform,
}

impl PartialEq for ProcessResult {
    fn eq(&self, other: &Self) -> bool {
        self.result.exit_code == other.result.exit_code
            && self.result.stdout_digest == other.result.stdout_digest
            && self.result.stderr_digest == other.result.stderr_digest
            && self.result.output_directory == other.result.output_directory
    }
}

impl Eq for ProcessResult {}

impl hash::Hash for ProcessResult {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.result.exit_code.hash(state);
        self.result.stdout_digest.hash(state);
        self.result.stderr_digest.hash(state);
        self.result.output_directory.hash(state);
    }
}
