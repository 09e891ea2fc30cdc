// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

pub mod context;
pub mod core;
pub mod intrinsics;
pub mod nodes;
pub mod scheduler;
pub mod session;
pub mod tasks;
pub mod types;

#[cfg(test)]
mod tests;

pub use crate::context::{Context, Core, ExecutionStrategyOptions, LocalStoreOptions, SessionCore};
pub use crate::core::{throw, Failure, Key, Params, TypeId, Value};
pub use crate::nodes::{NodeKey, Root};
pub use crate::scheduler::{ExecutionRequest, ExecutionTermination, Scheduler};
pub use crate::session::Session;
pub use crate::tasks::{Intrinsic, Rule, Tasks};
pub use crate::types::Types;
