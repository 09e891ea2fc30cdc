// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use graph::Context;
use rule_graph::DependencyKey;

use super::{select, NodeKey, NodeResult};
use crate::core::{throw, Params, TypeId, Value};

///
/// A root of a session: a demand for a product under a parameter tuple, resolved via the
/// installed Queries.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Root {
    pub params: Params,
    pub product: TypeId,
}

impl Root {
    pub fn new(params: Params, product: TypeId) -> Root {
        Root { params, product }
    }

    pub(super) async fn run_node(self, context: Context<NodeKey>) -> NodeResult<Value> {
        let (entry, edges) = context
            .core
            .rule_graph
            .find_root(self.params.type_ids(), self.product)
            .map_err(throw)?;

        let dependency_key = DependencyKey::new(self.product);
        let chosen = edges.entry_for(&dependency_key).ok_or_else(|| {
            throw(format!(
                "Found no source of {} for {entry:?}",
                self.product
            ))
        })?;

        select(context, self.params, chosen.into())
            .await
            .map_err(|failure| failure.with_pushed_frame(&format!("Root({})", self.product)))
    }
}
