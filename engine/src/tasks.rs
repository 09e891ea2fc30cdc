// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::hash;
use std::sync::Arc;

use futures::future::BoxFuture;
use rule_graph::{DependencyKey, Query};

use crate::core::{Failure, TypeId, Value};
use crate::nodes::TaskContext;

///
/// The function body of a task rule: an async Rust function from its TaskContext (which
/// provides its params and the ability to issue gets) to its product Value.
///
pub type RuleFn =
    Arc<dyn Fn(TaskContext) -> BoxFuture<'static, Result<Value, Failure>> + Send + Sync>;

///
/// A registered task rule.
///
#[derive(Clone)]
pub struct Task {
    pub id: String,
    pub product: TypeId,
    pub params: Vec<TypeId>,
    pub gets: Vec<DependencyKey<TypeId>>,
    pub cacheable: bool,
    pub func: RuleFn,
}

// NB: The function pointer is not comparable: a Task's identity is its id, which registration
// requires to be unique.
impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Task {}

impl hash::Hash for Task {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("product", &self.product)
            .field("params", &self.params)
            .field("gets", &self.gets)
            .field("cacheable", &self.cacheable)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "@rule({}({}) -> {})", self.id, self
            .params
            .iter()
            .map(|p| format!("{p}"))
            .collect::<Vec<_>>()
            .join(", "), self.product)
    }
}

///
/// A rule provided by the engine itself (process execution, snapshot capture, etc): the
/// scheduler knows how to invoke each of these natively.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Intrinsic {
    pub id: &'static str,
    pub product: TypeId,
    pub inputs: Vec<DependencyKey<TypeId>>,
}

impl fmt::Display for Intrinsic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "@intrinsic({} -> {})", self.id, self.product)
    }
}

///
/// The sum of the rule kinds the scheduler can invoke: a flat variant rather than a trait
/// object, so that dispatch sites are a match.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Rule {
    Task(Arc<Task>),
    Intrinsic(Arc<Intrinsic>),
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Rule::Task(task) => write!(f, "{task}"),
            Rule::Intrinsic(intrinsic) => write!(f, "{intrinsic}"),
        }
    }
}

impl rule_graph::Rule for Rule {
    type TypeId = TypeId;

    fn product(&self) -> TypeId {
        match self {
            Rule::Task(task) => task.product,
            Rule::Intrinsic(intrinsic) => intrinsic.product,
        }
    }

    fn param_types(&self) -> Vec<TypeId> {
        match self {
            Rule::Task(task) => task.params.clone(),
            Rule::Intrinsic(_) => vec![],
        }
    }

    fn dependency_keys(&self) -> Vec<DependencyKey<TypeId>> {
        match self {
            Rule::Task(task) => task.gets.clone(),
            Rule::Intrinsic(intrinsic) => intrinsic.inputs.clone(),
        }
    }

    fn id(&self) -> String {
        match self {
            Rule::Task(task) => task.id.clone(),
            Rule::Intrinsic(intrinsic) => intrinsic.id.to_owned(),
        }
    }

    fn require_reachable(&self) -> bool {
        match self {
            Rule::Task(_) => true,
            Rule::Intrinsic(_) => false,
        }
    }
}

///
/// Registry of the rules and queries the engine will serve: constructed by the embedding
/// driver before `Core::new`, and immutable afterwards.
///
/// Defines a nested builder for partial (task) rules.
///
#[derive(Default)]
pub struct Tasks {
    rules: Vec<Rule>,
    queries: Vec<Query<TypeId>>,
    // The task currently being built, if any.
    preparing: Option<Task>,
}

impl Tasks {
    pub fn new() -> Tasks {
        Tasks::default()
    }

    pub fn rules(&self) -> &Vec<Rule> {
        &self.rules
    }

    pub fn queries(&self) -> &Vec<Query<TypeId>> {
        &self.queries
    }

    ///
    /// The following methods define the Task registration lifecycle.
    ///
    pub fn task_begin(&mut self, id: String, product: TypeId, cacheable: bool, func: RuleFn) {
        assert!(
            self.preparing.is_none(),
            "Must `task_end` the previous task creation before beginning a new one!"
        );

        self.preparing = Some(Task {
            id,
            product,
            params: Vec::new(),
            gets: Vec::new(),
            cacheable,
            func,
        });
    }

    pub fn add_get(&mut self, product: TypeId, provided_params: Vec<TypeId>) {
        let task = self
            .preparing
            .as_mut()
            .expect("Must `task_begin` before adding gets!");
        task.gets
            .push(DependencyKey::new_with_params(product, provided_params));
    }

    pub fn add_parameter(&mut self, param: TypeId) {
        let task = self
            .preparing
            .as_mut()
            .expect("Must `task_begin` before adding parameters!");
        task.params.push(param);
    }

    pub fn task_end(&mut self) {
        let task = self
            .preparing
            .take()
            .expect("Must `task_begin` before ending it!");
        self.rules.push(Rule::Task(Arc::new(task)));
    }

    ///
    /// Registers the given intrinsic rules.
    ///
    pub fn intrinsics_set(&mut self, intrinsics: &[Intrinsic]) {
        for intrinsic in intrinsics {
            self.rules.push(Rule::Intrinsic(Arc::new(intrinsic.clone())));
        }
    }

    ///
    /// Registers a Query, which roots the rule graph at the given product and param types.
    ///
    pub fn query_add(&mut self, product: TypeId, params: Vec<TypeId>) {
        self.queries.push(Query::new(product, params));
    }
}
