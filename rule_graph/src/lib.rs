// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

mod builder;
mod rules;
#[cfg(test)]
mod tests;

use std::fmt;

use fnv::FnvHashMap as HashMap;
use internment::Intern;

pub use crate::builder::Builder;
pub use crate::rules::{DependencyKey, ParamTypes, Query, Rule, TypeId};

///
/// A node in the resolved graph: either a rule applied under a set of in-scope parameter types,
/// a root query, or a parameter consumed directly.
///
#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub enum Entry<R: Rule> {
    Param(R::TypeId),
    WithDeps(Intern<EntryWithDeps<R>>),
}

#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub enum EntryWithDeps<R: Rule> {
    Root(RootEntry<R>),
    Rule(RuleEntry<R>),
}

impl<R: Rule> EntryWithDeps<R> {
    pub fn rule(&self) -> Option<R> {
        match self {
            EntryWithDeps::Rule(RuleEntry { rule, .. }) => Some(rule.clone()),
            EntryWithDeps::Root(_) => None,
        }
    }

    pub fn params(&self) -> &ParamTypes<R::TypeId> {
        match self {
            EntryWithDeps::Rule(ref re) => &re.params,
            EntryWithDeps::Root(ref re) => &re.query.params,
        }
    }
}

#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub struct RootEntry<R: Rule> {
    pub query: Query<R::TypeId>,
}

#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub struct RuleEntry<R: Rule> {
    pub params: ParamTypes<R::TypeId>,
    pub rule: R,
}

impl<R: Rule> RuleEntry<R> {
    pub fn rule(&self) -> &R {
        &self.rule
    }
}

///
/// The chosen dependency bindings for one entry: one target Entry per DependencyKey declared by
/// the entry's rule (or query).
///
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct RuleEdges<R: Rule> {
    dependencies: HashMap<DependencyKey<R::TypeId>, Entry<R>>,
}

impl<R: Rule> RuleEdges<R> {
    pub fn entry_for(&self, dependency_key: &DependencyKey<R::TypeId>) -> Option<Entry<R>> {
        self.dependencies.get(dependency_key).cloned()
    }

    pub fn all_dependencies(&self) -> impl Iterator<Item = &Entry<R>> {
        self.dependencies.values()
    }
}

// NB: We can't derive this due to https://github.com/rust-lang/rust/issues/26925, which
// unnecessarily requires `Rule: Default`.
impl<R: Rule> Default for RuleEdges<R> {
    fn default() -> Self {
        RuleEdges {
            dependencies: HashMap::default(),
        }
    }
}

type RuleDependencyEdges<R> = HashMap<Intern<EntryWithDeps<R>>, RuleEdges<R>>;

///
/// A diagnostic for a failed resolution: the in-scope params, the reason, and any partial
/// candidates.
///
#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub struct Diagnostic<T: TypeId> {
    pub params: ParamTypes<T>,
    pub reason: String,
}

///
/// A graph mapping rules to their dependencies: constructed once at startup and immutable for
/// the life of the process.
///
#[derive(Debug)]
pub struct RuleGraph<R: Rule> {
    queries: Vec<Query<R::TypeId>>,
    rule_dependency_edges: RuleDependencyEdges<R>,
}

// NB: We can't derive this due to https://github.com/rust-lang/rust/issues/26925, which
// unnecessarily requires `Rule: Default`.
impl<R: Rule> Default for RuleGraph<R> {
    fn default() -> Self {
        RuleGraph {
            queries: Vec::default(),
            rule_dependency_edges: RuleDependencyEdges::default(),
        }
    }
}

impl<R: Rule> RuleGraph<R> {
    pub fn new(
        rules: Vec<R>,
        queries: Vec<Query<R::TypeId>>,
    ) -> Result<RuleGraph<R>, String> {
        Builder::new(rules, queries).graph()
    }

    ///
    /// Find the root edges for the given param types and product.
    ///
    pub fn find_root(
        &self,
        param_inputs: impl IntoIterator<Item = R::TypeId>,
        product: R::TypeId,
    ) -> Result<(Entry<R>, RuleEdges<R>), String> {
        let params: ParamTypes<R::TypeId> = param_inputs.into_iter().collect();

        // Attempt to find an exact match.
        let maybe_root = self.rule_dependency_edges.iter().find(|(entry, _)| {
            if let EntryWithDeps::Root(ref root) = entry.as_ref() {
                root.query.product == product && root.query.params == params
            } else {
                false
            }
        });
        if let Some((entry, edges)) = maybe_root {
            return Ok((
                Entry::WithDeps(*entry),
                edges.clone(),
            ));
        }

        // Otherwise, scan for any root whose params are a subset of the given params.
        let subset_matches = self
            .rule_dependency_edges
            .iter()
            .filter_map(|(entry, edges)| match entry.as_ref() {
                EntryWithDeps::Root(ref root)
                    if root.query.product == product
                        && root.query.params.is_subset(&params) =>
                {
                    Some((entry, edges))
                }
                _ => None,
            })
            .collect::<Vec<_>>();

        match subset_matches.len() {
            1 => {
                let (entry, edges) = subset_matches[0];
                Ok((Entry::WithDeps(*entry), edges.clone()))
            }
            0 => Err(format!(
                "No installed Queries can compute {product} given input Params({}). The installed \
                Queries are: {}",
                params_str(&params),
                self.queries
                    .iter()
                    .map(|q| format!("{q}"))
                    .collect::<Vec<_>>()
                    .join(", "),
            )),
            _ => Err(format!(
                "More than one installed Query matched the given input Params({}): {:?}",
                params_str(&params),
                subset_matches
                    .iter()
                    .map(|(entry, _)| format!("{:?}", entry.as_ref()))
                    .collect::<Vec<_>>()
            )),
        }
    }

    ///
    /// Returns the RuleEdges for the given entry, if it exists in the graph.
    ///
    pub fn edges_for_inner(&self, entry: &Entry<R>) -> Option<RuleEdges<R>> {
        if let Entry::WithDeps(ref e) = entry {
            self.rule_dependency_edges.get(e).cloned()
        } else {
            // Rules have no dependencies.
            None
        }
    }

    ///
    /// Validates that all rules which were required to be reachable are reachable from some
    /// query.
    ///
    pub fn validate_reachability(&self, all_rules: &[R]) -> Result<(), String> {
        let reachable: std::collections::HashSet<String> = self
            .rule_dependency_edges
            .keys()
            .filter_map(|entry| entry.as_ref().rule().map(|r| r.id()))
            .collect();

        let unreachable: Vec<String> = all_rules
            .iter()
            .filter(|rule| rule.require_reachable() && !reachable.contains(&rule.id()))
            .map(|rule| rule.id())
            .collect();

        if unreachable.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "The following rules were not reachable from any Query, either because no rules \
                could produce their params or because they were shadowed by more specific rules: \
                {unreachable:?}"
            ))
        }
    }

    pub fn queries(&self) -> &[Query<R::TypeId>] {
        &self.queries
    }

    ///
    /// All of the entries in the graph, for introspection.
    ///
    pub fn entry_count(&self) -> usize {
        self.rule_dependency_edges.len()
    }
}

pub(crate) fn params_str<T: TypeId>(params: &ParamTypes<T>) -> String {
    T::display(params.iter().cloned())
}

pub fn entry_str<R: Rule>(entry: &Entry<R>) -> String {
    match entry {
        Entry::WithDeps(e) => match e.as_ref() {
            EntryWithDeps::Rule(RuleEntry { rule, params }) => {
                format!("{rule} for {}", params_str(params))
            }
            EntryWithDeps::Root(root) => format!(
                "Query({} for {})",
                root.query.product,
                params_str(&root.query.params)
            ),
        },
        Entry::Param(type_id) => format!("Param({type_id})"),
    }
}

impl<R: Rule> fmt::Display for RuleGraph<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RuleGraph {{")?;
        let mut entries = self
            .rule_dependency_edges
            .iter()
            .map(|(entry, edges)| {
                let mut deps = edges
                    .dependencies
                    .iter()
                    .map(|(key, dep)| format!("    {key} -> {}", entry_str(dep)))
                    .collect::<Vec<_>>();
                deps.sort();
                format!(
                    "  {}:\n{}",
                    entry_str(&Entry::WithDeps(*entry)),
                    deps.join("\n")
                )
            })
            .collect::<Vec<_>>();
        entries.sort();
        writeln!(f, "{}", entries.join("\n"))?;
        writeln!(f, "}}")
    }
}
