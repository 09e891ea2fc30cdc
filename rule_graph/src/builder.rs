// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;

use fnv::FnvHashSet as HashSet;
use internment::Intern;
use itertools::Itertools;

use crate::rules::{DependencyKey, ParamTypes, Query, Rule, TypeId};
use crate::{params_str, Entry, EntryWithDeps, RootEntry, RuleEdges, RuleEntry, RuleGraph};

///
/// Given the registered rules and the root queries, resolve the unique dependency binding for
/// every reachable `(rule, parameter types)` entry.
///
/// For each dependency key of each entry:
///   1. the available parameter types are the entry's parameters plus any parameters provided
///      by the key (parameters flow in, never out);
///   2. candidate rules are those producing the requested product whose declared parameters
///      are a subset of the available set (an available parameter may also satisfy the product
///      directly);
///   3. zero candidates fail with a diagnostic listing the requested product, the in-scope
///      types, and the types required by the eliminated candidates;
///   4. of multiple candidates, the one whose parameter set is a strict superset of every other
///      candidate's is chosen as most specific; an unresolvable tie is an error.
///
/// The search is typed: rule names never participate. All iteration orders are total and
/// stable, so construction is deterministic for a given registry and set of queries.
///
pub struct Builder<R: Rule> {
    rules_by_product: BTreeMap<R::TypeId, Vec<R>>,
    queries: Vec<Query<R::TypeId>>,
}

impl<R: Rule> Builder<R> {
    pub fn new(rules: Vec<R>, queries: Vec<Query<R::TypeId>>) -> Builder<R> {
        let mut rules_by_product: BTreeMap<R::TypeId, Vec<R>> = BTreeMap::new();
        for rule in rules {
            rules_by_product
                .entry(rule.product())
                .or_default()
                .push(rule);
        }
        // Sort rules by id so that iteration (and thus diagnostic) order is stable.
        for rules in rules_by_product.values_mut() {
            rules.sort_by_key(|rule| rule.id());
        }
        Builder {
            rules_by_product,
            queries,
        }
    }

    pub fn graph(self) -> Result<RuleGraph<R>, String> {
        let mut dependency_edges = crate::RuleDependencyEdges::default();
        let mut visiting = HashSet::default();
        let mut errors = Vec::new();

        for query in &self.queries {
            let root = Intern::new(EntryWithDeps::Root(RootEntry {
                query: query.clone(),
            }));
            self.construct_entry(root, &mut dependency_edges, &mut visiting, &mut errors);
        }

        if errors.is_empty() {
            let minimized = Self::minimize_params(dependency_edges);
            Ok(RuleGraph {
                queries: self.queries,
                rule_dependency_edges: minimized,
            })
        } else {
            errors.sort();
            errors.dedup();
            Err(format!(
                "Rules with errors: {}\n\n{}",
                errors.len(),
                errors.join("\n\n")
            ))
        }
    }

    ///
    /// Resolve the dependency bindings of the given entry, and then transitively those of each
    /// chosen dependency.
    ///
    fn construct_entry(
        &self,
        entry: Intern<EntryWithDeps<R>>,
        dependency_edges: &mut crate::RuleDependencyEdges<R>,
        visiting: &mut HashSet<Intern<EntryWithDeps<R>>>,
        errors: &mut Vec<String>,
    ) {
        // An entry which is already resolved (or currently being resolved, in the case of
        // rule-level cycles, which are legal statically and detected dynamically at runtime)
        // does not need to be revisited: entry identities are `(rule, params)`, so the set is
        // finite.
        if dependency_edges.contains_key(&entry) || !visiting.insert(entry) {
            return;
        }

        let dependency_keys = match entry.as_ref() {
            EntryWithDeps::Root(root) => vec![DependencyKey::new(root.query.product)],
            EntryWithDeps::Rule(rule_entry) => rule_entry.rule.dependency_keys(),
        };

        let mut edges = RuleEdges::default();
        for dependency_key in dependency_keys {
            match self.choose_dependency(entry.params(), &dependency_key) {
                Ok(chosen) => {
                    if let Entry::WithDeps(dep_entry) = &chosen {
                        self.construct_entry(*dep_entry, dependency_edges, visiting, errors);
                    }
                    edges.dependencies.insert(dependency_key, chosen);
                }
                Err(diagnostic) => {
                    errors.push(format!(
                        "In {}: {diagnostic}",
                        crate::entry_str(&Entry::WithDeps(entry))
                    ));
                }
            }
        }

        dependency_edges.insert(entry, edges);
    }

    ///
    /// Choose the unique source for the given dependency key under the given in-scope params.
    ///
    fn choose_dependency(
        &self,
        entry_params: &ParamTypes<R::TypeId>,
        dependency_key: &DependencyKey<R::TypeId>,
    ) -> Result<Entry<R>, String> {
        let product = dependency_key.product();

        // Compute the available parameter types: in-scope params plus those provided by the
        // key itself.
        let mut available: ParamTypes<R::TypeId> = entry_params.clone();
        available.extend(dependency_key.provided_params().iter().cloned());

        // An in-scope parameter satisfies a plain request for its type directly.
        if dependency_key.provided_params().is_empty() && available.contains(&product) {
            return Ok(Entry::Param(product));
        }

        let all_candidates = self
            .rules_by_product
            .get(&product)
            .map(|rules| rules.as_slice())
            .unwrap_or_default();

        let satisfiable: Vec<&R> = all_candidates
            .iter()
            .filter(|rule| {
                rule.param_types()
                    .iter()
                    .all(|param| available.contains(param))
            })
            .collect();

        match satisfiable.len() {
            0 => {
                let eliminated = all_candidates
                    .iter()
                    .map(|rule| {
                        format!(
                            "  {rule}: requires {}",
                            R::TypeId::display(rule.param_types().into_iter())
                        )
                    })
                    .join("\n");
                let details = if eliminated.is_empty() {
                    "No rules produce that type.".to_owned()
                } else {
                    format!("All potential sources were eliminated:\n{eliminated}")
                };
                Err(format!(
                    "No source of dependency {dependency_key} with in-scope types {}. {details}",
                    params_str(&available),
                ))
            }
            1 => Ok(self.entry_for_rule(satisfiable[0], &available)),
            _ => {
                // Multiple candidates: select the uniquely most specific one, i.e. the
                // candidate whose declared parameter set is a strict superset of every other
                // candidate's.
                let most_specific: Vec<&&R> = satisfiable
                    .iter()
                    .filter(|candidate| {
                        let candidate_params: ParamTypes<R::TypeId> =
                            candidate.param_types().into_iter().collect();
                        satisfiable.iter().all(|other| {
                            if other.id() == candidate.id() {
                                return true;
                            }
                            let other_params: ParamTypes<R::TypeId> =
                                other.param_types().into_iter().collect();
                            other_params.is_subset(&candidate_params)
                                && other_params != candidate_params
                        })
                    })
                    .collect();

                match most_specific.len() {
                    1 => Ok(self.entry_for_rule(most_specific[0], &available)),
                    _ => Err(format!(
                        "Ambiguous rules to compute {dependency_key} with in-scope types {}:\n{}",
                        params_str(&available),
                        satisfiable
                            .iter()
                            .map(|rule| format!(
                                "  {rule} for {}",
                                R::TypeId::display(rule.param_types().into_iter())
                            ))
                            .join("\n"),
                    )),
                }
            }
        }
    }

    fn entry_for_rule(&self, rule: &R, available: &ParamTypes<R::TypeId>) -> Entry<R> {
        // Parameters flow in: the chosen rule's entry initially carries the full set of
        // in-scope types. A minimization pass below narrows each entry to the params it
        // transitively consumes, which is load-bearing for early cutoff: a node's identity
        // must not change when an unconsumed parameter does.
        Entry::WithDeps(Intern::new(EntryWithDeps::Rule(RuleEntry {
            params: available.clone(),
            rule: rule.clone(),
        })))
    }

    ///
    /// Narrow each rule entry's param set to the params which it (transitively) consumes: its
    /// own declared params, plus each dependency's live params minus those the dependency key
    /// itself provides.
    ///
    /// Computed as a fixed point because rule-level cycles are legal at this stage.
    ///
    fn minimize_params(
        dependency_edges: crate::RuleDependencyEdges<R>,
    ) -> crate::RuleDependencyEdges<R> {
        use fnv::FnvHashMap;

        // Compute live param sets.
        let mut live: FnvHashMap<Intern<EntryWithDeps<R>>, ParamTypes<R::TypeId>> =
            dependency_edges
                .keys()
                .map(|entry| {
                    let initial = match entry.as_ref() {
                        EntryWithDeps::Root(root) => root.query.params.clone(),
                        EntryWithDeps::Rule(rule_entry) => rule_entry
                            .rule
                            .param_types()
                            .into_iter()
                            .collect::<ParamTypes<_>>(),
                    };
                    (*entry, initial)
                })
                .collect();

        loop {
            let mut changed = false;
            for (entry, edges) in &dependency_edges {
                let mut required = live
                    .get(entry)
                    .cloned()
                    .expect("Initialized above for every entry.");
                for (dependency_key, dep) in &edges.dependencies {
                    match dep {
                        Entry::Param(type_id) => {
                            required.insert(*type_id);
                        }
                        Entry::WithDeps(dep_entry) => {
                            if let Some(dep_live) = live.get(dep_entry) {
                                required.extend(dep_live.iter().filter(|param| {
                                    !dependency_key.provided_params().contains(param)
                                }));
                            }
                        }
                    }
                }
                // Live params are bounded by what is actually in scope for the entry.
                required.retain(|param| entry.params().contains(param));
                let current = live.get_mut(entry).unwrap();
                if *current != required {
                    *current = required;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        // Rewrite each entry (and each edge target) with its narrowed params.
        let rewrite = |entry: &Intern<EntryWithDeps<R>>| -> Intern<EntryWithDeps<R>> {
            match entry.as_ref() {
                EntryWithDeps::Root(_) => *entry,
                EntryWithDeps::Rule(rule_entry) => Intern::new(EntryWithDeps::Rule(RuleEntry {
                    params: live.get(entry).cloned().unwrap_or_default(),
                    rule: rule_entry.rule.clone(),
                })),
            }
        };

        let mut minimized = crate::RuleDependencyEdges::default();
        for (entry, edges) in &dependency_edges {
            let mut new_edges = RuleEdges::default();
            for (dependency_key, dep) in &edges.dependencies {
                let new_dep = match dep {
                    Entry::Param(type_id) => Entry::Param(*type_id),
                    Entry::WithDeps(dep_entry) => Entry::WithDeps(rewrite(dep_entry)),
                };
                new_edges.dependencies.insert(dependency_key.clone(), new_dep);
            }
            // Two entries which minimize to the same identity have made the same transitive
            // choices: the first insertion wins.
            minimized.entry(rewrite(entry)).or_insert(new_edges);
        }
        minimized
    }
}
