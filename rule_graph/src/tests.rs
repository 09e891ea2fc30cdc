// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use crate::{DependencyKey, Entry, Query, Rule, RuleGraph, TypeId};

///
/// A test TypeId: a name with a total order.
///
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
struct T(&'static str);

impl fmt::Display for T {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TypeId for T {
    fn display<I>(type_ids: I) -> String
    where
        I: Iterator<Item = T>,
    {
        let mut names: Vec<_> = type_ids.map(|t| t.0.to_owned()).collect();
        names.sort();
        format!("({})", names.join(", "))
    }
}

///
/// A test Rule, declared as (name, product, params, gets).
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct R {
    name: &'static str,
    product: T,
    params: Vec<T>,
    gets: Vec<DependencyKey<T>>,
}

impl R {
    fn new(name: &'static str, product: T, params: Vec<T>, gets: Vec<DependencyKey<T>>) -> R {
        R {
            name,
            product,
            params,
            gets,
        }
    }
}

impl fmt::Display for R {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl Rule for R {
    type TypeId = T;

    fn product(&self) -> T {
        self.product
    }

    fn param_types(&self) -> Vec<T> {
        self.params.clone()
    }

    fn dependency_keys(&self) -> Vec<DependencyKey<T>> {
        self.gets.clone()
    }

    fn id(&self) -> String {
        self.name.to_owned()
    }

    fn require_reachable(&self) -> bool {
        true
    }
}

const INPUT: T = T("Input");
const OUTPUT: T = T("Output");
const MIDDLE: T = T("Middle");
const SCOPE: T = T("Scope");

#[test]
fn single_rule_resolves() {
    let rule = R::new("make_output", OUTPUT, vec![INPUT], vec![]);
    let graph = RuleGraph::new(
        vec![rule.clone()],
        vec![Query::new(OUTPUT, vec![INPUT])],
    )
    .unwrap();

    let (_, edges) = graph.find_root(vec![INPUT], OUTPUT).unwrap();
    let entry = edges.entry_for(&DependencyKey::new(OUTPUT)).unwrap();
    match entry {
        Entry::WithDeps(e) => assert_eq!(e.rule(), Some(rule)),
        other => panic!("Expected a rule, got: {other:?}"),
    }
}

#[test]
fn transitive_gets_resolve() {
    let output_rule = R::new(
        "make_output",
        OUTPUT,
        vec![],
        vec![DependencyKey::new(MIDDLE)],
    );
    let middle_rule = R::new("make_middle", MIDDLE, vec![INPUT], vec![]);
    let graph = RuleGraph::new(
        vec![output_rule, middle_rule.clone()],
        vec![Query::new(OUTPUT, vec![INPUT])],
    )
    .unwrap();

    // The transitive entry for make_output exists, with an edge to make_middle.
    let (root_entry, root_edges) = graph.find_root(vec![INPUT], OUTPUT).unwrap();
    let output_entry = root_edges.entry_for(&DependencyKey::new(OUTPUT)).unwrap();
    let output_edges = graph.edges_for_inner(&output_entry).unwrap();
    let middle_entry = output_edges.entry_for(&DependencyKey::new(MIDDLE)).unwrap();
    match middle_entry {
        Entry::WithDeps(e) => assert_eq!(e.rule(), Some(middle_rule)),
        other => panic!("Expected a rule, got: {other:?}"),
    }
    assert!(matches!(root_entry, Entry::WithDeps(_)));
}

#[test]
fn params_satisfy_requests_directly() {
    let rule = R::new(
        "consume_input",
        OUTPUT,
        vec![INPUT],
        vec![DependencyKey::new(INPUT)],
    );
    let graph = RuleGraph::new(vec![rule], vec![Query::new(OUTPUT, vec![INPUT])]).unwrap();

    let (_, edges) = graph.find_root(vec![INPUT], OUTPUT).unwrap();
    let output_entry = edges.entry_for(&DependencyKey::new(OUTPUT)).unwrap();
    let output_edges = graph.edges_for_inner(&output_entry).unwrap();
    assert_eq!(
        output_edges.entry_for(&DependencyKey::new(INPUT)),
        Some(Entry::Param(INPUT))
    );
}

#[test]
fn no_rule_is_an_error() {
    let err = RuleGraph::<R>::new(vec![], vec![Query::new(OUTPUT, vec![INPUT])])
        .err()
        .unwrap();
    assert!(err.contains("No source of dependency Output"), "Got: {err}");
    assert!(err.contains("No rules produce that type"), "Got: {err}");
}

#[test]
fn eliminated_candidates_are_listed() {
    // A rule exists for the product, but its param is not in scope.
    let rule = R::new("needs_scope", OUTPUT, vec![SCOPE], vec![]);
    let err = RuleGraph::new(vec![rule], vec![Query::new(OUTPUT, vec![INPUT])])
        .err()
        .unwrap();
    assert!(
        err.contains("All potential sources were eliminated"),
        "Got: {err}"
    );
    assert!(err.contains("needs_scope"), "Got: {err}");
}

#[test]
fn most_specific_candidate_wins() {
    // Two candidates: one requiring a strict superset of the other's params. The more
    // specific one is chosen.
    let generic = R::new("generic", OUTPUT, vec![INPUT], vec![]);
    let specific = R::new("specific", OUTPUT, vec![INPUT, SCOPE], vec![]);
    let graph = RuleGraph::new(
        vec![generic, specific.clone()],
        vec![Query::new(OUTPUT, vec![INPUT, SCOPE])],
    )
    .unwrap();

    let (_, edges) = graph.find_root(vec![INPUT, SCOPE], OUTPUT).unwrap();
    let entry = edges.entry_for(&DependencyKey::new(OUTPUT)).unwrap();
    match entry {
        Entry::WithDeps(e) => assert_eq!(e.rule(), Some(specific)),
        other => panic!("Expected a rule, got: {other:?}"),
    }
}

#[test]
fn ambiguity_is_an_error() {
    // Two candidates with incomparable param sets: neither is most specific.
    let one = R::new("one", OUTPUT, vec![INPUT], vec![]);
    let two = R::new("two", OUTPUT, vec![SCOPE], vec![]);
    let err = RuleGraph::new(
        vec![one, two],
        vec![Query::new(OUTPUT, vec![INPUT, SCOPE])],
    )
    .err()
    .unwrap();
    assert!(err.contains("Ambiguous rules"), "Got: {err}");
    assert!(err.contains("one") && err.contains("two"), "Got: {err}");
}

#[test]
fn provided_params_are_in_scope_for_the_subgraph_only() {
    // `make_output` gets Middle while providing Scope: `make_middle` may consume Scope, even
    // though the root query does not provide it.
    let output_rule = R::new(
        "make_output",
        OUTPUT,
        vec![],
        vec![DependencyKey::new_with_params(MIDDLE, vec![SCOPE])],
    );
    let middle_rule = R::new("make_middle", MIDDLE, vec![SCOPE], vec![]);
    let graph = RuleGraph::new(
        vec![output_rule, middle_rule.clone()],
        vec![Query::new(OUTPUT, vec![])],
    )
    .unwrap();

    let (_, edges) = graph.find_root(vec![], OUTPUT).unwrap();
    let output_entry = edges.entry_for(&DependencyKey::new(OUTPUT)).unwrap();
    let output_edges = graph.edges_for_inner(&output_entry).unwrap();
    let middle_entry = output_edges
        .entry_for(&DependencyKey::new_with_params(MIDDLE, vec![SCOPE]))
        .unwrap();
    match middle_entry {
        Entry::WithDeps(e) => {
            assert_eq!(e.rule(), Some(middle_rule));
            assert!(e.params().contains(&SCOPE));
        }
        other => panic!("Expected a rule, got: {other:?}"),
    }
}

#[test]
fn rule_level_cycles_construct_and_defer_to_runtime() {
    // A gets B and B gets A: statically fine (the ring is finite), and detected dynamically
    // by the node graph at runtime.
    let a = R::new("a", OUTPUT, vec![], vec![DependencyKey::new(MIDDLE)]);
    let b = R::new("b", MIDDLE, vec![], vec![DependencyKey::new(OUTPUT)]);
    let graph = RuleGraph::new(vec![a, b], vec![Query::new(OUTPUT, vec![])]).unwrap();
    assert!(graph.entry_count() >= 3);
}

#[test]
fn unreachable_required_rules_are_reported() {
    let reachable = R::new("reachable", OUTPUT, vec![INPUT], vec![]);
    let unreachable = R::new("unreachable", MIDDLE, vec![SCOPE], vec![]);
    let all_rules = vec![reachable.clone(), unreachable];
    let graph = RuleGraph::new(
        all_rules.clone(),
        vec![Query::new(OUTPUT, vec![INPUT])],
    )
    .unwrap();

    let err = graph.validate_reachability(&all_rules).err().unwrap();
    assert!(err.contains("unreachable"), "Got: {err}");
}

#[test]
fn find_root_subset_match() {
    let rule = R::new("make_output", OUTPUT, vec![INPUT], vec![]);
    let graph = RuleGraph::new(vec![rule], vec![Query::new(OUTPUT, vec![INPUT])]).unwrap();

    // A caller with additional params in scope still finds the installed Query.
    graph.find_root(vec![INPUT, SCOPE], OUTPUT).unwrap();
    // But a missing product is an error naming the installed queries.
    let err = graph.find_root(vec![INPUT], MIDDLE).err().unwrap();
    assert!(err.contains("No installed Queries"), "Got: {err}");
}

#[test]
fn resolution_is_deterministic() {
    let rules = vec![
        R::new("make_output", OUTPUT, vec![], vec![DependencyKey::new(MIDDLE)]),
        R::new("make_middle", MIDDLE, vec![INPUT], vec![]),
    ];
    let queries = vec![Query::new(OUTPUT, vec![INPUT])];
    let graph1 = RuleGraph::new(rules.clone(), queries.clone()).unwrap();
    let graph2 = RuleGraph::new(rules, queries).unwrap();
    assert_eq!(format!("{graph1}"), format!("{graph2}"));
}
