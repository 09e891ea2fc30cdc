// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeSet;
use std::fmt::{Debug, Display};
use std::hash::Hash;

use smallvec::SmallVec;

use super::params_str;

pub type ParamTypes<T> = BTreeSet<T>;

///
/// The type of a product or parameter: an opaque, totally ordered identifier. Resolution is a
/// search over these types, never over names.
///
pub trait TypeId:
    Clone + Copy + Debug + Display + Hash + Eq + Ord + Sized + Send + Sync + 'static
{
    ///
    /// Render a string for a collection of TypeIds.
    ///
    fn display<I>(type_ids: I) -> String
    where
        I: Iterator<Item = Self>;
}

///
/// A get declared by a rule: the requested product type, plus any parameter types which the
/// get introduces into scope for its subgraph ("provided" params).
///
#[derive(Eq, Hash, PartialEq, Clone, Debug, PartialOrd, Ord)]
pub struct DependencyKey<T: TypeId> {
    pub product: T,
    pub provided_params: SmallVec<[T; 2]>,
}

impl<T: TypeId> DependencyKey<T> {
    pub fn new(product: T) -> Self {
        DependencyKey {
            product,
            provided_params: SmallVec::default(),
        }
    }

    pub fn new_with_params<I: IntoIterator<Item = T>>(product: T, provided_params: I) -> Self {
        let mut provided_params = provided_params.into_iter().collect::<SmallVec<[T; 2]>>();
        provided_params.sort();
        provided_params.dedup();

        DependencyKey {
            product,
            provided_params,
        }
    }

    ///
    /// Returns the product (output) type for this dependency.
    ///
    pub fn product(&self) -> T {
        self.product
    }

    ///
    /// Returns the param types which this dependency provides to its subgraph.
    ///
    pub fn provided_params(&self) -> &[T] {
        &self.provided_params
    }
}

impl<T: TypeId> Display for DependencyKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.provided_params.is_empty() {
            write!(f, "{}", self.product)
        } else {
            write!(f, "Get({}, {:?})", self.product, self.provided_params)
        }
    }
}

///
/// A registered rule: its product type, the parameter types it consumes directly, and the gets
/// it may issue while running.
///
pub trait Rule: Clone + Debug + Display + Hash + Eq + Sized + Send + Sync + 'static {
    type TypeId: TypeId;

    ///
    /// Returns the product (output) type for this Rule.
    ///
    fn product(&self) -> Self::TypeId;

    ///
    /// Returns the parameter types directly consumed by this Rule.
    ///
    fn param_types(&self) -> Vec<Self::TypeId>;

    ///
    /// Return keys for the dependencies of this Rule.
    ///
    fn dependency_keys(&self) -> Vec<DependencyKey<Self::TypeId>>;

    ///
    /// A stable, unique identifier for this rule, used to make iteration orders total.
    ///
    fn id(&self) -> String;

    ///
    /// True if this rule implementation should be required to be reachable in the RuleGraph.
    ///
    fn require_reachable(&self) -> bool;
}

///
/// A root demand: a product type requested under a set of in-scope parameter types.
///
#[derive(Eq, Hash, PartialEq, Clone, Debug)]
pub struct Query<T: TypeId> {
    pub product: T,
    pub params: ParamTypes<T>,
}

impl<T: TypeId> Query<T> {
    pub fn new<I: IntoIterator<Item = T>>(product: T, params: I) -> Query<T> {
        Query {
            product,
            params: params.into_iter().collect(),
        }
    }
}

impl<T: TypeId> Display for Query<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Query({} for {})", self.product, params_str(&self.params))
    }
}
