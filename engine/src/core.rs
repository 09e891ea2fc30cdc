// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::any::Any;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::{fmt, hash};

use internment::Intern;
use sha2::{Digest as Sha256Digest, Sha256};
use smallvec::SmallVec;

use hashing::Fingerprint;
use process_execution::ProcessError;
use store::StoreError;

///
/// The type of a product or parameter value: an interned name. Equality, ordering and hashing
/// are on the name, which makes resolution orders total and stable.
///
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct TypeId(Intern<String>);

impl TypeId {
    pub fn new(name: &str) -> TypeId {
        TypeId(Intern::from(name))
    }

    pub fn name(&self) -> &str {
        self.0.as_ref()
    }
}

impl Ord for TypeId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.as_ref().cmp(other.0.as_ref())
    }
}

impl PartialOrd for TypeId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl rule_graph::TypeId for TypeId {
    /// Render a string for a collection of TypeIds.
    fn display<I>(type_ids: I) -> String
    where
        I: Iterator<Item = TypeId>,
    {
        display_sorted_in_parens(type_ids)
    }
}

pub fn display_sorted_in_parens<T>(items: T) -> String
where
    T: Iterator,
    T::Item: fmt::Display,
{
    let mut items: Vec<_> = items.map(|p| format!("{p}")).collect();
    match items.len() {
        0 => "()".to_string(),
        1 => items.pop().unwrap(),
        _ => {
            items.sort();
            format!("({})", items.join(", "))
        }
    }
}

///
/// A value which may be used as a product or parameter: any Rust value which is hashable and
/// debuggable. Equality is total and cheap: by the fingerprint of the value's stable hash
/// (values whose authoritative form is a stored blob or tree hash their digest).
///
pub trait ProductValue: Any + fmt::Debug + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
    fn fingerprint(&self) -> Fingerprint;
}

impl<T: Any + fmt::Debug + Hash + Send + Sync + 'static> ProductValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn fingerprint(&self) -> Fingerprint {
        let mut hasher = FingerprintHasher::new();
        // Include the concrete type in the fingerprint, so that two types with identical
        // hashable content do not collide.
        std::any::type_name::<T>().hash(&mut hasher);
        self.hash(&mut hasher);
        hasher.finish_fingerprint()
    }
}

///
/// A std::hash::Hasher backed by a cryptographic hash, used to derive stable fingerprints from
/// `Hash` implementations. Fingerprints are stable for the life of the process, which is the
/// lifetime of the node table they key.
///
struct FingerprintHasher {
    hasher: Sha256,
}

impl FingerprintHasher {
    fn new() -> FingerprintHasher {
        FingerprintHasher {
            hasher: Sha256::default(),
        }
    }

    fn finish_fingerprint(self) -> Fingerprint {
        Fingerprint::new(self.hasher.finalize().into())
    }
}

impl Hasher for FingerprintHasher {
    fn finish(&self) -> u64 {
        // The full digest is consumed via finish_fingerprint; this method is unused.
        0
    }

    fn write(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }
}

///
/// A type-erased, fingerprinted value.
///
#[derive(Clone)]
pub struct Value(Arc<dyn ProductValue>);

impl Value {
    pub fn new<T: Any + fmt::Debug + Hash + Send + Sync + 'static>(value: T) -> Value {
        Value(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    ///
    /// Extract a clone of the underlying value, failing if it has a different type.
    ///
    pub fn extract<T: Any + Clone>(&self) -> Result<T, Failure> {
        self.downcast_ref::<T>().cloned().ok_or_else(|| {
            throw(format!(
                "Expected a value of type {}, but got: {:?}",
                std::any::type_name::<T>(),
                self.0
            ))
        })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.0.fingerprint()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_any().type_id() == other.0.as_any().type_id()
            && self.0.fingerprint() == other.0.fingerprint()
    }
}

impl Eq for Value {}

impl hash::Hash for Value {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.0.fingerprint().hash(state);
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

///
/// A fingerprinted value tagged with its product TypeId: the form in which values participate
/// in Params (and thus in node identities).
///
#[derive(Clone)]
pub struct Key {
    type_id: TypeId,
    value: Value,
}

impl Key {
    pub fn new<T: Any + fmt::Debug + Hash + Send + Sync + 'static>(
        type_id: TypeId,
        value: T,
    ) -> Key {
        Key {
            type_id,
            value: Value::new(value),
        }
    }

    pub fn from_value(type_id: TypeId, value: Value) -> Key {
        Key { type_id, value }
    }

    pub fn type_id(&self) -> &TypeId {
        &self.type_id
    }

    pub fn to_value(&self) -> Value {
        self.value.clone()
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.value.fingerprint() == other.value.fingerprint()
    }
}

impl Eq for Key {}

impl hash::Hash for Key {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.value.fingerprint().hash(state);
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}({:?})", self.type_id, self.value)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

///
/// Params represent a TypeId->Key map.
///
/// For efficiency and hashability, they're stored as sorted Keys (with distinct TypeIds).
///
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Params(SmallVec<[Key; 4]>);

impl Params {
    pub fn new<I: IntoIterator<Item = Key>>(param_inputs: I) -> Result<Params, String> {
        let mut params = param_inputs.into_iter().collect::<SmallVec<[Key; 4]>>();
        params.sort_by_key(|k| *k.type_id());

        if params.len() > 1 {
            let mut prev = &params[0];
            for param in &params[1..] {
                if param.type_id() == prev.type_id() {
                    return Err(format!(
                        "Values used as `Params` must have distinct types, but the following \
                        values had the same type (`{}`):\n  {}\n  {}",
                        prev.type_id(),
                        prev,
                        param,
                    ));
                }
                prev = param;
            }
        }

        Ok(Params(params))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.0.iter()
    }

    ///
    /// Adds the given param Keys to these Params, replacing existing params with the same type
    /// if they exist.
    ///
    pub fn extend(&mut self, params: impl IntoIterator<Item = Key>) {
        for param in params {
            match self.binary_search(*param.type_id()) {
                Ok(idx) => self.0[idx] = param,
                Err(idx) => self.0.insert(idx, param),
            }
        }
    }

    ///
    /// Filters this Params object in-place to contain only params matching the given predicate.
    ///
    pub fn retain<F: FnMut(&mut Key) -> bool>(&mut self, f: F) {
        self.0.retain(f)
    }

    ///
    /// Returns the Key for the given TypeId if it is represented in this set of Params.
    ///
    pub fn find(&self, type_id: TypeId) -> Option<&Key> {
        self.binary_search(type_id).ok().map(|idx| &self.0[idx])
    }

    fn binary_search(&self, type_id: TypeId) -> Result<usize, usize> {
        self.0
            .binary_search_by(|probe| probe.type_id().cmp(&type_id))
    }

    pub fn type_ids(&self) -> impl Iterator<Item = TypeId> + '_ {
        self.0.iter().map(|k| *k.type_id())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Params{}", display_sorted_in_parens(self.0.iter()))
    }
}

///
/// A helper to construct a `Failure::Throw` from a message.
///
pub fn throw(msg: String) -> Failure {
    let frame = msg.clone();
    Failure::Throw {
        val: msg,
        engine_traceback: vec![frame],
    }
}

///
/// An error arising from a Node: either an invalidation marker, a missing digest, or an
/// application error with the chain of demands which led to it.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Failure {
    /// A Node was invalidated out of the graph while running: the work is retried
    /// transparently, so user code should not observe this value.
    Invalidated,
    /// A Digest was not present after local and remote attempts.
    MissingDigest(String, hashing::Digest),
    /// An error raised by a rule or an intrinsic, with the chain of demands from the root to
    /// the failing node.
    Throw {
        val: String,
        engine_traceback: Vec<String>,
    },
}

impl Failure {
    ///
    /// Push the given frame (the description of a demand) onto the traceback, innermost first.
    ///
    pub fn with_pushed_frame(self, frame: &impl fmt::Display) -> Failure {
        match self {
            Failure::Invalidated => Failure::Invalidated,
            md @ Failure::MissingDigest { .. } => {
                // MissingDigest is consumed by the backtracking machinery, so it does not
                // accumulate a traceback.
                md
            }
            Failure::Throw {
                val,
                mut engine_traceback,
            } => {
                engine_traceback.push(format!("{frame}"));
                Failure::Throw {
                    val,
                    engine_traceback,
                }
            }
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Failure::Invalidated => write!(f, "Giving up on retrying due to changed files."),
            Failure::MissingDigest(s, d) => write!(f, "Could not recover from {s}: {d:?}"),
            Failure::Throw { val, .. } => write!(f, "{val}"),
        }
    }
}

impl graph::NodeError for Failure {
    fn invalidated() -> Failure {
        Failure::Invalidated
    }

    fn generic(message: String) -> Failure {
        throw(message)
    }
}

impl From<StoreError> for Failure {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MissingDigest(s, d) => Self::MissingDigest(s, d),
            StoreError::Unclassified(s) => throw(s),
        }
    }
}

impl From<ProcessError> for Failure {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::MissingDigest(s, d) => Self::MissingDigest(s, d),
            ProcessError::Unclassified(s) => throw(s),
        }
    }
}

impl From<String> for Failure {
    fn from(err: String) -> Self {
        throw(err)
    }
}

#[cfg(test)]
mod core_tests {
    use super::{Key, Params, TypeId, Value};

    #[test]
    fn value_equality_is_by_fingerprint() {
        assert_eq!(Value::new("a".to_owned()), Value::new("a".to_owned()));
        assert_ne!(Value::new("a".to_owned()), Value::new("b".to_owned()));
        // Equal hashable content of different types is not equal.
        assert_ne!(Value::new(1u64), Value::new(1i64));
    }

    #[test]
    fn params_are_sorted_and_unique_by_type() {
        let a = TypeId::new("A");
        let b = TypeId::new("B");

        let params =
            Params::new(vec![Key::new(b, "b".to_owned()), Key::new(a, "a".to_owned())]).unwrap();
        assert_eq!(
            params.type_ids().collect::<Vec<_>>(),
            vec![a, b],
        );

        Params::new(vec![
            Key::new(a, "one".to_owned()),
            Key::new(a, "two".to_owned()),
        ])
        .expect_err("want err");
    }

    #[test]
    fn params_extend_replaces_same_type() {
        let a = TypeId::new("A");
        let mut params = Params::new(vec![Key::new(a, "one".to_owned())]).unwrap();
        params.extend(vec![Key::new(a, "two".to_owned())]);
        assert_eq!(
            params.find(a).unwrap().to_value().extract::<String>().unwrap(),
            "two"
        );
    }
}
