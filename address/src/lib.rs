// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The address datamodel consumed by the engine core: a normalized identifier for a unit which
//! the build system may reason about, in the canonical form `path:name#generated`.
//!
//! The core neither defines nor enforces any target schema beyond this identity: evaluating
//! what an address refers to is a consumer concern.

use std::fmt;

///
/// A parsed (but not yet normalized) address: the borrowed fields of the input string.
///
#[derive(Debug, Eq, PartialEq)]
pub struct AddressInput<'a> {
    pub path: &'a str,
    pub target: Option<&'a str>,
    pub generated: Option<&'a str>,
}

peg::parser! {
    grammar parsers() for str {
        rule path() -> &'input str =
            s:$([^':' | '#']*) { s }

        rule target_name() -> &'input str
            = quiet!{ s:$([^'#' | ':']+) { s } }
            / expected!("a non-empty target name to follow a `:`.")

        rule target() -> &'input str =
          ":" s:target_name() { s }

        rule generated_name() -> &'input str
            = quiet!{ s:$([^':']+) { s } }
            / expected!("a non-empty generated target name to follow a `#`.")

        rule generated() -> &'input str = "#" s:generated_name() { s }

        pub(crate) rule address() -> AddressInput<'input>
            = path:path() target:target()? generated:generated()? {
                AddressInput {
                    path,
                    target,
                    generated,
                }
            }
    }
}

pub fn parse_address(value: &str) -> Result<AddressInput<'_>, String> {
    parsers::address(value).map_err(|e| format!("Failed to parse address `{value}`: {e}"))
}

///
/// A normalized address. Uniqueness is by the full canonical form: two addresses are the same
/// unit if and only if their canonical forms are equal.
///
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Address {
    /// The path portion of the address: generally the directory containing the unit.
    pub path: String,
    /// The name of the unit: defaults to the final component of the path when absent.
    pub name: Option<String>,
    /// The name of a generated sub-unit, if this address refers to one.
    pub generated_name: Option<String>,
}

impl Address {
    pub fn new(
        path: &str,
        name: Option<&str>,
        generated_name: Option<&str>,
    ) -> Result<Address, String> {
        if path.is_empty() && name.is_none() {
            return Err("An address must have either a path or a name.".to_owned());
        }
        if generated_name.is_some() && name.is_none() && path.is_empty() {
            return Err(format!(
                "A generated name (`#{}`) requires an owning address.",
                generated_name.unwrap_or_default()
            ));
        }
        Ok(Address {
            path: path.to_owned(),
            name: name.map(str::to_owned),
            generated_name: generated_name.map(str::to_owned),
        })
    }

    pub fn parse(value: &str) -> Result<Address, String> {
        let input = parse_address(value)?;
        Address::new(input.path, input.target, input.generated)
    }

    ///
    /// The effective name of this address: the explicit name if one was given, and the final
    /// path component otherwise.
    ///
    pub fn effective_name(&self) -> &str {
        match &self.name {
            Some(name) => name,
            None => self
                .path
                .rsplit('/')
                .next()
                .expect("rsplit always yields at least one element"),
        }
    }

    ///
    /// Render the canonical form of this address. Parsing the canonical form round-trips to an
    /// equal Address.
    ///
    pub fn canonical(&self) -> String {
        format!("{self}")
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)?;
        if let Some(name) = &self.name {
            write!(f, ":{name}")?;
        }
        if let Some(generated_name) = &self.generated_name {
            write!(f, "#{generated_name}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Address;

    #[test]
    fn parses_a_bare_path() {
        let address = Address::parse("src/rust/engine").unwrap();
        assert_eq!(address.path, "src/rust/engine");
        assert_eq!(address.name, None);
        assert_eq!(address.effective_name(), "engine");
    }

    #[test]
    fn parses_a_named_target() {
        let address = Address::parse("src/rust/engine:tests").unwrap();
        assert_eq!(address.path, "src/rust/engine");
        assert_eq!(address.name.as_deref(), Some("tests"));
        assert_eq!(address.effective_name(), "tests");
    }

    #[test]
    fn parses_a_generated_target() {
        let address = Address::parse("src/proto:protos#gen").unwrap();
        assert_eq!(address.path, "src/proto");
        assert_eq!(address.name.as_deref(), Some("protos"));
        assert_eq!(address.generated_name.as_deref(), Some("gen"));
    }

    #[test]
    fn canonical_form_roundtrips() {
        for s in ["a/b", "a/b:c", "a/b#g", "a/b:c#g", ":standalone"] {
            let address = Address::parse(s).unwrap();
            assert_eq!(address, Address::parse(&address.canonical()).unwrap());
        }
    }

    #[test]
    fn uniqueness_is_by_canonical_form() {
        assert_eq!(Address::parse("a/b:c").unwrap(), Address::parse("a/b:c").unwrap());
        assert_ne!(Address::parse("a/b:c").unwrap(), Address::parse("a/b").unwrap());
        assert_ne!(
            Address::parse("a/b:c#g").unwrap(),
            Address::parse("a/b:c").unwrap()
        );
    }

    #[test]
    fn rejects_empty_addresses() {
        Address::parse("").expect_err("want err");
        Address::parse(":").expect_err("want err");
        Address::parse("a/b#").expect_err("want err");
    }
}
