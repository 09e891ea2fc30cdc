// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(unused_must_use)]
// See https://github.com/hyperium/tonic/issues/1056
#![allow(clippy::derive_partial_eq_without_eq)]

//! Hand-maintained bindings for the subset of the Remote Execution API v2 (and its supporting
//! google protos) that the engine speaks. Message and field numbers match the public
//! `build.bazel.remote.execution.v2` definitions, so on-wire data is interchangeable with
//! `tonic-build` generated code; maintaining the structs by hand keeps the build hermetic (no
//! protoc invocation).

mod conversions;
pub use conversions::require_digest;

#[cfg(test)]
mod conversions_tests;

pub mod gen {
    // NOTE: The nested module structure mirrors the proto package structure, because generated
    // code (and code written against it) refers to sibling packages via `super` paths.
    pub mod google {
        pub mod rpc {
            include!("gen/google_rpc.rs");
        }
        pub mod longrunning {
            include!("gen/google_longrunning.rs");
        }
        pub mod bytestream {
            include!("gen/google_bytestream.rs");
        }
    }
    pub mod build {
        pub mod bazel {
            pub mod remote {
                pub mod execution {
                    pub mod v2 {
                        include!("gen/remote_execution.rs");

                        pub fn empty_digest() -> Digest {
                            Digest {
                                hash: String::from(
                                    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
                                ),
                                size_bytes: 0,
                            }
                        }
                    }
                }
            }
        }
    }
}

mod verification;
pub use crate::verification::verify_directory_canonical;
#[cfg(test)]
mod verification_tests;
