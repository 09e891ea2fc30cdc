// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::gen::build::bazel::remote::execution::v2 as remexec;
use crate::require_digest;

#[test]
fn digest_roundtrip() {
    let digest = hashing::Digest::of_bytes(b"conversions");
    let proto: remexec::Digest = digest.into();
    assert_eq!(proto.hash, digest.hash.to_hex());
    assert_eq!(proto.size_bytes, digest.size_bytes as i64);
    assert_eq!(hashing::Digest::try_from(proto).unwrap(), digest);
}

#[test]
fn empty_digest_constant_matches() {
    assert_eq!(
        hashing::Digest::try_from(remexec::empty_digest()).unwrap(),
        hashing::EMPTY_DIGEST
    );
}

#[test]
fn bad_fingerprint_is_an_error() {
    let proto = remexec::Digest {
        hash: "not-hex".to_owned(),
        size_bytes: 0,
    };
    hashing::Digest::try_from(proto).expect_err("want err");
}

#[test]
fn require_digest_rejects_missing() {
    require_digest(None).expect_err("want err");
    let digest = hashing::Digest::of_bytes(b"present");
    let proto: remexec::Digest = digest.into();
    assert_eq!(require_digest(Some(&proto)).unwrap(), digest);
}
