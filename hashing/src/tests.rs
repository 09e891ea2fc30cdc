// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use serde_test::{assert_ser_tokens, Token};

use crate::{Digest, Fingerprint, Hasher, EMPTY_DIGEST, FINGERPRINT_SIZE};

const HEX: &str = "0123456789abcdeffedcba98765432100000000000000000ffffffffffffffff";

fn fingerprint() -> Fingerprint {
    let mut bytes = [0xff; FINGERPRINT_SIZE];
    bytes[0..8].clone_from_slice(&[0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef]);
    bytes[8..16].clone_from_slice(&[0xfe, 0xdc, 0xba, 0x98, 0x76, 0x54, 0x32, 0x10]);
    bytes[16..24].clone_from_slice(&[0x00; 8]);
    Fingerprint::new(bytes)
}

#[test]
fn from_hex_string() {
    assert_eq!(Fingerprint::from_hex_string(HEX).unwrap(), fingerprint());
}

#[test]
fn from_hex_string_not_long_enough() {
    Fingerprint::from_hex_string("abcd").expect_err("want err");
}

#[test]
fn from_hex_string_too_long() {
    Fingerprint::from_hex_string(&format!("{HEX}00")).expect_err("want err");
}

#[test]
fn from_hex_string_invalid_chars() {
    Fingerprint::from_hex_string(&format!("q{}", &HEX[1..])).expect_err("want err");
}

#[test]
fn to_hex_roundtrip() {
    assert_eq!(fingerprint().to_hex(), HEX);
    assert_eq!(
        Fingerprint::from_hex_string(&fingerprint().to_hex()).unwrap(),
        fingerprint()
    );
}

#[test]
fn display_is_hex() {
    assert_eq!(format!("{}", fingerprint()), HEX);
    assert_eq!(format!("{:?}", fingerprint()), format!("Fingerprint<{HEX}>"));
}

#[test]
fn prefix_hash_is_leading_bytes() {
    assert_eq!(fingerprint().prefix_hash(), 0x0123456789abcdef);
}

#[test]
fn digest_of_bytes() {
    // Check a couple of well-known SHA-256 values.
    assert_eq!(Digest::of_bytes(&[]), EMPTY_DIGEST);
    assert_eq!(
        Digest::of_bytes(b"abc"),
        Digest::new(
            Fingerprint::from_hex_string(
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
            )
            .unwrap(),
            3,
        )
    );
}

#[test]
fn hasher_accumulates() {
    let mut hasher = Hasher::new();
    hasher.update(b"ab");
    hasher.update(b"c");
    assert_eq!(hasher.finish(), Digest::of_bytes(b"abc"));
}

#[test]
fn digest_is_serializable() {
    let digest = Digest::new(fingerprint(), 1);
    assert_ser_tokens(
        &digest,
        &[
            Token::Struct {
                name: "Digest",
                len: 2,
            },
            Token::Str("fingerprint"),
            Token::Str(HEX),
            Token::Str("size_bytes"),
            Token::U64(1),
            Token::StructEnd,
        ],
    );
}

#[test]
fn sync_copy_and_hash() {
    let input = b"every day is like this day";
    let mut output = Vec::new();
    let digest = crate::sync_copy_and_hash(&mut &input[..], &mut output).unwrap();
    assert_eq!(output, input);
    assert_eq!(digest, Digest::of_bytes(input));
}

#[tokio::test]
async fn async_copy_and_hash() {
    let input = b"every day is like this day";
    let mut output = Vec::new();
    let digest = crate::async_copy_and_hash(&mut &input[..], &mut output)
        .await
        .unwrap();
    assert_eq!(output, input);
    assert_eq!(digest, Digest::of_bytes(input));
}

#[tokio::test]
async fn async_verified_copy_immutable_checks_length_only() {
    let input = b"some bytes";
    let expected = Digest::of_bytes(input);

    let mut output = Vec::new();
    assert!(
        crate::async_verified_copy(expected, true, &mut &input[..], &mut output)
            .await
            .unwrap()
    );

    // Same length, different content: an immutable copy trusts the source.
    let lying = b"SOME BYTES";
    let mut output = Vec::new();
    assert!(
        crate::async_verified_copy(expected, true, &mut &lying[..], &mut output)
            .await
            .unwrap()
    );

    // But a mutable copy does not.
    let mut output = Vec::new();
    assert!(
        !crate::async_verified_copy(expected, false, &mut &lying[..], &mut output)
            .await
            .unwrap()
    );
}
