// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use serde::de::Error as SerdeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::digest::Digest as Sha256Api;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FINGERPRINT_SIZE: usize = 32;

// Streaming copies hash and forward one buffer at a time.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// The SHA-256 fingerprint of zero bytes.
pub const EMPTY_FINGERPRINT: Fingerprint = Fingerprint([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, //
    0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24, //
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, //
    0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55, //
]);

pub const EMPTY_DIGEST: Digest = Digest {
    hash: EMPTY_FINGERPRINT,
    size_bytes: 0,
};

///
/// The SHA-256 hash of some byte content: the identity half of a `Digest`.
///
#[derive(Clone, Copy, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub fn new(bytes: [u8; FINGERPRINT_SIZE]) -> Fingerprint {
        Fingerprint(bytes)
    }

    ///
    /// Converts a slice to a Fingerprint, panicking on a length mismatch. Use only for values
    /// which are already known to be fingerprints (e.g. storage keys written by this process).
    ///
    pub fn from_bytes_unsafe(bytes: &[u8]) -> Fingerprint {
        let bytes: [u8; FINGERPRINT_SIZE] = bytes
            .try_into()
            .unwrap_or_else(|_| panic!("Expected {FINGERPRINT_SIZE} bytes, got {}", bytes.len()));
        Fingerprint(bytes)
    }

    pub fn from_hex_string(hex_string: &str) -> Result<Fingerprint, String> {
        let bytes = hex::decode(hex_string)
            .map_err(|e| format!("Invalid hex for a fingerprint: {e:?}"))?;
        let bytes: [u8; FINGERPRINT_SIZE] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            format!(
                "A fingerprint must represent {FINGERPRINT_SIZE} bytes: got {}",
                bytes.len()
            )
        })?;
        Ok(Fingerprint(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    #[allow(clippy::wrong_self_convention)]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    ///
    /// Because a Fingerprint is the output of a strong hash function, any prefix of it is
    /// itself a strong (if shorter) hash.
    ///
    pub fn prefix_hash(&self) -> u64 {
        u64::from_be_bytes(self.0[..8].try_into().unwrap())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{self}>")
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::from_hex_string(s)
    }
}

impl TryFrom<&str> for Fingerprint {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Fingerprint::from_hex_string(s)
    }
}

// Fingerprints cross serialization boundaries as their hex rendering.
impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_string = String::deserialize(deserializer)?;
        Fingerprint::from_hex_string(&hex_string).map_err(D::Error::custom)
    }
}

///
/// A Digest is a Fingerprint paired with the length in bytes of the fingerprinted content.
///
/// It carries the same information as a Remote Execution API `Digest` proto, in a form which is
/// cheap to copy and compare: two artifacts with equal Digests are the same artifact.
///
#[derive(
    Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct Digest {
    #[serde(rename = "fingerprint")]
    pub hash: Fingerprint,
    pub size_bytes: usize,
}

impl Digest {
    pub fn new(hash: Fingerprint, size_bytes: usize) -> Digest {
        Digest { hash, size_bytes }
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(bytes);
        hasher.finish()
    }
}

///
/// An incremental content hasher which tracks the byte count, and so produces a `Digest` rather
/// than a bare hash.
///
pub struct Hasher {
    hash: Sha256,
    size_bytes: usize,
}

impl Hasher {
    pub fn new() -> Hasher {
        Hasher {
            hash: Sha256::new(),
            size_bytes: 0,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hash.update(bytes);
        self.size_bytes += bytes.len();
    }

    pub fn finish(self) -> Digest {
        let hash: [u8; FINGERPRINT_SIZE] = self.hash.finalize().into();
        Digest::new(Fingerprint::new(hash), self.size_bytes)
    }
}

///
/// A Fingerprint aged by the time of its last use, for garbage collection purposes.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct AgedFingerprint {
    // Expiration time, in seconds since the epoch. Entries with the lowest expiration are the
    // best candidates for garbage collection, so this field must sort first.
    pub expired_seconds_ago: u64,
    pub fingerprint: Fingerprint,
    pub size_bytes: usize,
}

///
/// Copy all bytes from reader to writer, returning the Digest of what was copied.
///
pub fn sync_copy_and_hash<R: ?Sized, W: ?Sized>(
    reader: &mut R,
    writer: &mut W,
) -> io::Result<Digest>
where
    R: Read,
    W: Write,
{
    let mut hasher = Hasher::new();
    let mut buffer = [0u8; COPY_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        writer.write_all(&buffer[..read])?;
    }
    Ok(hasher.finish())
}

///
/// Copy from reader to writer and return whether the copied data matched expected_digest.
///
/// When the source is declared immutable we trust its content and only validate the length,
/// skipping the hashing work.
///
pub fn sync_verified_copy<R: ?Sized, W: ?Sized>(
    expected_digest: Digest,
    data_is_immutable: bool,
    reader: &mut R,
    writer: &mut W,
) -> io::Result<bool>
where
    R: Read,
    W: Write,
{
    if data_is_immutable {
        let copied = io::copy(reader, writer)?;
        Ok(copied as usize == expected_digest.size_bytes)
    } else {
        Ok(expected_digest == sync_copy_and_hash(reader, writer)?)
    }
}

///
/// Copy all bytes from reader to writer, returning the Digest of what was copied.
///
pub async fn async_copy_and_hash<R, W>(reader: &mut R, writer: &mut W) -> io::Result<Digest>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut hasher = Hasher::new();
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        writer.write_all(&buffer[..read]).await?;
    }
    writer.flush().await?;
    Ok(hasher.finish())
}

///
/// Copy from reader to writer and return whether the copied data matched expected_digest. See
/// `sync_verified_copy`.
///
pub async fn async_verified_copy<R, W>(
    expected_digest: Digest,
    data_is_immutable: bool,
    reader: &mut R,
    writer: &mut W,
) -> io::Result<bool>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    if data_is_immutable {
        let copied = tokio::io::copy(reader, writer).await?;
        Ok(copied as usize == expected_digest.size_bytes)
    } else {
        Ok(expected_digest == async_copy_and_hash(reader, writer).await?)
    }
}

#[cfg(test)]
mod tests;
