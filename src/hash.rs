//! # Content Hashing
//!
//! A WIM archive is content-addressed: every stream (a file's primary data, or
//! one of its alternate data streams) is named by the SHA-1 digest of its
//! uncompressed bytes. This module defines the hash type used as the key into
//! the [`crate::catalog::LookupTable`], plus the two ways a hash comes into
//! being during a mount:
//!
//! * read from the archive's integrity/metadata tables at mount time (real
//!   content hash, computed by the archive's original writer), or
//! * generated at random when a stream diverges into staging, since its real
//!   content won't be known until commit time rehashes it (see
//!   [`crate::commit`]).

use std::fmt;

use hex::{FromHex, ToHex};
use rand::RngCore;

/// Width in bytes of a WIM content hash (SHA-1 digest).
pub const WIM_HASH_SIZE: usize = 20;

/// A SHA-1 content hash, used both as a real digest and, transiently, as a
/// random placeholder for a staged stream (§9: placeholder hashes keep the
/// catalog hash-keyed during the mount even though the real content isn't
/// hashed until commit).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; WIM_HASH_SIZE]);

impl ContentHash {
    pub const fn from_bytes(bytes: [u8; WIM_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; WIM_HASH_SIZE] {
        &self.0
    }

    /// Generates a random placeholder hash. Used by the staging store when a
    /// stream diverges and by the FD table when allocating a lookup entry for
    /// a brand-new empty file; collisions are vanishingly unlikely but are
    /// still handled by retrying at the call site (see
    /// `StagingStore::create_staging_file`).
    pub fn random() -> Self {
        let mut bytes = [0u8; WIM_HASH_SIZE];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes: Vec<u8> = Vec::from_hex(s).ok()?;
        let array: [u8; WIM_HASH_SIZE] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn to_hex(&self) -> String {
        self.0.encode_hex()
    }

    /// Computes the SHA-1 digest of a byte slice. Used by the default
    /// [`crate::external::ContentHasher`] implementation at commit time.
    pub fn of_bytes(data: &[u8]) -> Self {
        use sha1::{Digest, Sha1};
        let mut hasher = Sha1::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut bytes = [0u8; WIM_HASH_SIZE];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Default for ContentHash {
    /// The all-zero hash, used as the canonical "empty stream" marker.
    fn default() -> Self {
        Self([0u8; WIM_HASH_SIZE])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_hashes_differ() {
        assert_ne!(ContentHash::random(), ContentHash::random());
    }

    #[test]
    fn hex_round_trip() {
        let hash = ContentHash::of_bytes(b"hello");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), WIM_HASH_SIZE * 2);
        assert_eq!(ContentHash::from_hex(&hex), Some(hash));
    }

    #[test]
    fn of_bytes_matches_known_sha1() {
        // echo -n hello | sha1sum
        let hash = ContentHash::of_bytes(b"hello");
        assert_eq!(hash.to_hex(), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
    }
}
