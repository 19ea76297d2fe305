//! # External Collaborators
//!
//! §6 names several components this crate consumes but does not implement:
//! the WIM header/XML/integrity-table parser, the LZX/XPRESS decompressors,
//! the archive rewriter, the SHA-1 hasher, and the character-set converter.
//! This module defines their contracts as traits so the rest of the crate
//! can be written and tested against them without pulling in an actual WIM
//! codec. A production binary supplies real implementations; tests use the
//! simple in-memory ones at the bottom of this file.

use std::path::Path;

use crate::catalog::{ArchiveResource, LookupTable};
use crate::dentry::DentryTree;
use crate::error::WimResult;
use crate::hash::ContentHash;

/// Produces the initial lookup table and dentry tree for a selected image
/// (§6 "Archive catalog loader").
pub trait CatalogLoader: Send + Sync {
    fn load(&self, image_index: u32) -> WimResult<(DentryTree, LookupTable)>;
}

/// Reads decompressed bytes out of an archive-backed resource (§6).
///
/// `read_resource(resource, skip, buf)` fills `buf` with up to `buf.len()`
/// decompressed bytes starting `skip` bytes into the resource's logical
/// content, returning the number of bytes actually written.
pub trait ResourceReader: Send + Sync {
    fn read_resource(&self, resource: &ArchiveResource, skip: u64, buf: &mut [u8]) -> WimResult<usize>;
}

/// Serializes the modified image to a new on-disk archive (§6 "Archive
/// overwriter"), walking the dentry tree plus catalog.
pub trait ArchiveOverwriter: Send + Sync {
    fn overwrite(
        &self,
        dentries: &DentryTree,
        catalog: &LookupTable,
        check_integrity: bool,
    ) -> WimResult<()>;
}

/// Computes the content hash of a file already materialized on disk (§6
/// "Content hasher computing SHA-1").
pub trait ContentHasher: Send + Sync {
    fn hash_file(&self, path: &Path) -> WimResult<ContentHash>;
}

/// Produces paired native + archive-encoded names for a path component (§6
/// "Character-encoding converter").
pub trait NameCodec: Send + Sync {
    fn encode(&self, native_name: &str) -> WimResult<Vec<u8>>;
    fn decode(&self, archive_name: &[u8]) -> WimResult<String>;
}

/// Serializes/deserializes a symlink target into the bytes stored in a
/// reparse-point dentry's primary stream (§4.6).
pub trait ReparsePointCodec: Send + Sync {
    fn encode_symlink(&self, target: &str) -> WimResult<Vec<u8>>;
    fn decode_symlink(&self, data: &[u8]) -> WimResult<String>;
}

/// A `ContentHasher` backed by this crate's own SHA-1 implementation
/// ([`crate::hash::ContentHash::of_bytes`]). This is the one external
/// collaborator contract simple enough not to need mocking in production:
/// SHA-1 is part of this crate's own stack, unlike WIM codec details.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha1ContentHasher;

impl ContentHasher for Sha1ContentHasher {
    fn hash_file(&self, path: &Path) -> WimResult<ContentHash> {
        let data = std::fs::read(path)?;
        Ok(ContentHash::of_bytes(&data))
    }
}

/// A `NameCodec` that passes native names through unchanged as UTF-8 bytes.
/// Real WIM archives use UTF-16LE; swap this out for a proper converter in
/// production. Suitable for tests and for archives that only ever see ASCII
/// names.
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8NameCodec;

impl NameCodec for Utf8NameCodec {
    fn encode(&self, native_name: &str) -> WimResult<Vec<u8>> {
        Ok(native_name.as_bytes().to_vec())
    }

    fn decode(&self, archive_name: &[u8]) -> WimResult<String> {
        String::from_utf8(archive_name.to_vec()).map_err(|_| crate::error::WimError::InvalidArgument)
    }
}

/// A `ReparsePointCodec` that stores the symlink target as plain UTF-8
/// bytes with no reparse-buffer framing. Real WIM reparse points wrap the
/// target in a `REPARSE_DATA_BUFFER`; this stand-in is enough to exercise
/// `readlink`/`symlink` round-trips in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainReparsePointCodec;

impl ReparsePointCodec for PlainReparsePointCodec {
    fn encode_symlink(&self, target: &str) -> WimResult<Vec<u8>> {
        Ok(target.as_bytes().to_vec())
    }

    fn decode_symlink(&self, data: &[u8]) -> WimResult<String> {
        String::from_utf8(data.to_vec()).map_err(|_| crate::error::WimError::InvalidArgument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sha1_hasher_matches_direct_hash() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        let hasher = Sha1ContentHasher;
        assert_eq!(hasher.hash_file(file.path()).unwrap(), ContentHash::of_bytes(b"hello"));
    }

    #[test]
    fn utf8_codec_round_trips() {
        let codec = Utf8NameCodec;
        let encoded = codec.encode("résumé.txt").unwrap();
        assert_eq!(codec.decode(&encoded).unwrap(), "résumé.txt");
    }

    #[test]
    fn reparse_codec_round_trips() {
        let codec = PlainReparsePointCodec;
        let encoded = codec.encode_symlink("../target").unwrap();
        assert_eq!(codec.decode_symlink(&encoded).unwrap(), "../target");
    }
}
