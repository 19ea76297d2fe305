//! # Resource Catalog
//!
//! The hash-indexed lookup table (§3 "Lookup-table (catalog)"). Maps a
//! content hash to a [`LookupEntry`] describing where that stream lives —
//! either an offset/size/flags tuple into the backing archive, or a path
//! into the staging store — plus its reference count and open-fd table.
//!
//! The catalog never destroys an entry itself; callers decide when an
//! entry's refcount and open-fd count have both reached zero (§5) and call
//! [`LookupTable::remove`] at that point. This mirrors §3's ownership note:
//! "the catalog owns lookup entries," but the *decision* to free one belongs
//! to whichever algorithm (unlink, divergence, commit dedup) just dropped
//! the last reference.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{WimError, WimResult};
use crate::fd_table::FdTable;
use crate::hash::ContentHash;

/// Where and how to read a stream directly out of the archive (§3, §6).
#[derive(Debug, Clone)]
pub struct ArchiveResource {
    pub offset: u64,
    pub compressed_size: u64,
    pub original_size: u64,
    /// Compression type / resource flags, passed through opaquely to the
    /// archive resource reader (§6).
    pub flags: u32,
}

/// Exactly one of these is live per `LookupEntry` (§3, §8 invariant).
#[derive(Debug)]
pub enum Backing {
    Archive(ArchiveResource),
    Staging(PathBuf),
}

/// One catalog record for a unique content stream (§3).
#[derive(Debug)]
pub struct LookupEntry {
    pub hash: ContentHash,
    pub refcount: u64,
    pub backing: Backing,
    /// Logical size of the stream. For an archive-backed entry this equals
    /// `backing.original_size`; for a staged entry it is tracked
    /// independently since truncate/write can change it without touching
    /// the archive descriptor (§4.5).
    pub original_size: u64,
    pub fds: FdTable,
}

impl LookupEntry {
    pub fn new_archive_backed(hash: ContentHash, resource: ArchiveResource) -> Self {
        let original_size = resource.original_size;
        Self {
            hash,
            refcount: 0,
            backing: Backing::Archive(resource),
            original_size,
            fds: FdTable::new(),
        }
    }

    pub fn new_staged(hash: ContentHash, path: PathBuf, size: u64) -> Self {
        Self {
            hash,
            refcount: 0,
            backing: Backing::Staging(path),
            original_size: size,
            fds: FdTable::new(),
        }
    }

    pub fn is_staged(&self) -> bool {
        matches!(self.backing, Backing::Staging(_))
    }

    pub fn staging_path(&self) -> Option<&PathBuf> {
        match &self.backing {
            Backing::Staging(p) => Some(p),
            Backing::Archive(_) => None,
        }
    }

    pub fn archive_resource(&self) -> Option<&ArchiveResource> {
        match &self.backing {
            Backing::Archive(r) => Some(r),
            Backing::Staging(_) => None,
        }
    }

    /// §8 invariant: `E.refcount == 0 ⇒ E.num_opened_fds > 0` (else the
    /// entry would already be destroyed). This is the flip side, used by
    /// callers deciding whether to free the entry now.
    pub fn is_orphaned(&self) -> bool {
        self.refcount == 0 && self.fds.num_open() == 0
    }
}

/// The catalog: content hash → lookup entry (§3).
#[derive(Debug, Default)]
pub struct LookupTable {
    entries: HashMap<ContentHash, LookupEntry>,
}

impl LookupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hash: &ContentHash) -> Option<&LookupEntry> {
        self.entries.get(hash)
    }

    pub fn get_mut(&mut self, hash: &ContentHash) -> Option<&mut LookupEntry> {
        self.entries.get_mut(hash)
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn insert(&mut self, entry: LookupEntry) {
        self.entries.insert(entry.hash, entry);
    }

    pub fn remove(&mut self, hash: &ContentHash) -> Option<LookupEntry> {
        self.entries.remove(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ContentHash, &LookupEntry)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ContentHash, &mut LookupEntry)> {
        self.entries.iter_mut()
    }

    /// Increments an existing entry's refcount by `by`. The entry must
    /// already exist; callers that might be creating it for the first time
    /// should `insert` first.
    pub fn bump_refcount(&mut self, hash: &ContentHash, by: u64) -> WimResult<()> {
        let entry = self.get_mut(hash).ok_or(WimError::NotFound)?;
        entry.refcount += by;
        Ok(())
    }

    /// Decrements an entry's refcount by `by`. If the entry becomes orphaned
    /// (refcount and open-fd count both zero), it is removed from the
    /// catalog and returned to the caller, who is responsible for deleting
    /// any backing staging file (§4.4, §5 deferred destruction).
    pub fn decrement_refcount(&mut self, hash: &ContentHash, by: u64) -> WimResult<Option<LookupEntry>> {
        let should_remove = {
            let entry = self.get_mut(hash).ok_or(WimError::NotFound)?;
            entry.refcount = entry.refcount.saturating_sub(by);
            entry.is_orphaned()
        };
        if should_remove {
            Ok(self.remove(hash))
        } else {
            Ok(None)
        }
    }

    /// Total refcount across the whole catalog — used by tests asserting
    /// the §8 invariant that this equals the number of effective-stream
    /// references in the dentry tree.
    pub fn total_refcount(&self) -> u64 {
        self.entries.values().map(|e| e.refcount).sum()
    }
}
