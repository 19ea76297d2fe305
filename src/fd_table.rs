//! # FD Table
//!
//! Per-lookup-entry dense array of open file handles (§3 "Open file handle",
//! §4.2). Allocation returns the lowest free index, and that index stays
//! stable for the handle's lifetime — the hard-link-group split (§4.3 step
//! 4) depends on this: it relocates handles between lookup entries by
//! reusing the same slot-index convention in the new entry, so open callers
//! never see their file handle number change.

use std::fs::File;

use crate::dentry::{DentryId, LinkGroupId};
use crate::error::{WimError, WimResult};

/// Slots grow in chunks of this size, up to `MAX_FDS` (§4.2).
pub const GROWTH_CHUNK: usize = 8;
pub const MAX_FDS: usize = 65_535;

/// One open file handle (§3). `dentry` is nullable because an `unlink` on a
/// dentry with open handles survives the removal (§4.4): the handle keeps
/// working, but no longer points anywhere in the tree.
#[derive(Debug)]
pub struct OpenHandle {
    pub dentry: Option<DentryId>,
    /// `None` when reads are served directly from the archive resource
    /// reader rather than a materialized staging file.
    pub staging_file: Option<File>,
    /// Snapshot of the owning dentry's hard-link-group id at open time, used
    /// by the staging-divergence split to decide which handles transfer to
    /// the new lookup entry without walking the group's dentry list (§9
    /// design note).
    pub link_group: LinkGroupId,
}

/// Dense, slot-stable array of open handles belonging to one lookup entry.
#[derive(Debug, Default)]
pub struct FdTable {
    slots: Vec<Option<OpenHandle>>,
    open_count: usize,
}

impl FdTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_allocated(&self) -> usize {
        self.slots.len()
    }

    pub fn num_open(&self) -> usize {
        self.open_count
    }

    pub fn get(&self, slot: usize) -> Option<&OpenHandle> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut OpenHandle> {
        self.slots.get_mut(slot).and_then(|s| s.as_mut())
    }

    /// Allocates the lowest free slot, growing the backing array by
    /// `GROWTH_CHUNK` at a time, up to `MAX_FDS`.
    pub fn allocate(&mut self, handle: OpenHandle) -> WimResult<usize> {
        if let Some(slot) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[slot] = Some(handle);
            self.open_count += 1;
            return Ok(slot);
        }
        if self.slots.len() >= MAX_FDS {
            return Err(WimError::Invariant("fd table exhausted".into()));
        }
        let slot = self.slots.len();
        let grow_to = (slot + GROWTH_CHUNK).min(MAX_FDS).max(slot + 1);
        self.slots.resize_with(grow_to, || None);
        self.slots[slot] = Some(handle);
        self.open_count += 1;
        Ok(slot)
    }

    /// Inserts a handle at a caller-chosen slot index, used by the
    /// divergence split to preserve the slot a transferred handle already
    /// had. Grows the table if needed; the slot must currently be empty.
    pub fn insert_at(&mut self, slot: usize, handle: OpenHandle) -> WimResult<()> {
        if slot >= self.slots.len() {
            let grow_to = slot + 1;
            self.slots.resize_with(grow_to, || None);
        }
        if self.slots[slot].is_some() {
            return Err(WimError::Invariant("fd slot already occupied".into()));
        }
        self.slots[slot] = Some(handle);
        self.open_count += 1;
        Ok(())
    }

    pub fn release(&mut self, slot: usize) -> WimResult<OpenHandle> {
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or(WimError::Invariant("fd slot out of range".into()))?
            .take()
            .ok_or(WimError::Invariant("fd slot already empty".into()))?;
        self.open_count -= 1;
        Ok(entry)
    }

    /// Removes and returns every slot whose handle's `link_group` matches
    /// `group`, paired with the slot index it was removed from — exactly
    /// the "transfer" step of §4.3's divergence split. The caller reinserts
    /// each handle into the new entry's table (typically at a fresh,
    /// compacted index) and records the (old, new) pair as a relocation.
    pub fn drain_matching_group(&mut self, group: LinkGroupId) -> Vec<(usize, OpenHandle)> {
        let mut drained = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let matches = matches!(slot, Some(h) if h.link_group == group);
            if matches {
                drained.push((index, slot.take().unwrap()));
                self.open_count -= 1;
            }
        }
        drained
    }

    /// Nulls the `dentry` back-pointer of every open handle whose slot
    /// currently points at `dentry_id` (§4.4 unlink: survive-but-orphan).
    pub fn orphan_handles_pointing_at(&mut self, dentry_id: DentryId) {
        for slot in self.slots.iter_mut().flatten() {
            if slot.dentry == Some(dentry_id) {
                slot.dentry = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(group: u64) -> OpenHandle {
        OpenHandle {
            dentry: Some(0),
            staging_file: None,
            link_group: LinkGroupId(group),
        }
    }

    #[test]
    fn allocate_returns_lowest_free_index() {
        let mut table = FdTable::new();
        let a = table.allocate(handle(1)).unwrap();
        let b = table.allocate(handle(1)).unwrap();
        table.release(a).unwrap();
        let c = table.allocate(handle(1)).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(c, 0);
    }

    #[test]
    fn grows_in_chunks_of_eight() {
        let mut table = FdTable::new();
        for _ in 0..9 {
            table.allocate(handle(1)).unwrap();
        }
        assert!(table.num_allocated() >= 9);
        assert_eq!(table.num_allocated() % GROWTH_CHUNK, 0);
    }

    #[test]
    fn drain_matching_group_compacts_and_preserves_count() {
        let mut table = FdTable::new();
        table.allocate(handle(1)).unwrap();
        table.allocate(handle(2)).unwrap();
        table.allocate(handle(1)).unwrap();
        let drained = table.drain_matching_group(LinkGroupId(1));
        assert_eq!(drained.len(), 2);
        assert_eq!(table.num_open(), 1);
        for (old_slot, _handle) in &drained {
            assert!(*old_slot < 3);
        }
    }

    #[test]
    fn orphaning_nulls_dentry_pointer_without_closing() {
        let mut table = FdTable::new();
        let slot = table.allocate(handle(1)).unwrap();
        table.orphan_handles_pointing_at(0);
        assert_eq!(table.get(slot).unwrap().dentry, None);
        assert_eq!(table.num_open(), 1);
    }
}
