//! # Dentry Tree
//!
//! The in-memory directory tree (§3, §4.1, §4.4). Dentries live in a flat
//! arena (`Vec<Option<Dentry>>`) addressed by [`DentryId`] rather than as a
//! pointer graph, which sidesteps the aliasing that a parent/child/sibling
//! `Rc<RefCell<_>>` graph would otherwise force; children of one parent are
//! linked through a circular doubly-linked sibling list exactly as described
//! in §3, just with arena indices standing in for pointers.
//!
//! A dentry that has been unlinked but is still held open (`num_times_opened
//! > 0`) is *not* removed from the arena — it is detached from its parent's
//! sibling ring and marked `removed`. The arena slot is only freed when the
//! last open handle against it closes (§5's "deferred destruction").

use std::collections::HashMap;
use std::time::SystemTime;

use crate::error::{WimError, WimResult};
use crate::hash::ContentHash;

pub type DentryId = usize;

/// Hard-link group identity. All dentries created by `link()` from a common
/// source share a group id and the same primary-stream hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkGroupId(pub u64);

/// Which effective stream of a dentry an operation targets (§3: "primary
/// plus its ADS list; each effective stream is a distinct lookup target").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSlot {
    Primary,
    Ads(usize),
}

/// Subordinate named stream attached to a dentry (§3).
#[derive(Debug, Clone)]
pub struct AdsEntry {
    pub name: String,
    pub hash: ContentHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DentryKind {
    File,
    Directory,
    Symlink,
}

/// A node in the directory tree (§3).
#[derive(Debug)]
pub struct Dentry {
    pub name: String,
    pub archive_name: Vec<u8>,
    pub kind: DentryKind,
    pub parent: Option<DentryId>,
    pub first_child: Option<DentryId>,
    /// Circular among children of one parent; a lone child points to itself.
    pub next_sibling: DentryId,
    pub prev_sibling: DentryId,
    pub attributes: u32,
    pub reparse_tag: u32,
    pub created: SystemTime,
    pub accessed: SystemTime,
    pub modified: SystemTime,
    pub metadata_changed: SystemTime,
    pub primary_hash: ContentHash,
    pub ads: Vec<AdsEntry>,
    pub link_group: LinkGroupId,
    /// Hard-link identity group: shared by every dentry `link()` ever
    /// produced from a common source, for the life of all of them. Distinct
    /// from `link_group`, which is re-seeded fresh on every `link()` so each
    /// clone gets its own write-divergence scope (see `clone_as_link`);
    /// `nlink` has to survive that re-seeding, so it's tracked separately.
    pub inode_group: LinkGroupId,
    pub is_master: bool,
    /// Deferred-deletion counter: while this is > 0, the dentry survives
    /// unlinking (§3 invariant, §5 lifecycle).
    pub num_times_opened: u32,
    /// Set once the dentry has been spliced out of its parent's children,
    /// while still reachable through an open handle.
    pub removed: bool,
}

impl Dentry {
    fn new(
        id: DentryId,
        name: String,
        archive_name: Vec<u8>,
        kind: DentryKind,
        parent: Option<DentryId>,
        link_group: LinkGroupId,
        now: SystemTime,
    ) -> Self {
        Self {
            name,
            archive_name,
            kind,
            parent,
            first_child: None,
            next_sibling: id,
            prev_sibling: id,
            attributes: 0,
            reparse_tag: 0,
            created: now,
            accessed: now,
            modified: now,
            metadata_changed: now,
            primary_hash: ContentHash::default(),
            ads: Vec::new(),
            link_group,
            inode_group: link_group,
            is_master: true,
            num_times_opened: 0,
            removed: false,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == DentryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == DentryKind::File
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == DentryKind::Symlink
    }

    pub fn touch_all_timestamps(&mut self, now: SystemTime) {
        self.accessed = now;
        self.modified = now;
        self.metadata_changed = now;
    }

    /// All effective streams on this dentry (primary + every ADS), per §3.
    pub fn effective_streams(&self) -> Vec<(StreamSlot, ContentHash)> {
        let mut streams = vec![(StreamSlot::Primary, self.primary_hash)];
        for (i, ads) in self.ads.iter().enumerate() {
            streams.push((StreamSlot::Ads(i), ads.hash));
        }
        streams
    }

    pub fn stream_hash(&self, slot: StreamSlot) -> ContentHash {
        match slot {
            StreamSlot::Primary => self.primary_hash,
            StreamSlot::Ads(i) => self.ads[i].hash,
        }
    }

    pub fn set_stream_hash(&mut self, slot: StreamSlot, hash: ContentHash) {
        match slot {
            StreamSlot::Primary => self.primary_hash = hash,
            StreamSlot::Ads(i) => self.ads[i].hash = hash,
        }
    }
}

/// The in-memory directory tree, rooted at `DentryTree::ROOT`.
#[derive(Debug)]
pub struct DentryTree {
    arena: Vec<Option<Dentry>>,
    next_link_group: u64,
}

impl DentryTree {
    pub const ROOT: DentryId = 0;

    pub fn new(now: SystemTime) -> Self {
        let root = Dentry::new(
            Self::ROOT,
            String::new(),
            Vec::new(),
            DentryKind::Directory,
            None,
            LinkGroupId(0),
            now,
        );
        Self {
            arena: vec![Some(root)],
            next_link_group: 1,
        }
    }

    pub fn fresh_link_group(&mut self) -> LinkGroupId {
        let id = LinkGroupId(self.next_link_group);
        self.next_link_group += 1;
        id
    }

    pub fn get(&self, id: DentryId) -> WimResult<&Dentry> {
        self.arena
            .get(id)
            .and_then(|slot| slot.as_ref())
            .ok_or(WimError::NotFound)
    }

    pub fn get_mut(&mut self, id: DentryId) -> WimResult<&mut Dentry> {
        self.arena
            .get_mut(id)
            .and_then(|slot| slot.as_mut())
            .ok_or(WimError::NotFound)
    }

    /// Inserts a brand-new dentry under `parent`, splicing it into the
    /// circular sibling list. Fails with `Exists` if `name` collides (§3
    /// invariant: children of one parent have distinct names).
    pub fn insert(
        &mut self,
        parent: DentryId,
        name: String,
        archive_name: Vec<u8>,
        kind: DentryKind,
        now: SystemTime,
    ) -> WimResult<DentryId> {
        if self.find_child(parent, &name)?.is_some() {
            return Err(WimError::Exists);
        }
        let link_group = self.fresh_link_group();
        let id = self.arena.len();
        self.arena.push(Some(Dentry::new(
            id,
            name,
            archive_name,
            kind,
            Some(parent),
            link_group,
            now,
        )));
        self.splice_in(parent, id)?;
        Ok(id)
    }

    /// Clones `source`'s streams into a new dentry under `parent` (§4.4
    /// `link`). The clone gets its own fresh link group rather than joining
    /// `source`'s: §8's worked example has a written-through path diverge
    /// into its own lookup entry while the other path it was linked from
    /// keeps reading the original content, which only happens if the two
    /// stay independent divergence scopes despite sharing content at link
    /// time (see the Open Question note in `DESIGN.md`). The clone is
    /// marked a slave so the original master stays authoritative for
    /// naming purposes.
    pub fn clone_as_link(
        &mut self,
        source: DentryId,
        parent: DentryId,
        new_name: String,
        new_archive_name: Vec<u8>,
        now: SystemTime,
    ) -> WimResult<DentryId> {
        if self.find_child(parent, &new_name)?.is_some() {
            return Err(WimError::Exists);
        }
        let (kind, is_file, primary_hash, ads, attributes, inode_group) = {
            let src = self.get(source)?;
            (src.kind, src.is_file(), src.primary_hash, src.ads.clone(), src.attributes, src.inode_group)
        };
        if !is_file {
            return Err(WimError::InvalidArgument);
        }
        let link_group = self.fresh_link_group();
        let mut clone = Dentry::new(0, new_name, new_archive_name, kind, Some(parent), link_group, now);
        clone.primary_hash = primary_hash;
        clone.ads = ads;
        clone.attributes = attributes;
        clone.inode_group = inode_group;
        clone.is_master = false;
        let id = self.arena.len();
        clone.next_sibling = id;
        clone.prev_sibling = id;
        self.arena.push(Some(clone));
        self.splice_in(parent, id)?;
        Ok(id)
    }

    fn splice_in(&mut self, parent: DentryId, id: DentryId) -> WimResult<()> {
        let first_child = self.get(parent)?.first_child;
        match first_child {
            None => {
                self.get_mut(parent)?.first_child = Some(id);
            }
            Some(first) => {
                let last = self.get(first)?.prev_sibling;
                self.get_mut(last)?.next_sibling = id;
                self.get_mut(id)?.prev_sibling = last;
                self.get_mut(first)?.prev_sibling = id;
                self.get_mut(id)?.next_sibling = first;
            }
        }
        Ok(())
    }

    /// Splices `id` out of its parent's sibling ring without destroying it.
    /// Used by both `unlink`/`rmdir` (§4.4) and `rename`'s re-parent step.
    fn splice_out(&mut self, id: DentryId) -> WimResult<()> {
        let (parent, next, prev) = {
            let dentry = self.get(id)?;
            (dentry.parent, dentry.next_sibling, dentry.prev_sibling)
        };
        let parent = parent.ok_or(WimError::InvalidArgument)?;
        if next == id {
            self.get_mut(parent)?.first_child = None;
        } else {
            self.get_mut(prev)?.next_sibling = next;
            self.get_mut(next)?.prev_sibling = prev;
            if self.get(parent)?.first_child == Some(id) {
                self.get_mut(parent)?.first_child = Some(next);
            }
        }
        Ok(())
    }

    pub fn children(&self, parent: DentryId) -> WimResult<Vec<DentryId>> {
        let mut out = Vec::new();
        let first = match self.get(parent)?.first_child {
            None => return Ok(out),
            Some(f) => f,
        };
        let mut current = first;
        loop {
            out.push(current);
            current = self.get(current)?.next_sibling;
            if current == first {
                break;
            }
        }
        Ok(out)
    }

    pub fn find_child(&self, parent: DentryId, name: &str) -> WimResult<Option<DentryId>> {
        for child in self.children(parent)? {
            if self.get(child)?.name == name {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    /// Walks the tree from the root, splitting on `/` (§4.1). When
    /// `windows_ads` is set, a trailing `:streamname` on the final component
    /// selects an ADS (§6 "windows" stream-interface mode); otherwise the
    /// whole path resolves as a literal name and ADS access goes through the
    /// xattr callbacks instead (§4.1, §6 "xattr"/"none" modes).
    pub fn resolve(&self, path: &str, windows_ads: bool) -> WimResult<(DentryId, StreamSlot)> {
        let (path, stream_name) = match path.rsplit_once(':') {
            // Only split on the final component, never inside a directory
            // segment (a ':' before the last '/' is not stream syntax).
            Some((base, stream)) if windows_ads && !stream.contains('/') && base.rsplit('/').next() != Some("") => {
                (base, Some(stream))
            }
            _ => (path, None),
        };
        let mut current = Self::ROOT;
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        for (i, component) in components.iter().enumerate() {
            if !self.get(current)?.is_directory() {
                return Err(WimError::NotADirectory);
            }
            current = self
                .find_child(current, component)?
                .ok_or(WimError::NotFound)?;
            let _ = i;
        }
        let slot = match stream_name {
            None => StreamSlot::Primary,
            Some(name) => {
                let dentry = self.get(current)?;
                match dentry.ads.iter().position(|a| a.name == name) {
                    Some(idx) => StreamSlot::Ads(idx),
                    None => return Err(WimError::NotFound),
                }
            }
        };
        Ok((current, slot))
    }

    /// Counts how many dentries in `group` reference `hash` at `slot`'s
    /// stream position — the `link_group_size` of §4.3 step 3. `slot` is
    /// matched by position (Primary vs the same ADS index) since a sibling
    /// clone has the identical ADS layout.
    pub fn link_group_stream_count(
        &self,
        group: LinkGroupId,
        slot: StreamSlot,
        hash: ContentHash,
    ) -> usize {
        self.arena
            .iter()
            .filter_map(|d| d.as_ref())
            .filter(|d| !d.removed && d.link_group == group)
            .filter(|d| match slot {
                StreamSlot::Primary => d.primary_hash == hash,
                StreamSlot::Ads(i) => d.ads.get(i).map(|a| a.hash) == Some(hash),
            })
            .count()
    }

    /// Counts live dentries sharing `group` as their hard-link identity —
    /// the POSIX `nlink` count (§4.3, §6). Unlike `link_group_stream_count`
    /// this ignores the per-clone divergence scope entirely: two dentries
    /// stay the same "inode" for `nlink` purposes even after one of them
    /// diverges into its own staging copy.
    pub fn inode_group_count(&self, group: LinkGroupId) -> usize {
        self.arena
            .iter()
            .filter_map(|d| d.as_ref())
            .filter(|d| !d.removed && d.inode_group == group)
            .count()
    }

    /// Adds a new alternate data stream to `dentry` (§4.6 ADS-mode `mknod`,
    /// xattr-mode `setxattr`). Fails with `Exists` if a stream of that name
    /// is already present, and with `InvalidArgument` on anything but a
    /// regular file — ADS attach only ever targets an existing regular-file
    /// dentry.
    pub fn add_ads(&mut self, dentry: DentryId, name: String) -> WimResult<usize> {
        let d = self.get_mut(dentry)?;
        if !d.is_file() {
            return Err(WimError::InvalidArgument);
        }
        if d.ads.iter().any(|a| a.name == name) {
            return Err(WimError::Exists);
        }
        let index = d.ads.len();
        d.ads.push(AdsEntry {
            name,
            hash: ContentHash::default(),
        });
        Ok(index)
    }

    /// `unlink`/`rmdir` (§4.4). Returns the set of effective-stream hashes
    /// whose refcount the caller must decrement.
    pub fn unlink(&mut self, parent: DentryId, name: &str) -> WimResult<Vec<ContentHash>> {
        let id = self
            .find_child(parent, name)?
            .ok_or(WimError::NotFound)?;
        let dentry = self.get(id)?;
        if dentry.is_directory() && !self.children(id)?.is_empty() {
            return Err(WimError::NotEmpty);
        }
        let hashes = dentry.effective_streams().into_iter().map(|(_, h)| h).collect();
        self.splice_out(id)?;
        let dentry = self.get_mut(id)?;
        dentry.parent = None;
        dentry.removed = true;
        self.maybe_destroy(id)?;
        Ok(hashes)
    }

    /// Removes a single ADS-addressed stream, leaving the rest of the
    /// dentry untouched (§4.4: "Unlinking an ADS-addressed path removes only
    /// that ADS entry").
    pub fn unlink_ads(&mut self, dentry: DentryId, index: usize) -> WimResult<ContentHash> {
        let d = self.get_mut(dentry)?;
        if index >= d.ads.len() {
            return Err(WimError::NotFound);
        }
        Ok(d.ads.remove(index).hash)
    }

    /// Frees the arena slot once a removed dentry has no more open handles.
    /// Called after unlink and after the last `release`/`releasedir` on an
    /// orphan.
    pub fn maybe_destroy(&mut self, id: DentryId) -> WimResult<()> {
        let dentry = self.get(id)?;
        if dentry.removed && dentry.num_times_opened == 0 {
            self.arena[id] = None;
        }
        Ok(())
    }

    /// Renames `src_name` under `src_parent` to `dst_name` under `dst_parent`.
    /// If the destination already exists it is unlinked first; the hashes of
    /// any effective streams that unlink freed are returned so the caller can
    /// release the matching catalog refcounts (§4.4) — `DentryTree` itself
    /// has no reference to the catalog.
    pub fn rename(
        &mut self,
        src_parent: DentryId,
        src_name: &str,
        dst_parent: DentryId,
        dst_name: &str,
        now: SystemTime,
    ) -> WimResult<Vec<ContentHash>> {
        let src_id = self
            .find_child(src_parent, src_name)?
            .ok_or(WimError::NotFound)?;
        let mut freed = Vec::new();
        if let Some(dst_id) = self.find_child(dst_parent, dst_name)? {
            if dst_id == src_id {
                return Ok(freed);
            }
            let (src_is_dir, dst_is_dir) = (self.get(src_id)?.is_directory(), self.get(dst_id)?.is_directory());
            match (src_is_dir, dst_is_dir) {
                (true, false) => return Err(WimError::NotADirectory),
                (false, true) => return Err(WimError::IsADirectory),
                _ => {}
            }
            if dst_is_dir && !self.children(dst_id)?.is_empty() {
                return Err(WimError::NotEmpty);
            }
            freed = self.unlink(dst_parent, dst_name)?;
        }
        self.splice_out(src_id)?;
        let dentry = self.get_mut(src_id)?;
        dentry.parent = Some(dst_parent);
        dentry.name = dst_name.to_string();
        dentry.archive_name = dst_name.as_bytes().to_vec();
        dentry.touch_all_timestamps(now);
        self.splice_in(dst_parent, src_id)?;
        Ok(freed)
    }

    /// Rewrites every stream reference from `old` to `new` across the whole
    /// tree. The commit pipeline uses this after rehashing a staged stream
    /// gives it its real, final content hash in place of the random
    /// placeholder it diverged with (§4.3, §9 design note).
    pub fn retarget_stream(&mut self, old: ContentHash, new: ContentHash) {
        for dentry in self.arena.iter_mut().flatten() {
            if dentry.primary_hash == old {
                dentry.primary_hash = new;
            }
            for ads in dentry.ads.iter_mut() {
                if ads.hash == old {
                    ads.hash = new;
                }
            }
        }
    }

    pub fn full_path(&self, id: DentryId) -> WimResult<String> {
        if id == Self::ROOT {
            return Ok("/".to_string());
        }
        let mut components = Vec::new();
        let mut current = id;
        loop {
            let dentry = self.get(current)?;
            components.push(dentry.name.clone());
            match dentry.parent {
                Some(p) if p != current => current = p,
                _ => break,
            }
        }
        components.reverse();
        Ok(format!("/{}", components.join("/")))
    }
}

/// Index from content hash to every (dentry, slot) pair that references it,
/// maintained incrementally to avoid a linear scan on the common path.
/// Only used internally by callers that want fast "who references this hash"
/// lookups distinct from `link_group_stream_count`'s arena scan.
pub type StreamIndex = HashMap<ContentHash, Vec<(DentryId, StreamSlot)>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH
    }

    #[test]
    fn insert_and_resolve() {
        let mut tree = DentryTree::new(now());
        let a = tree
            .insert(
                DentryTree::ROOT,
                "a".into(),
                b"a".to_vec(),
                DentryKind::File,
                now(),
            )
            .unwrap();
        let (resolved, slot) = tree.resolve("/a", true).unwrap();
        assert_eq!(resolved, a);
        assert_eq!(slot, StreamSlot::Primary);
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut tree = DentryTree::new(now());
        tree.insert(DentryTree::ROOT, "a".into(), b"a".to_vec(), DentryKind::File, now())
            .unwrap();
        let err = tree
            .insert(DentryTree::ROOT, "a".into(), b"a".to_vec(), DentryKind::File, now())
            .unwrap_err();
        assert!(matches!(err, WimError::Exists));
    }

    #[test]
    fn sibling_ring_survives_many_children() {
        let mut tree = DentryTree::new(now());
        for i in 0..5 {
            tree.insert(
                DentryTree::ROOT,
                format!("f{i}"),
                format!("f{i}").into_bytes(),
                DentryKind::File,
                now(),
            )
            .unwrap();
        }
        let children = tree.children(DentryTree::ROOT).unwrap();
        assert_eq!(children.len(), 5);
    }

    #[test]
    fn unlink_removes_from_parent_but_keeps_arena_slot_if_open() {
        let mut tree = DentryTree::new(now());
        let a = tree
            .insert(DentryTree::ROOT, "a".into(), b"a".to_vec(), DentryKind::File, now())
            .unwrap();
        tree.get_mut(a).unwrap().num_times_opened = 1;
        tree.unlink(DentryTree::ROOT, "a").unwrap();
        assert!(tree.find_child(DentryTree::ROOT, "a").unwrap().is_none());
        assert!(tree.get(a).is_ok());
        tree.get_mut(a).unwrap().num_times_opened = 0;
        tree.maybe_destroy(a).unwrap();
        assert!(tree.get(a).is_err());
    }

    #[test]
    fn link_creates_slave_with_independent_divergence_scope() {
        let mut tree = DentryTree::new(now());
        let a = tree
            .insert(DentryTree::ROOT, "a".into(), b"a".to_vec(), DentryKind::File, now())
            .unwrap();
        tree.get_mut(a).unwrap().primary_hash = ContentHash::of_bytes(b"hello");
        let b = tree
            .clone_as_link(a, DentryTree::ROOT, "b".into(), b"b".to_vec(), now())
            .unwrap();
        assert_ne!(tree.get(a).unwrap().link_group, tree.get(b).unwrap().link_group);
        assert!(!tree.get(b).unwrap().is_master);
        assert_eq!(tree.get(b).unwrap().primary_hash, ContentHash::of_bytes(b"hello"));
    }

    #[test]
    fn rename_noop_when_same_entry() {
        let mut tree = DentryTree::new(now());
        tree.insert(DentryTree::ROOT, "a".into(), b"a".to_vec(), DentryKind::File, now())
            .unwrap();
        tree.rename(DentryTree::ROOT, "a", DentryTree::ROOT, "a", now())
            .unwrap();
        assert!(tree.find_child(DentryTree::ROOT, "a").unwrap().is_some());
    }

    #[test]
    fn retarget_stream_rewrites_matching_hashes_only() {
        let mut tree = DentryTree::new(now());
        let a = tree
            .insert(DentryTree::ROOT, "a".into(), b"a".to_vec(), DentryKind::File, now())
            .unwrap();
        let b = tree
            .insert(DentryTree::ROOT, "b".into(), b"b".to_vec(), DentryKind::File, now())
            .unwrap();
        let old = ContentHash::of_bytes(b"placeholder");
        let untouched = ContentHash::of_bytes(b"untouched");
        tree.get_mut(a).unwrap().primary_hash = old;
        tree.get_mut(b).unwrap().primary_hash = untouched;
        let new = ContentHash::of_bytes(b"real content");
        tree.retarget_stream(old, new);
        assert_eq!(tree.get(a).unwrap().primary_hash, new);
        assert_eq!(tree.get(b).unwrap().primary_hash, untouched);
    }

    #[test]
    fn rename_type_mismatch_fails() {
        let mut tree = DentryTree::new(now());
        tree.insert(DentryTree::ROOT, "f".into(), b"f".to_vec(), DentryKind::File, now())
            .unwrap();
        tree.insert(DentryTree::ROOT, "d".into(), b"d".to_vec(), DentryKind::Directory, now())
            .unwrap();
        let err = tree
            .rename(DentryTree::ROOT, "f", DentryTree::ROOT, "d", now())
            .unwrap_err();
        assert!(matches!(err, WimError::IsADirectory));
    }
}
