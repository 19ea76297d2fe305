//! # Per-Mount Context
//!
//! §9's design note recommends bundling all process-wide state behind a
//! single struct rather than scattering it across globals. `MountContext`
//! is that bundle: the dentry tree, the catalog, the staging store, the
//! external collaborators, and the indirection layer that keeps a FUSE file
//! handle number stable across a hard-link-group divergence split (§4.2,
//! §4.3 step 4).

use std::path::PathBuf;

use crate::catalog::LookupTable;
use crate::dentry::DentryTree;
use crate::external::{ArchiveOverwriter, CatalogLoader, ContentHasher, NameCodec, ReparsePointCodec, ResourceReader};
use crate::hash::ContentHash;
use crate::options::{MountOptions, StreamInterface};
use crate::staging::StagingStore;

use std::collections::HashMap;

/// Boxed trait objects for every out-of-scope collaborator named in §6. A
/// single struct rather than five separate fields on `MountContext` so
/// swapping in a test double only touches one constructor argument.
pub struct Collaborators {
    pub catalog_loader: Box<dyn CatalogLoader>,
    pub resource_reader: Box<dyn ResourceReader>,
    pub archive_overwriter: Box<dyn ArchiveOverwriter>,
    pub content_hasher: Box<dyn ContentHasher>,
    pub name_codec: Box<dyn NameCodec>,
    pub reparse_codec: Box<dyn ReparsePointCodec>,
}

/// All state belonging to one mounted image. `WimFileSystem` (§4.5) holds
/// exactly one of these behind a single `RwLock`.
pub struct MountContext {
    pub wim_path: PathBuf,
    pub image_index: u32,
    pub read_write: bool,
    pub stream_interface: StreamInterface,

    pub dentries: DentryTree,
    pub catalog: LookupTable,
    /// `None` on a read-only mount (§3: "present only on a read-write
    /// mount").
    pub staging: Option<StagingStore>,
    pub collaborators: Collaborators,

    /// Next externally-visible `fh` value to hand out. FUSE treats `fh` as
    /// opaque so this only needs to be unique, not contiguous or reused.
    next_handle_id: u64,
    /// Maps the externally-stable `fh` to wherever its open record currently
    /// lives: which catalog entry, and which slot in that entry's fd table.
    /// A link-group divergence split can relocate the slot (and even the
    /// catalog entry) without the `fh` itself ever changing (§4.2, §4.3
    /// step 4, §9 design note).
    handle_locations: HashMap<u64, (ContentHash, usize)>,

    /// Set the first time any mutating operation succeeds; read back by the
    /// unmount handshake to decide whether there is anything to commit
    /// (§4.7, §6).
    pub modified: bool,
}

impl MountContext {
    pub fn new(
        options: &MountOptions,
        dentries: DentryTree,
        catalog: LookupTable,
        staging: Option<StagingStore>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            wim_path: options.wim_path.clone(),
            image_index: options.image_index,
            read_write: options.read_write,
            stream_interface: options.stream_interface,
            dentries,
            catalog,
            staging,
            collaborators,
            next_handle_id: 1,
            handle_locations: HashMap::new(),
            modified: false,
        }
    }

    /// Allocates a fresh `fh` and records where its open record lives.
    pub fn register_handle(&mut self, hash: ContentHash, slot: usize) -> u64 {
        let fh = self.next_handle_id;
        self.next_handle_id += 1;
        self.handle_locations.insert(fh, (hash, slot));
        fh
    }

    pub fn handle_location(&self, fh: u64) -> Option<(ContentHash, usize)> {
        self.handle_locations.get(&fh).copied()
    }

    pub fn forget_handle(&mut self, fh: u64) -> Option<(ContentHash, usize)> {
        self.handle_locations.remove(&fh)
    }

    /// Whether `:streamname` path suffixes address an ADS (§6 "windows"
    /// stream-interface mode). The `xattr` (default) and `none` modes both
    /// leave a trailing colon as a literal part of the filename.
    pub fn windows_ads(&self) -> bool {
        self.stream_interface == StreamInterface::Windows
    }

    /// Repoints every `fh` currently located in `old_hash` according to a
    /// divergence outcome's `(old_slot, new_slot)` relocations, onto
    /// `new_hash` (§4.3 step 4). Handles left on `old_hash` that aren't in
    /// the relocation list belong to the sibling link groups that kept the
    /// old entry and are left untouched.
    pub fn apply_relocations(&mut self, old_hash: ContentHash, new_hash: ContentHash, relocations: &[(usize, usize)]) {
        for (old_slot, new_slot) in relocations {
            for (_, location) in self.handle_locations.iter_mut() {
                if *location == (old_hash, *old_slot) {
                    *location = (new_hash, *new_slot);
                }
            }
        }
    }
}
