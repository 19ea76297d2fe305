//! # Staging Store
//!
//! Randomly-named on-disk scratch directory that materializes archive
//! streams into private files so they can be mutated without touching the
//! read-only backing archive (§3 "Staging directory", §4.3). This module
//! owns the scratch directory's lifecycle and implements the divergence
//! algorithm — the single most subtle piece of this crate (§9 design note).

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::catalog::{LookupEntry, LookupTable};
use crate::dentry::{DentryId, DentryTree, StreamSlot};
use crate::error::{WimError, WimResult};
use crate::external::ResourceReader;
use crate::fd_table::OpenHandle;
use crate::hash::{ContentHash, WIM_HASH_SIZE};

/// How many times to retry generating a staging file name before giving up.
/// A collision on a `WIM_HASH_SIZE`-wide random suffix is astronomically
/// unlikely; this bound exists only so a broken RNG fails loudly instead of
/// looping forever.
const NAME_COLLISION_RETRIES: u32 = 16;

/// The result of running the divergence algorithm (§4.3): the caller must
/// overwrite the dentry's stream-hash slot with `new_hash` (step 6) and,
/// for every `(old_slot, new_slot)` pair in `relocations`, update any
/// externally-tracked file-handle-id → (hash, slot) mapping so that open
/// callers keep working without their `fh` changing (§4.2's "stable
/// index... used by the link-group split to relocate handles... without
/// breaking open callers").
#[derive(Debug)]
pub struct DivergenceOutcome {
    pub new_hash: ContentHash,
    pub relocations: Vec<(usize, usize)>,
}

/// The staging directory (§3). Created once per mount, removed recursively
/// on unmount regardless of commit outcome (§4.7 step 4).
#[derive(Debug)]
pub struct StagingStore {
    dir: PathBuf,
}

impl StagingStore {
    /// Creates a freshly named scratch directory under `base_dir` (the
    /// process's initial working directory, per §3).
    pub fn create(base_dir: &Path) -> WimResult<Self> {
        let mut rng = rand::rng();
        let suffix: u64 = rng.random();
        let dir = base_dir.join(format!(".wimfs-staging-{suffix:016x}"));
        fs::create_dir(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Creates a new, empty staging file named with a random
    /// `WIM_HASH_SIZE`-wide hex suffix, opened for write with mode `0600`
    /// (§4.3 step 1). Retries on name collision.
    pub fn create_staging_file(&self) -> WimResult<(PathBuf, File)> {
        for _ in 0..NAME_COLLISION_RETRIES {
            let name = ContentHash::random().to_hex();
            let path = self.dir.join(name);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)
            {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(WimError::staging(e)),
            }
        }
        Err(WimError::Invariant(
            "exhausted retries generating a staging file name".into(),
        ))
    }

    /// Removes the staging directory and everything in it (§4.7 step 4).
    /// Takes `self` by value since the store has no further use afterwards.
    pub fn remove_all(self) -> WimResult<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) | Err(_) if !self.dir.exists() => Ok(()),
            Err(e) => Err(WimError::staging(e)),
        }
    }
}

/// Runs the staging-divergence algorithm (§4.3) for `dentry`'s `slot`
/// stream. `old_hash` is the stream's current hash (may be a fresh, never
///-cataloged hash for a brand-new empty file). `size` is the truncation
/// size: 0 for "new", the resource's `original_size` for "full copy", or N
/// for "first N bytes only" (§4.3 inputs).
pub fn diverge(
    dentries: &mut DentryTree,
    catalog: &mut LookupTable,
    store: &StagingStore,
    reader: &dyn ResourceReader,
    dentry_id: DentryId,
    slot: StreamSlot,
    old_hash: ContentHash,
    size: u64,
) -> WimResult<DivergenceOutcome> {
    // Step 1: create the staging file.
    let (path, mut file) = store.create_staging_file()?;

    // Step 2: stream the first `size` bytes of the old resource into it, if
    // one exists in the archive.
    if let Some(old_entry) = catalog.get(&old_hash) {
        if let Some(resource) = old_entry.archive_resource() {
            if let Err(e) = copy_archive_prefix(reader, resource, size, &mut file) {
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        }
    }
    drop(file);

    // Step 3: how much of the old entry's refcount belongs to this dentry's
    // hard-link group, at this stream position.
    let link_group = dentries.get(dentry_id)?.link_group;
    let link_group_size = dentries.link_group_stream_count(link_group, slot, old_hash) as u64;

    let new_hash = ContentHash::random();

    let old_refcount = catalog.get(&old_hash).map(|e| e.refcount).unwrap_or(0);

    let (mut new_entry, relocations) = if catalog.contains(&old_hash) && link_group_size == old_refcount {
        // Step 4, reuse branch: the whole refcount is this link group's, so
        // repurpose the existing entry in place instead of splitting. Every
        // slot currently in its fd table keeps the same index, just under
        // `new_hash` instead of `old_hash` — report that as an identity
        // relocation so callers don't need a separate "no split happened"
        // case when patching their fh → (hash, slot) map.
        let mut entry = catalog.remove(&old_hash).expect("just checked contains");
        let identity: Vec<(usize, usize)> = (0..entry.fds.num_allocated())
            .filter(|&slot| entry.fds.get(slot).is_some())
            .map(|slot| (slot, slot))
            .collect();
        entry.hash = new_hash;
        entry.backing = crate::catalog::Backing::Staging(path.clone());
        (entry, identity)
    } else if catalog.contains(&old_hash) {
        // Step 4, split branch: transfer only the handles whose dentry is
        // in the diverging link group; everything else stays on the old
        // entry.
        let old_entry = catalog.get_mut(&old_hash).expect("just checked contains");
        let drained = old_entry.fds.drain_matching_group(link_group);
        old_entry.refcount = old_entry.refcount.saturating_sub(link_group_size);

        let mut new_fds = crate::fd_table::FdTable::new();
        let mut relocations = Vec::with_capacity(drained.len());
        for (old_slot, handle) in drained {
            let new_slot = new_fds.allocate(handle)?;
            relocations.push((old_slot, new_slot));
        }
        let mut entry = LookupEntry::new_staged(new_hash, path.clone(), size);
        entry.fds = new_fds;
        entry.refcount = link_group_size;
        (entry, relocations)
    } else {
        // Brand-new stream (old_hash was never in the catalog, e.g. a fresh
        // empty file being opened read-write for the first time).
        (LookupEntry::new_staged(new_hash, path.clone(), size), Vec::new())
    };

    new_entry.original_size = size;
    new_entry.refcount = link_group_size.max(1);
    catalog.insert(new_entry);

    // Step 6: repoint the dentry's stream-hash slot.
    dentries.get_mut(dentry_id)?.set_stream_hash(slot, new_hash);

    Ok(DivergenceOutcome {
        new_hash,
        relocations,
    })
}

/// Streams the first `size` uncompressed bytes of `resource` into `out`,
/// unlinking nothing itself — the caller removes the partially-written
/// staging file on error (§4.3 step 2, §7 staging I/O error policy).
fn copy_archive_prefix(
    reader: &dyn ResourceReader,
    resource: &crate::catalog::ArchiveResource,
    size: u64,
    out: &mut File,
) -> WimResult<()> {
    const CHUNK: usize = 64 * 1024;
    let mut buf = vec![0u8; CHUNK];
    let mut remaining = size;
    let mut skip = 0u64;
    while remaining > 0 {
        let want = remaining.min(CHUNK as u64) as usize;
        let n = reader.read_resource(resource, skip, &mut buf[..want])?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).map_err(WimError::staging)?;
        skip += n as u64;
        remaining -= n as u64;
    }
    Ok(())
}

/// Opens a handle against a brand-new, empty staged stream, for the
/// read-write-mount "empty file" opening rule (§4.2): materializes a
/// zero-length staging file and returns a fresh lookup entry with a random
/// placeholder hash so an fd table can exist.
pub fn stage_empty(store: &StagingStore) -> WimResult<(ContentHash, PathBuf)> {
    let (path, _file) = store.create_staging_file()?;
    Ok((ContentHash::random(), path))
}

/// Builds the `OpenHandle` record for a newly opened staging fd (§4.2).
pub fn open_staging_fd(path: &Path, dentry_id: DentryId, link_group: crate::dentry::LinkGroupId, flags: i32) -> WimResult<OpenHandle> {
    let file = OpenOptions::new()
        .read(true)
        .write(flags & libc::O_ACCMODE != libc::O_RDONLY)
        .open(path)
        .map_err(WimError::staging)?;
    Ok(OpenHandle {
        dentry: Some(dentry_id),
        staging_file: Some(file),
        link_group,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dentry::DentryKind;
    use std::time::SystemTime;

    struct NullReader;
    impl ResourceReader for NullReader {
        fn read_resource(&self, _resource: &crate::catalog::ArchiveResource, _skip: u64, _buf: &mut [u8]) -> WimResult<usize> {
            Ok(0)
        }
    }

    struct FixedReader(Vec<u8>);
    impl ResourceReader for FixedReader {
        fn read_resource(&self, _resource: &crate::catalog::ArchiveResource, skip: u64, buf: &mut [u8]) -> WimResult<usize> {
            let skip = skip as usize;
            if skip >= self.0.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.0.len() - skip);
            buf[..n].copy_from_slice(&self.0[skip..skip + n]);
            Ok(n)
        }
    }

    #[test]
    fn staging_store_creates_and_removes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StagingStore::create(tmp.path()).unwrap();
        assert!(store.path().exists());
        let dir = store.path().to_path_buf();
        store.remove_all().unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn diverge_reuses_entry_when_whole_refcount_owned() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StagingStore::create(tmp.path()).unwrap();
        let mut tree = DentryTree::new(SystemTime::UNIX_EPOCH);
        let a = tree
            .insert(DentryTree::ROOT, "a".into(), b"a".to_vec(), DentryKind::File, SystemTime::UNIX_EPOCH)
            .unwrap();
        let hash = ContentHash::of_bytes(b"hello");
        tree.get_mut(a).unwrap().primary_hash = hash;

        let mut catalog = LookupTable::new();
        let mut entry = crate::catalog::LookupEntry::new_archive_backed(
            hash,
            crate::catalog::ArchiveResource { offset: 0, compressed_size: 5, original_size: 5, flags: 0 },
        );
        entry.refcount = 1;
        catalog.insert(entry);

        let reader = FixedReader(b"hello".to_vec());
        let outcome = diverge(&mut tree, &mut catalog, &store, &reader, a, StreamSlot::Primary, hash, 5).unwrap();

        assert!(!catalog.contains(&hash));
        assert!(catalog.contains(&outcome.new_hash));
        let new_entry = catalog.get(&outcome.new_hash).unwrap();
        assert!(new_entry.is_staged());
        let data = fs::read(new_entry.staging_path().unwrap()).unwrap();
        assert_eq!(data, b"hello");
        store.remove_all().unwrap();
    }

    #[test]
    fn diverge_on_brand_new_stream_creates_fresh_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StagingStore::create(tmp.path()).unwrap();
        let mut tree = DentryTree::new(SystemTime::UNIX_EPOCH);
        let a = tree
            .insert(DentryTree::ROOT, "a".into(), b"a".to_vec(), DentryKind::File, SystemTime::UNIX_EPOCH)
            .unwrap();
        let mut catalog = LookupTable::new();
        let reader = NullReader;
        let placeholder = ContentHash::random();
        let outcome = diverge(&mut tree, &mut catalog, &store, &reader, a, StreamSlot::Primary, placeholder, 0).unwrap();
        assert!(catalog.contains(&outcome.new_hash));
        assert_eq!(catalog.get(&outcome.new_hash).unwrap().refcount, 1);
        store.remove_all().unwrap();
    }
}
