//! # Commit Pipeline
//!
//! Runs when the unmount driver asks for a commit (§4.7, §6). A staged
//! stream only ever carries a random placeholder hash (§9 design note,
//! [`crate::hash::ContentHash::random`]) — its real content hash is unknown
//! until this pipeline rehashes it, so every staged entry's catalog key and
//! every dentry pointing at it has to be retargeted before the archive
//! overwriter runs.

use crate::context::MountContext;
use crate::error::WimResult;
use crate::hash::ContentHash;

/// Rehashes and dedupes every staged stream, then hands the finished tree
/// and catalog to the archive overwriter (§6 "Archive overwriter"). Leaves
/// `ctx.modified` cleared on success.
pub fn run(ctx: &mut MountContext, check_integrity: bool) -> WimResult<()> {
    rehash_and_dedupe(ctx)?;
    ctx.collaborators
        .archive_overwriter
        .overwrite(&ctx.dentries, &ctx.catalog, check_integrity)?;
    ctx.modified = false;
    Ok(())
}

/// Computes the real content hash of every staged stream and folds it back
/// into the catalog. If that real hash already names an existing entry
/// (another stream happened to end up byte-identical), the staged copy is
/// dropped and its refcount merged into the survivor instead of keeping a
/// duplicate on disk.
fn rehash_and_dedupe(ctx: &mut MountContext) -> WimResult<()> {
    let staged_hashes: Vec<ContentHash> = ctx
        .catalog
        .iter()
        .filter(|(_, entry)| entry.is_staged())
        .map(|(hash, _)| *hash)
        .collect();

    for old_hash in staged_hashes {
        let (path, refcount) = {
            let entry = match ctx.catalog.get(&old_hash) {
                Some(e) => e,
                None => continue,
            };
            let path = match entry.staging_path() {
                Some(p) => p.clone(),
                None => continue,
            };
            (path, entry.refcount)
        };

        let real_hash = ctx.collaborators.content_hasher.hash_file(&path)?;
        if real_hash == old_hash {
            continue;
        }

        if ctx.catalog.contains(&real_hash) {
            ctx.catalog.bump_refcount(&real_hash, refcount)?;
            ctx.catalog.remove(&old_hash);
            let _ = std::fs::remove_file(&path);
        } else {
            let mut entry = ctx.catalog.remove(&old_hash).expect("checked staged entry exists above");
            entry.hash = real_hash;
            ctx.catalog.insert(entry);
        }
        ctx.dentries.retarget_stream(old_hash, real_hash);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Collaborators;
    use crate::dentry::{DentryKind, DentryTree};
    use crate::catalog::LookupTable;
    use crate::external::{
        ArchiveOverwriter, CatalogLoader, ContentHasher, NameCodec, PlainReparsePointCodec, ReparsePointCodec, ResourceReader, Utf8NameCodec,
    };
    use crate::options::{MountOptions, StreamInterface};
    use crate::staging::StagingStore;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::SystemTime;

    struct NoopLoader;
    impl CatalogLoader for NoopLoader {
        fn load(&self, _image_index: u32) -> WimResult<(DentryTree, LookupTable)> {
            Ok((DentryTree::new(SystemTime::UNIX_EPOCH), LookupTable::new()))
        }
    }

    struct NoopReader;
    impl ResourceReader for NoopReader {
        fn read_resource(&self, _resource: &crate::catalog::ArchiveResource, _skip: u64, _buf: &mut [u8]) -> WimResult<usize> {
            Ok(0)
        }
    }

    struct RecordingOverwriter {
        called: Mutex<bool>,
    }
    impl ArchiveOverwriter for RecordingOverwriter {
        fn overwrite(&self, _dentries: &DentryTree, _catalog: &LookupTable, _check_integrity: bool) -> WimResult<()> {
            *self.called.lock().unwrap() = true;
            Ok(())
        }
    }

    fn test_options(tmp: &Path) -> MountOptions {
        MountOptions {
            wim_path: tmp.join("image.wim"),
            mount_point: tmp.join("mnt"),
            image_index: 1,
            read_write: true,
            debug: false,
            stream_interface: StreamInterface::Xattr,
            staging_base_dir: tmp.to_path_buf(),
        }
    }

    fn collaborators(overwriter: RecordingOverwriter) -> Collaborators {
        Collaborators {
            catalog_loader: Box::new(NoopLoader),
            resource_reader: Box::new(NoopReader),
            archive_overwriter: Box::new(overwriter),
            content_hasher: Box::new(crate::external::Sha1ContentHasher),
            name_codec: Box::new(Utf8NameCodec) as Box<dyn NameCodec>,
            reparse_codec: Box::new(PlainReparsePointCodec) as Box<dyn ReparsePointCodec>,
        }
    }

    #[test]
    fn commit_rehashes_staged_stream_and_retargets_dentry() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StagingStore::create(tmp.path()).unwrap();
        let mut dentries = DentryTree::new(SystemTime::UNIX_EPOCH);
        let file_id = dentries
            .insert(DentryTree::ROOT, "a".into(), b"a".to_vec(), DentryKind::File, SystemTime::UNIX_EPOCH)
            .unwrap();

        let (path, mut f) = store.create_staging_file().unwrap();
        use std::io::Write;
        f.write_all(b"hello").unwrap();
        drop(f);

        let placeholder = ContentHash::random();
        let mut catalog = LookupTable::new();
        let mut entry = crate::catalog::LookupEntry::new_staged(placeholder, path, 5);
        entry.refcount = 1;
        catalog.insert(entry);
        dentries.get_mut(file_id).unwrap().primary_hash = placeholder;

        let options = test_options(tmp.path());
        let overwriter = RecordingOverwriter { called: Mutex::new(false) };
        let called_flag_check = ContentHash::of_bytes(b"hello");
        let mut ctx = MountContext::new(&options, dentries, catalog, Some(store), collaborators(overwriter));

        run(&mut ctx, false).unwrap();

        assert!(!ctx.modified);
        assert!(ctx.catalog.contains(&called_flag_check));
        assert!(!ctx.catalog.contains(&placeholder));
        assert_eq!(ctx.dentries.get(file_id).unwrap().primary_hash, called_flag_check);
    }

    #[test]
    fn commit_dedupes_against_existing_entry_with_same_real_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StagingStore::create(tmp.path()).unwrap();
        let mut dentries = DentryTree::new(SystemTime::UNIX_EPOCH);
        let file_id = dentries
            .insert(DentryTree::ROOT, "a".into(), b"a".to_vec(), DentryKind::File, SystemTime::UNIX_EPOCH)
            .unwrap();

        let (path, mut f) = store.create_staging_file().unwrap();
        use std::io::Write;
        f.write_all(b"dup").unwrap();
        drop(f);

        let placeholder = ContentHash::random();
        let real_hash = ContentHash::of_bytes(b"dup");
        let mut catalog = LookupTable::new();
        let mut staged = crate::catalog::LookupEntry::new_staged(placeholder, path, 3);
        staged.refcount = 2;
        catalog.insert(staged);
        let mut existing = crate::catalog::LookupEntry::new_archive_backed(
            real_hash,
            crate::catalog::ArchiveResource { offset: 0, compressed_size: 3, original_size: 3, flags: 0 },
        );
        existing.refcount = 1;
        catalog.insert(existing);
        dentries.get_mut(file_id).unwrap().primary_hash = placeholder;

        let options = test_options(tmp.path());
        let overwriter = RecordingOverwriter { called: Mutex::new(false) };
        let mut ctx = MountContext::new(&options, dentries, catalog, Some(store), collaborators(overwriter));

        run(&mut ctx, false).unwrap();

        assert!(!ctx.catalog.contains(&placeholder));
        assert_eq!(ctx.catalog.get(&real_hash).unwrap().refcount, 3);
        assert_eq!(ctx.dentries.get(file_id).unwrap().primary_hash, real_hash);
    }
}
