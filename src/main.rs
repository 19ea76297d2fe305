//! # wimfs-mount
//!
//! Entry point for mounting a single WIM image as a FUSE directory tree
//! (§6). Everything this binary wires together beyond argument parsing and
//! the collaborator stand-ins is implemented in `lib.rs`.
//!
//! ## Usage
//!
//! ```bash
//! wimfs-mount <wim-path> <mount-point> [--read-write] [--image-index N]
//! ```

use std::ffi::OsStr;

use clap::Parser;

use wimfs::catalog::{ArchiveResource, LookupTable};
use wimfs::context::{Collaborators, MountContext};
use wimfs::dentry::DentryTree;
use wimfs::error::{WimError, WimResult};
use wimfs::external::{
    ArchiveOverwriter, CatalogLoader, PlainReparsePointCodec, ResourceReader, Sha1ContentHasher, Utf8NameCodec,
};
use wimfs::file_system::WimFileSystem;
use wimfs::options::MountOptions;
use wimfs::staging::StagingStore;

/// Number of worker threads `FuseMT` dispatches callbacks on.
const FUSE_WORKER_THREADS: usize = 5;

/// Stands in for the real WIM header/XML/integrity-table parser (§6). WIM
/// parsing is out of scope here; a production deployment links a real
/// implementation in its place.
struct UnlinkedCatalogLoader;

impl CatalogLoader for UnlinkedCatalogLoader {
    fn load(&self, _image_index: u32) -> WimResult<(DentryTree, LookupTable)> {
        Err(WimError::ArchiveRead(
            "no WIM catalog loader is linked into this build".into(),
        ))
    }
}

/// Stands in for the real LZX/XPRESS-aware archive resource reader (§6).
struct UnlinkedResourceReader;

impl ResourceReader for UnlinkedResourceReader {
    fn read_resource(&self, _resource: &ArchiveResource, _skip: u64, _buf: &mut [u8]) -> WimResult<usize> {
        Err(WimError::ArchiveRead(
            "no archive resource reader is linked into this build".into(),
        ))
    }
}

/// Stands in for the real archive rewriter (§6).
struct UnlinkedArchiveOverwriter;

impl ArchiveOverwriter for UnlinkedArchiveOverwriter {
    fn overwrite(&self, _dentries: &DentryTree, _catalog: &LookupTable, _check_integrity: bool) -> WimResult<()> {
        Err(WimError::Commit(
            "no archive overwriter is linked into this build".into(),
        ))
    }
}

/// Main entry point for the mount binary.
///
/// This function:
/// 1. Initializes logging, honoring `--debug`.
/// 2. Parses command line arguments.
/// 3. Loads the image's catalog and dentry tree and wires up collaborators.
/// 4. Mounts the image using FUSE.
///
/// # Panics
///
/// Will panic if the mount point doesn't exist or isn't a directory, if the
/// catalog fails to load, or if the FUSE mount itself fails.
fn main() {
    let options = MountOptions::parse();

    let level = if options.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    env_logger::Builder::from_default_env().filter_level(level).init();

    if !options.mount_point.exists() {
        panic!("Mount point does not exist");
    }
    if !options.mount_point.is_dir() {
        panic!("Mount point is not a directory");
    }

    let catalog_loader = UnlinkedCatalogLoader;
    let (dentries, catalog) = catalog_loader
        .load(options.image_index)
        .expect("Failure loading the WIM image catalog");

    let staging = if options.read_write {
        Some(StagingStore::create(&options.staging_base_dir).expect("Failure creating the staging directory"))
    } else {
        None
    };

    let collaborators = Collaborators {
        catalog_loader: Box::new(catalog_loader),
        resource_reader: Box::new(UnlinkedResourceReader),
        archive_overwriter: Box::new(UnlinkedArchiveOverwriter),
        content_hasher: Box::new(Sha1ContentHasher),
        name_codec: Box::new(Utf8NameCodec),
        reparse_codec: Box::new(PlainReparsePointCodec),
    };

    let mount_point = options.mount_point.clone();
    let ctx = MountContext::new(&options, dentries, catalog, staging, collaborators);
    let file_system = WimFileSystem::new(ctx, mount_point.clone());

    let fsname = format!("fsname=wimfs:{}", options.wim_path.display());
    let fuse_args = [OsStr::new("-o"), OsStr::new(&fsname)];
    fuse_mt::mount(
        fuse_mt::FuseMT::new(file_system, FUSE_WORKER_THREADS),
        mount_point.to_str().expect("Invalid mount point string"),
        &fuse_args[..],
    )
    .expect("Could not mount the file system in the mountpoint");
}
