//! # Mount-Time and Unmount-Time Options
//!
//! The recognized options from §6, parsed with `clap` derive macros since
//! plain positional `env::args()` parsing doesn't scale past two or three
//! flags.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Controls how alternate data streams are addressed (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StreamInterface {
    /// ADS are not exposed at all.
    None,
    /// ADS are exposed as extended attributes.
    Xattr,
    /// ADS are exposed as `path:streamname` paths.
    Windows,
}

impl Default for StreamInterface {
    fn default() -> Self {
        StreamInterface::Xattr
    }
}

/// Arguments to the mount binary (`wimfs-mount`).
#[derive(Debug, Parser)]
#[command(name = "wimfs-mount", about = "Mount a WIM image as a POSIX directory tree")]
pub struct MountOptions {
    /// Path to the backing WIM archive.
    pub wim_path: PathBuf,

    /// Directory to mount the image onto.
    pub mount_point: PathBuf,

    /// Which image inside the archive to project (WIM archives can hold
    /// several).
    #[arg(long, default_value_t = 1)]
    pub image_index: u32,

    /// Enable the staging store and commit pipeline; mark the image as
    /// modified (§6).
    #[arg(long)]
    pub read_write: bool,

    /// Enable verbose tracing and keep FUSE in the foreground (§6).
    #[arg(long)]
    pub debug: bool,

    /// How ADS are addressed (§6). Defaults to `xattr`.
    #[arg(long, value_enum, default_value_t = StreamInterface::Xattr)]
    pub stream_interface: StreamInterface,

    /// Directory under which the staging scratch directory is created;
    /// defaults to the process's initial working directory (§3).
    #[arg(long, default_value = ".")]
    pub staging_base_dir: PathBuf,
}

/// Arguments to the out-of-band unmount driver (`wimfs-unmount`). Carries
/// the unmount-time options from §6 and is the process that performs the
/// handshake described in §4.7.
#[derive(Debug, Parser)]
#[command(name = "wimfs-unmount", about = "Unmount a wimfs mount point and drive the commit handshake")]
pub struct UnmountOptions {
    /// The mount point to unmount.
    pub mount_point: PathBuf,

    /// Commit staged changes back into the archive. If absent, changes are
    /// discarded (§6).
    #[arg(long)]
    pub commit: bool,

    /// Verify archive integrity after the rewrite (§6).
    #[arg(long)]
    pub check_integrity: bool,
}
