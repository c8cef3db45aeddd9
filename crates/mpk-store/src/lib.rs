//! Package store, archive codec, file integrity and symlink installer for mpk.
//!
//! This crate provides the on-disk side of the toolchain: `StoreLayout` for
//! the `/usr/packages` directory structure, SHA-256 file integrity over a
//! manifest's file lists, the deterministic `.mpk` archive codec
//! (tar + bzip2), the `Installer` that projects a package into a prefix as
//! symlinks, and a `WriteAheadLog` so interrupted installs are rolled back.

pub mod archive;
pub mod install;
pub mod integrity;
pub mod layout;
pub mod wal;

pub use archive::{
    pack, package_file_name, read_archive_manifest, read_unpacked_manifest, unpack,
    unpack_dir_name, ArchiveError, DATA_DIR, MANIFEST_FILE, PACKAGE_EXTENSION, TOOL_DIR,
};
pub use install::{InstallError, InstallReport, Installer, UninstallReport};
pub use integrity::{
    hash_file, hash_manifest_files, read_link_target, resolve_relative,
    verify_manifest_files, IntegrityError, IntegrityFailure, IntegrityReport,
};
pub use layout::{StoreLayout, DEFAULT_STORE_ROOT, STORE_FORMAT_VERSION};
pub use wal::{rollback_all, RollbackStep, WalEntry, WalOpKind, WriteAheadLog};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so a preceding `rename()` survives a crash.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
