use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
/// Default location of the package store on a target system.
pub const DEFAULT_STORE_ROOT: &str = "/usr/packages";
const VERSION_FILE: &str = "version";
const META_DIR: &str = ".mpk";

/// Directory layout of the package store.
///
/// `store_root` is where unpacked packages live on the machine running the
/// tool. `link_root` is the absolute path that installed symlinks point at;
/// it differs from `store_root` when preparing an image for another root.
///
/// ```text
/// <store_root>/<name>-<version>/{manifest.json,tool,data}
/// <store_root>/<name> -> <name>-<version>
/// <store_root>/.mpk/{version,locks,wal,staging}
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
    link_root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    /// Layout whose symlink targets point into `root` itself.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            link_root: root.clone(),
            root,
        }
    }

    #[must_use]
    pub fn with_link_root(mut self, link_root: impl Into<PathBuf>) -> Self {
        self.link_root = link_root.into();
        self
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn link_root(&self) -> &Path {
        &self.link_root
    }

    /// `<store_root>/<name>`, the link to the active version.
    #[inline]
    pub fn package_link(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// `<store_root>/<name>-<version>`, the unpacked package.
    #[inline]
    pub fn versioned_dir(&self, package_id: &str) -> PathBuf {
        self.root.join(package_id)
    }

    /// Absolute target of a package identity link.
    #[inline]
    pub fn link_target(&self, name: &str) -> PathBuf {
        self.link_root.join(name)
    }

    /// Absolute target of an installed file's symlink.
    #[inline]
    pub fn data_link_target(&self, name: &str, relative_path: &str) -> PathBuf {
        self.link_root.join(name).join("data").join(relative_path)
    }

    #[inline]
    pub fn meta_dir(&self) -> PathBuf {
        self.root.join(META_DIR)
    }

    #[inline]
    pub fn locks_dir(&self) -> PathBuf {
        self.meta_dir().join("locks")
    }

    #[inline]
    pub fn wal_dir(&self) -> PathBuf {
        self.meta_dir().join("wal")
    }

    /// Temporary area for archive extraction.
    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.meta_dir().join("staging")
    }

    /// Store-wide lock, held during journal recovery.
    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.meta_dir().join(".lock")
    }

    #[inline]
    pub fn package_lock_file(&self, name: &str) -> PathBuf {
        self.locks_dir().join(format!("{name}.lock"))
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.locks_dir())?;
        fs::create_dir_all(self.wal_dir())?;
        fs::create_dir_all(self.staging_dir())?;

        let version_path = self.meta_dir().join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let meta_dir = self.meta_dir();
            let mut tmp = NamedTempFile::new_in(&meta_dir)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&meta_dir)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.meta_dir().join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_ROOT)
    }
}
