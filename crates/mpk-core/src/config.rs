use crate::CoreError;
use mpk_store::{StoreLayout, DEFAULT_STORE_ROOT};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mpk/mpk.toml";
/// Overrides [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_ENV: &str = "MPK_CONFIG";

/// Toolchain settings, read from `/etc/mpk/mpk.toml`.
///
/// ```toml
/// store_root = "/usr/packages"
/// default_prefix = "/"
/// private_key = "/etc/mpk/keys/vendor.pem"
/// public_key = "/etc/mpk/keys/vendor.pub.pem"
/// require_signature = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Where unpacked packages are kept.
    pub store_root: PathBuf,
    /// Absolute store path installed symlinks point at; defaults to
    /// `store_root`. Set it when installing into an image mounted elsewhere.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_root: Option<PathBuf>,
    pub default_prefix: PathBuf,
    /// Key used by `create` when none is given on the command line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PathBuf>,
    /// Key packages are verified against on install.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PathBuf>,
    pub require_signature: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from(DEFAULT_STORE_ROOT),
            link_root: None,
            default_prefix: PathBuf::from("/"),
            private_key: None,
            public_key: None,
            require_signature: false,
        }
    }
}

impl Config {
    /// Config rooted at `store_root` with every other field defaulted.
    pub fn with_store(store_root: impl Into<PathBuf>) -> Self {
        Self {
            store_root: store_root.into(),
            ..Self::default()
        }
    }

    pub fn layout(&self) -> StoreLayout {
        let layout = StoreLayout::new(&self.store_root);
        match &self.link_root {
            Some(link_root) => layout.with_link_root(link_root),
            None => layout,
        }
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| CoreError::Config(format!("invalid config {}: {e}", path.display())))
    }

    /// Load `$MPK_CONFIG` if set, else `/etc/mpk/mpk.toml`. A missing
    /// system file yields the defaults; a missing `$MPK_CONFIG` is an error.
    pub fn load_default() -> Result<Self, CoreError> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        Self::load_or_default(Path::new(DEFAULT_CONFIG_PATH))
    }

    pub fn load_or_default(path: &Path) -> Result<Self, CoreError> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!("no config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| CoreError::Config(format!("cannot serialize config: {e}")))?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| CoreError::Io(e.error))?;
        Ok(())
    }
}
