use crate::concurrency::{shutdown_requested, PackageLock, StoreLock};
use crate::config::Config;
use crate::CoreError;
use mpk_schema::{
    load_private_key, load_public_key, read_manifest_file, sign_manifest, verify,
    write_manifest_file, PackageManifest, SCHEMA_VERSION,
};
use mpk_store::{
    hash_manifest_files, pack, read_archive_manifest, read_unpacked_manifest, unpack,
    verify_manifest_files, InstallReport, Installer, IntegrityReport, RollbackStep,
    StoreLayout, WalOpKind, WriteAheadLog, DATA_DIR, MANIFEST_FILE, TOOL_DIR,
};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Manifest template read from a package source tree by `create`.
pub const TEMPLATE_FILE: &str = "manifest-tmpl.json";

/// Outcome of checking a manifest signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    Valid,
    Invalid,
    Unsigned,
    /// Signed, but no public key was available to check it.
    NotChecked,
}

impl SignatureStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SignatureStatus::Valid => "valid",
            SignatureStatus::Invalid => "invalid",
            SignatureStatus::Unsigned => "unsigned",
            SignatureStatus::NotChecked => "not checked",
        }
    }
}

impl std::fmt::Display for SignatureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct CreateResult {
    pub archive: PathBuf,
    pub manifest: PackageManifest,
    /// Number of files whose digest was recorded.
    pub hashed: usize,
}

#[derive(Debug)]
pub struct VerifyReport {
    pub manifest: PackageManifest,
    pub signature: SignatureStatus,
    pub integrity: IntegrityReport,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.signature != SignatureStatus::Invalid && self.integrity.is_ok()
    }
}

#[derive(Debug)]
pub struct InstallResult {
    pub manifest: PackageManifest,
    /// `<store_root>/<name>-<version>`
    pub package_dir: PathBuf,
    /// False when the versioned directory was already in the store.
    pub unpacked: bool,
    pub signature: SignatureStatus,
    pub report: InstallReport,
}

#[derive(Debug, Default)]
pub struct RemoveResult {
    pub links_removed: usize,
    pub identity_removed: bool,
    /// Versioned directory deleted by `--purge`.
    pub purged: Option<PathBuf>,
}

fn check_interrupt() -> Result<(), CoreError> {
    if shutdown_requested() {
        return Err(CoreError::Interrupted);
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() || name.contains('/') || name.starts_with('.') {
        return Err(CoreError::InvalidName(name.to_owned()));
    }
    Ok(())
}

/// Entry point for every package operation.
///
/// Mutating pipelines run under a shared store lock plus an exclusive
/// per-package lock, and journal their side effects in the store's
/// write-ahead log so a crash is rolled back by the next `Engine::new`.
pub struct Engine {
    config: Config,
    layout: StoreLayout,
    wal: WriteAheadLog,
}

impl Engine {
    /// Create an engine for the configured store.
    ///
    /// If the store exists and no other process is using it, incomplete
    /// journal entries from previous runs are rolled back and leftover
    /// extraction directories are removed.
    pub fn new(config: Config) -> Self {
        let layout = config.layout();
        let wal = WriteAheadLog::new(&layout);

        if layout.meta_dir().is_dir() {
            match StoreLock::try_acquire(&layout.lock_file()) {
                Ok(Some(_lock)) => {
                    if let Err(e) = wal.recover() {
                        warn!("WAL recovery failed: {e}");
                    }
                    clean_staging(&layout.staging_dir());
                }
                Ok(None) => {
                    debug!("store in use; skipping WAL recovery");
                }
                Err(e) => {
                    warn!("store lock check failed; skipping WAL recovery: {e}");
                }
            }
        }

        Self {
            config,
            layout,
            wal,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Build `<out_dir>/<name>-<version>.mpk` from a source tree holding
    /// `manifest-tmpl.json`, `tool/` and `data/`.
    ///
    /// The completed manifest is also written to `<src_dir>/manifest.json`.
    /// Without a key (argument or config) the package is left unsigned.
    pub fn create(
        &self,
        src_dir: &Path,
        out_dir: &Path,
        key: Option<&Path>,
    ) -> Result<CreateResult, CoreError> {
        info!("creating package from {}", src_dir.display());
        let mut manifest = read_manifest_file(src_dir.join(TEMPLATE_FILE))?;
        manifest.info().validate_identity()?;
        if manifest.info().schema_version.is_empty() {
            manifest.info_mut().schema_version = SCHEMA_VERSION;
        }

        let hashed = hash_manifest_files(
            &mut manifest,
            &src_dir.join(TOOL_DIR),
            &src_dir.join(DATA_DIR),
        )?;
        debug!("hashed {hashed} files");

        let package_id = manifest.info().package_id();
        match key.or(self.config.private_key.as_deref()) {
            Some(key_path) => {
                let key = load_private_key(key_path)?;
                sign_manifest(&mut manifest, &key)?;
                info!("signed {package_id} with {}", key_path.display());
            }
            None => warn!("no signing key configured; {package_id} will be unsigned"),
        }

        write_manifest_file(src_dir.join(MANIFEST_FILE), &manifest)?;
        let archive = pack(&manifest, src_dir, out_dir)?;
        Ok(CreateResult {
            archive,
            manifest,
            hashed,
        })
    }

    /// Extract a package into `<out_dir>/<archive stem>`.
    pub fn unpack(&self, package: &Path, out_dir: &Path) -> Result<PathBuf, CoreError> {
        Ok(unpack(package, out_dir)?)
    }

    /// Read a package's manifest without extracting its payload.
    pub fn inspect(&self, package: &Path) -> Result<PackageManifest, CoreError> {
        Ok(read_archive_manifest(package)?)
    }

    /// Check signature and file digests of a package. `key` overrides the
    /// configured public key.
    pub fn verify(&self, package: &Path, key: Option<&Path>) -> Result<VerifyReport, CoreError> {
        let scratch = tempfile::tempdir()?;
        let dir = unpack(package, scratch.path())?;
        let manifest = read_unpacked_manifest(&dir)?;
        let signature = self.check_signature(&manifest, key)?;
        let integrity =
            verify_manifest_files(&manifest, &dir.join(TOOL_DIR), &dir.join(DATA_DIR));
        info!(
            "verified {}: signature {signature}, {}/{} files ok",
            manifest.info().package_id(),
            integrity.passed,
            integrity.checked
        );
        Ok(VerifyReport {
            manifest,
            signature,
            integrity,
        })
    }

    fn check_signature(
        &self,
        manifest: &PackageManifest,
        key: Option<&Path>,
    ) -> Result<SignatureStatus, CoreError> {
        if !manifest.is_signed() {
            return Ok(SignatureStatus::Unsigned);
        }
        let Some(key_path) = key.or(self.config.public_key.as_deref()) else {
            return Ok(SignatureStatus::NotChecked);
        };
        let key = load_public_key(key_path)?;
        if verify(manifest, &key)? {
            Ok(SignatureStatus::Valid)
        } else {
            Ok(SignatureStatus::Invalid)
        }
    }

    /// Unpack a package into the store and link it into `prefix`.
    ///
    /// Stages: unpack to `<store_root>/<name>-<version>`, verify the
    /// signature and every file digest, point `<store_root>/<name>` at the
    /// versioned directory, then create the prefix symlinks. A failure or
    /// Ctrl-C at any stage undoes everything this call created.
    pub fn install(&self, package: &Path, prefix: &Path) -> Result<InstallResult, CoreError> {
        let header = read_archive_manifest(package)?;
        header.info().validate_identity()?;
        let name = header.name().to_owned();
        let package_id = header.info().package_id();
        info!("installing {package_id} into {}", prefix.display());

        self.layout.initialize()?;
        let _store = StoreLock::acquire_shared(&self.layout.lock_file())?;
        let _lock = PackageLock::acquire(&self.layout, &name)?;

        let op_id = self.wal.begin(WalOpKind::Install, &name)?;
        match self.install_journaled(package, prefix, &header, &op_id) {
            Ok(result) => {
                self.wal.commit(&op_id)?;
                info!("installed {package_id}");
                Ok(result)
            }
            Err(e) => {
                warn!("install of {package_id} failed, rolling back: {e}");
                if let Err(rollback) = self.wal.abort(&op_id) {
                    warn!("rollback of {package_id} incomplete: {rollback}");
                }
                Err(e)
            }
        }
    }

    fn install_journaled(
        &self,
        package: &Path,
        prefix: &Path,
        header: &PackageManifest,
        op_id: &str,
    ) -> Result<InstallResult, CoreError> {
        let package_id = header.info().package_id();
        let package_dir = self.layout.versioned_dir(&package_id);

        check_interrupt()?;
        let unpacked = if package_dir.symlink_metadata().is_ok() {
            debug!("{} already in store", package_dir.display());
            false
        } else {
            let staged = unpack(package, &self.layout.staging_dir())?;
            self.wal
                .add_rollback_step(op_id, RollbackStep::RemoveTree(staged.clone()))?;
            self.wal
                .add_rollback_step(op_id, RollbackStep::RemoveTree(package_dir.clone()))?;
            fs::rename(&staged, &package_dir)?;
            debug!("unpacked into {}", package_dir.display());
            true
        };

        let manifest = read_unpacked_manifest(&package_dir)?;
        if manifest.name() != header.name() || manifest.version() != header.version() {
            return Err(CoreError::StoreConflict(format!(
                "{} does not hold {package_id}",
                package_dir.display()
            )));
        }
        if !unpacked && manifest != *header {
            return Err(CoreError::StoreConflict(format!(
                "{} holds a different build of {package_id} than {}",
                package_dir.display(),
                package.display()
            )));
        }

        check_interrupt()?;
        let signature = self.check_signature(&manifest, None)?;
        match signature {
            SignatureStatus::Invalid => return Err(CoreError::BadSignature(package_id)),
            SignatureStatus::Unsigned if self.config.require_signature => {
                return Err(CoreError::Unsigned(package_id));
            }
            SignatureStatus::NotChecked if self.config.require_signature => {
                return Err(CoreError::Config(
                    "require_signature is set but no public_key is configured".to_owned(),
                ));
            }
            SignatureStatus::Unsigned => warn!("installing unsigned package {package_id}"),
            SignatureStatus::NotChecked => {
                warn!("no public key configured; signature of {package_id} not checked");
            }
            SignatureStatus::Valid => debug!("signature of {package_id} is valid"),
        }

        let integrity = verify_manifest_files(
            &manifest,
            &package_dir.join(TOOL_DIR),
            &package_dir.join(DATA_DIR),
        );
        if !integrity.is_ok() {
            for failure in &integrity.failed {
                warn!("{}: {}", failure.path, failure.reason);
            }
            return Err(CoreError::IntegrityMismatch {
                package: package_id,
                failed: integrity.failed.len(),
            });
        }

        check_interrupt()?;
        self.point_package_link(manifest.name(), &package_id, op_id)?;

        let report = Installer::new(self.layout.clone())
            .with_journal(self.wal.clone(), op_id)
            .install(&manifest, &package_dir, prefix)?;
        check_interrupt()?;

        Ok(InstallResult {
            manifest,
            package_dir,
            unpacked,
            signature,
            report,
        })
    }

    /// Make `<store_root>/<name>` a relative link to `<name>-<version>`.
    fn point_package_link(
        &self,
        name: &str,
        package_id: &str,
        op_id: &str,
    ) -> Result<(), CoreError> {
        let link = self.layout.package_link(name);
        let target = PathBuf::from(package_id);
        match link.symlink_metadata() {
            Ok(meta) if meta.file_type().is_symlink() => {
                let current = fs::read_link(&link)?;
                if current == target {
                    return Ok(());
                }
                self.wal.add_rollback_step(
                    op_id,
                    RollbackStep::RestoreLink {
                        link: link.clone(),
                        target: current.clone(),
                    },
                )?;
                let tmp = self.layout.root().join(format!(".{name}.link-tmp"));
                if tmp.symlink_metadata().is_ok() {
                    fs::remove_file(&tmp)?;
                }
                symlink(&target, &tmp)?;
                fs::rename(&tmp, &link)?;
                info!("switched {name} from {} to {package_id}", current.display());
                Ok(())
            }
            Ok(_) => Err(CoreError::StoreConflict(format!(
                "{} exists and is not a symlink",
                link.display()
            ))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.wal
                    .add_rollback_step(op_id, RollbackStep::RemoveLink(link.clone()))?;
                symlink(&target, &link)?;
                debug!("linked {} -> {package_id}", link.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a package's symlinks from `prefix`. With `purge`, also drop
    /// `<store_root>/<name>` and the versioned directory it points at.
    pub fn remove(
        &self,
        name: &str,
        prefix: &Path,
        purge: bool,
    ) -> Result<RemoveResult, CoreError> {
        validate_name(name)?;
        info!("removing {name} from {}", prefix.display());

        self.layout.initialize()?;
        let _store = StoreLock::acquire_shared(&self.layout.lock_file())?;
        let _lock = PackageLock::acquire(&self.layout, name)?;

        // Unlinking cannot be undone; the entry only marks the removal as
        // in flight for recovery logs.
        let op_id = self.wal.begin(WalOpKind::Remove, name)?;
        let result = self.remove_locked(name, prefix, purge);
        self.wal.commit(&op_id)?;
        result
    }

    fn remove_locked(
        &self,
        name: &str,
        prefix: &Path,
        purge: bool,
    ) -> Result<RemoveResult, CoreError> {
        let report = Installer::new(self.layout.clone()).uninstall(name, prefix)?;
        let purged = if purge { self.purge(name)? } else { None };
        Ok(RemoveResult {
            links_removed: report.links_removed,
            identity_removed: report.identity_removed,
            purged,
        })
    }

    fn purge(&self, name: &str) -> Result<Option<PathBuf>, CoreError> {
        let link = self.layout.package_link(name);
        let Ok(target) = fs::read_link(&link) else {
            debug!("{} is not a package link, nothing to purge", link.display());
            return Ok(None);
        };
        let package_dir = self.layout.root().join(&target);
        if package_dir.parent() != Some(self.layout.root()) {
            return Err(CoreError::StoreConflict(format!(
                "{} points outside the store: {}",
                link.display(),
                target.display()
            )));
        }
        fs::remove_file(&link)?;
        if package_dir.is_dir() {
            fs::remove_dir_all(&package_dir)?;
        }
        info!("purged {}", package_dir.display());
        Ok(Some(package_dir))
    }
}

fn clean_staging(staging: &Path) {
    let Ok(entries) = fs::read_dir(staging) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        debug!("removing stale staging entry {}", path.display());
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(e) = removed {
            warn!("cannot remove {}: {e}", path.display());
        }
    }
}
