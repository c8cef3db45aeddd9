//! Projection of an unpacked package into a prefix as a symlink farm.
//!
//! Every data file `rel` of package `name` becomes a symlink
//! `<prefix>/<rel>` → `<link_root>/<name>/data/<rel>`; directory entries
//! become real directories. The package itself is reachable through the
//! identity link `<prefix>/usr/packages/<name>` → `<link_root>/<name>`.

use crate::archive::{read_unpacked_manifest, DATA_DIR};
use crate::integrity::{resolve_relative, IntegrityError};
use crate::layout::StoreLayout;
use crate::wal::{rollback_all, RollbackStep, WriteAheadLog};
use crate::StoreError;
use mpk_schema::{FileType, PackageManifest};
use std::collections::HashSet;
use std::fs;
use std::io::{self, ErrorKind};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const IDENTITY_DIR: &str = "usr/packages";

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("path already exists and is not provided by this package: {0}")]
    PathCollision(PathBuf),
    #[error("failed to create symlink {path}: {source}")]
    SymlinkFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("payload file missing from unpacked package: {0}")]
    MissingPayload(PathBuf),
    #[error("manifest cannot be installed: {0}")]
    InvalidManifest(String),
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("install journal: {0}")]
    Journal(#[from] StoreError),
}

fn io_error(path: &Path, source: io::Error) -> InstallError {
    if source.kind() == ErrorKind::PermissionDenied {
        InstallError::PermissionDenied(path.to_path_buf())
    } else {
        InstallError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn invalid_path(err: IntegrityError) -> InstallError {
    InstallError::InvalidManifest(err.to_string())
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub links_created: usize,
    pub dirs_created: usize,
    /// Paths that already held the wanted content and were left alone.
    pub already_provided: Vec<PathBuf>,
    pub identity_link: PathBuf,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UninstallReport {
    pub links_removed: usize,
    pub identity_removed: bool,
}

#[derive(Debug)]
struct Journal {
    wal: WriteAheadLog,
    op_id: String,
}

/// Paths created during one `install` call. Dropping an uncommitted batch
/// removes them again, newest first.
struct Batch {
    steps: Vec<RollbackStep>,
    committed: bool,
}

impl Batch {
    fn new() -> Self {
        Self {
            steps: Vec::new(),
            committed: false,
        }
    }

    fn push(&mut self, step: RollbackStep) {
        self.steps.push(step);
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        if self.committed || self.steps.is_empty() {
            return;
        }
        let failures = rollback_all(&self.steps);
        if failures > 0 {
            warn!("install rollback left {failures} path(s) behind");
        } else {
            debug!("install rolled back {} path(s)", self.steps.len());
        }
    }
}

/// One filesystem change an install makes.
enum Action {
    Dir(PathBuf),
    Link { path: PathBuf, target: PathBuf },
}

impl Action {
    fn rollback_step(&self) -> RollbackStep {
        match self {
            Action::Dir(path) => RollbackStep::RemoveDir(path.clone()),
            Action::Link { path, .. } => RollbackStep::RemoveLink(path.clone()),
        }
    }

    fn apply(&self) -> Result<(), InstallError> {
        match self {
            Action::Dir(path) => {
                fs::create_dir(path).map_err(|e| io_error(path, e))?;
                debug!("created dir {}", path.display());
            }
            Action::Link { path, target } => {
                symlink(target, path).map_err(|source| match source.kind() {
                    ErrorKind::PermissionDenied => InstallError::PermissionDenied(path.clone()),
                    _ => InstallError::SymlinkFailed {
                        path: path.clone(),
                        source,
                    },
                })?;
                debug!("linked {} -> {}", path.display(), target.display());
            }
        }
        Ok(())
    }
}

/// Every change an install will make, worked out before any is made.
/// Collisions are found here, so a conflicting install touches nothing.
#[derive(Default)]
struct Plan {
    actions: Vec<Action>,
    dirs: HashSet<PathBuf>,
    links: HashSet<PathBuf>,
    already_provided: Vec<PathBuf>,
}

impl Plan {
    /// Plan `dir` and any missing ancestors. An existing symlink to a
    /// directory counts as a directory.
    fn dir(&mut self, dir: &Path) -> Result<(), InstallError> {
        let mut missing = Vec::new();
        let mut cursor = Some(dir);
        while let Some(p) = cursor {
            if self.links.contains(p) {
                return Err(InstallError::PathCollision(p.to_path_buf()));
            }
            if self.dirs.contains(p) || p.is_dir() {
                break;
            }
            if p.symlink_metadata().is_ok() {
                return Err(InstallError::PathCollision(p.to_path_buf()));
            }
            missing.push(p.to_path_buf());
            cursor = p.parent();
        }
        for p in missing.into_iter().rev() {
            self.dirs.insert(p.clone());
            self.actions.push(Action::Dir(p));
        }
        Ok(())
    }

    fn link(&mut self, path: PathBuf, target: PathBuf) -> Result<(), InstallError> {
        if let Some(parent) = path.parent() {
            self.dir(parent)?;
        }
        if self.dirs.contains(&path) {
            return Err(InstallError::PathCollision(path));
        }
        if self.links.contains(&path) {
            self.already_provided.push(path);
            return Ok(());
        }
        match path.symlink_metadata() {
            Ok(meta) => {
                let provided = if meta.file_type().is_symlink() {
                    is_symlink_to(&path, &target) || same_location(&path, &target)
                } else {
                    meta.is_file() || same_location(&path, &target)
                };
                if !provided {
                    return Err(InstallError::PathCollision(path));
                }
                debug!("already provided: {}", path.display());
                self.already_provided.push(path);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.links.insert(path.clone());
                self.actions.push(Action::Link { path, target });
            }
            Err(e) => return Err(io_error(&path, e)),
        }
        Ok(())
    }
}

/// Installs and uninstalls packages into a prefix.
#[derive(Debug)]
pub struct Installer {
    layout: StoreLayout,
    journal: Option<Journal>,
}

impl Installer {
    pub fn new(layout: StoreLayout) -> Self {
        Self {
            layout,
            journal: None,
        }
    }

    /// Persist every created path under the given write-ahead log entry.
    #[must_use]
    pub fn with_journal(mut self, wal: WriteAheadLog, op_id: impl Into<String>) -> Self {
        self.journal = Some(Journal {
            wal,
            op_id: op_id.into(),
        });
        self
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// `<prefix>/usr/packages/<name>`
    pub fn identity_link(&self, prefix: &Path, name: &str) -> PathBuf {
        prefix.join(IDENTITY_DIR).join(name)
    }

    /// Project `manifest` into `prefix`. `unpacked_dir` is the package's
    /// directory in the store and must contain every payload file.
    ///
    /// Either every path is placed or nothing created by this call remains.
    /// The whole change set is journaled in one write before the first
    /// change; undoing a step whose path was never created is a no-op.
    pub fn install(
        &self,
        manifest: &PackageManifest,
        unpacked_dir: &Path,
        prefix: &Path,
    ) -> Result<InstallReport, InstallError> {
        let info = manifest.info();
        let plan = self.plan(manifest, unpacked_dir, prefix)?;
        let steps: Vec<RollbackStep> = plan.actions.iter().map(Action::rollback_step).collect();
        if let Some(j) = &self.journal {
            j.wal.add_rollback_steps(&j.op_id, &steps)?;
        }

        let mut report = InstallReport {
            already_provided: plan.already_provided,
            identity_link: self.identity_link(prefix, &info.name),
            ..InstallReport::default()
        };
        let mut batch = Batch::new();
        for (action, step) in plan.actions.iter().zip(steps) {
            action.apply()?;
            batch.push(step);
            match action {
                Action::Dir(_) => report.dirs_created += 1,
                Action::Link { .. } => report.links_created += 1,
            }
        }
        batch.commit();

        info!(
            "installed {} into {}: {} links, {} dirs, {} already provided",
            info.package_id(),
            prefix.display(),
            report.links_created,
            report.dirs_created,
            report.already_provided.len()
        );
        Ok(report)
    }

    fn plan(
        &self,
        manifest: &PackageManifest,
        unpacked_dir: &Path,
        prefix: &Path,
    ) -> Result<Plan, InstallError> {
        let info = manifest.info();
        info.validate_identity()
            .map_err(|e| InstallError::InvalidManifest(e.to_string()))?;
        let name = info.name.as_str();
        let data_root = unpacked_dir.join(DATA_DIR);

        for entry in &info.data_files {
            match entry.file_type {
                FileType::Directory => {
                    resolve_relative(prefix, &entry.relative_path).map_err(invalid_path)?;
                }
                FileType::Undefined => {
                    return Err(InstallError::InvalidManifest(format!(
                        "file '{}' has an undefined type",
                        entry.relative_path
                    )));
                }
                _ => {
                    let payload =
                        resolve_relative(&data_root, &entry.relative_path).map_err(invalid_path)?;
                    if payload.symlink_metadata().is_err() {
                        return Err(InstallError::MissingPayload(payload));
                    }
                }
            }
        }

        let mut plan = Plan::default();
        for entry in &info.data_files {
            let path = resolve_relative(prefix, &entry.relative_path).map_err(invalid_path)?;
            if entry.file_type == FileType::Directory {
                plan.dir(&path)?;
            } else {
                let target = self.layout.data_link_target(name, &entry.relative_path);
                plan.link(path, target)?;
            }
        }
        plan.link(self.identity_link(prefix, name), self.layout.link_target(name))?;
        Ok(plan)
    }

    /// Remove the package's symlinks from `prefix`, plus its identity link.
    /// Directories are left in place.
    ///
    /// The paths come from the installed manifest in the store. Only when
    /// that manifest cannot be read is `prefix` scanned for links into the
    /// package's data; the scan stays on one filesystem and skips what it
    /// cannot read.
    pub fn uninstall(&self, name: &str, prefix: &Path) -> Result<UninstallReport, InstallError> {
        let mut report = UninstallReport::default();
        if !prefix.is_dir() {
            return Ok(report);
        }

        let package_link = self.layout.package_link(name);
        if package_link.symlink_metadata().is_ok() {
            match read_unpacked_manifest(&package_link) {
                Ok(manifest) if manifest.name() == name => {
                    report.links_removed = self.remove_listed_links(&manifest, prefix)?;
                }
                Ok(manifest) => {
                    warn!(
                        "{} holds package '{}', not '{name}'; scanning {}",
                        package_link.display(),
                        manifest.name(),
                        prefix.display()
                    );
                    report.links_removed = self.remove_links_by_scan(name, prefix)?;
                }
                Err(e) => {
                    warn!(
                        "installed manifest of {name} unreadable ({e}); scanning {}",
                        prefix.display()
                    );
                    report.links_removed = self.remove_links_by_scan(name, prefix)?;
                }
            }
        } else {
            debug!("{name} is not in the store; checking its identity link only");
        }

        let identity = self.identity_link(prefix, name);
        if is_symlink_to(&identity, &self.layout.link_target(name)) {
            report.identity_removed = remove_link(&identity)?;
        }

        info!(
            "uninstalled {name} from {}: {} links removed",
            prefix.display(),
            report.links_removed
        );
        Ok(report)
    }

    fn remove_listed_links(
        &self,
        manifest: &PackageManifest,
        prefix: &Path,
    ) -> Result<usize, InstallError> {
        let name = manifest.name();
        let mut removed = 0;
        for entry in &manifest.info().data_files {
            if !entry.file_type.is_payload() {
                continue;
            }
            let Ok(path) = resolve_relative(prefix, &entry.relative_path) else {
                warn!("skipping invalid path '{}'", entry.relative_path);
                continue;
            };
            let target = self.layout.data_link_target(name, &entry.relative_path);
            if is_symlink_to(&path, &target) && remove_link(&path)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn remove_links_by_scan(&self, name: &str, prefix: &Path) -> Result<usize, InstallError> {
        let data_target = self.layout.link_target(name).join(DATA_DIR);
        let store_mirror = prefix.join(IDENTITY_DIR);
        let walker = WalkDir::new(prefix)
            .follow_links(false)
            .same_file_system(true)
            .into_iter()
            .filter_entry(|e| e.path() != store_mirror);

        let mut removed = 0;
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("skipping unreadable path under {}: {e}", prefix.display());
                    continue;
                }
            };
            if !entry.path_is_symlink() {
                continue;
            }
            let path = entry.path();
            match fs::read_link(path) {
                Ok(target) if target.starts_with(&data_target) => {
                    if remove_link(path)? {
                        removed += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("skipping {}: {e}", path.display()),
            }
        }
        Ok(removed)
    }
}

/// Remove a symlink; one that has already vanished is not an error.
fn remove_link(path: &Path) -> Result<bool, InstallError> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("removed {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error(path, e)),
    }
}

fn is_symlink_to(path: &Path, target: &Path) -> bool {
    fs::read_link(path).is_ok_and(|t| t == target)
}

/// Both paths exist and resolve to the same location.
fn same_location(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
