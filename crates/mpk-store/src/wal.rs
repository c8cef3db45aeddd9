use crate::layout::StoreLayout;
use crate::StoreError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// A single rollback step that undoes one filesystem side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackStep {
    /// Remove a symlink created by the operation.
    RemoveLink(PathBuf),
    /// Remove a directory created by the operation, only if it is empty.
    RemoveDir(PathBuf),
    /// Remove a whole directory tree (e.g. a freshly unpacked package).
    RemoveTree(PathBuf),
    /// Point `link` back at `target`, replacing whatever is there.
    RestoreLink { link: PathBuf, target: PathBuf },
}

impl RollbackStep {
    /// Undo the side effect. Missing paths are not an error.
    pub fn apply(&self) -> Result<(), std::io::Error> {
        match self {
            RollbackStep::RemoveLink(path) => {
                if path.symlink_metadata().is_ok_and(|m| m.file_type().is_symlink()) {
                    fs::remove_file(path)?;
                    debug!("rollback: removed link {}", path.display());
                }
            }
            RollbackStep::RemoveDir(path) => {
                if path.is_dir() {
                    let empty = fs::read_dir(path)?.next().is_none();
                    if empty {
                        fs::remove_dir(path)?;
                        debug!("rollback: removed dir {}", path.display());
                    } else {
                        debug!("rollback: kept non-empty dir {}", path.display());
                    }
                }
            }
            RollbackStep::RemoveTree(path) => {
                if path.symlink_metadata().is_ok() {
                    fs::remove_dir_all(path)?;
                    debug!("rollback: removed tree {}", path.display());
                }
            }
            RollbackStep::RestoreLink { link, target } => {
                if link.symlink_metadata().is_ok_and(|m| m.file_type().is_symlink()) {
                    fs::remove_file(link)?;
                }
                std::os::unix::fs::symlink(target, link)?;
                debug!(
                    "rollback: restored {} -> {}",
                    link.display(),
                    target.display()
                );
            }
        }
        Ok(())
    }
}

/// Apply rollback steps newest first, logging and skipping failures.
pub fn rollback_all(steps: &[RollbackStep]) -> usize {
    let mut failures = 0;
    for step in steps.iter().rev() {
        if let Err(e) = step.apply() {
            warn!("rollback step {step:?} failed: {e}");
            failures += 1;
        }
    }
    failures
}

/// The type of mutating operation being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalOpKind {
    Install,
    Remove,
    Unpack,
}

impl std::fmt::Display for WalOpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalOpKind::Install => write!(f, "install"),
            WalOpKind::Remove => write!(f, "remove"),
            WalOpKind::Unpack => write!(f, "unpack"),
        }
    }
}

/// A WAL entry representing an in-flight operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub op_id: String,
    pub kind: WalOpKind,
    pub package: String,
    pub timestamp: String,
    pub rollback_steps: Vec<RollbackStep>,
}

/// Write-ahead log for crash recovery.
///
/// Mutating engine methods create a WAL entry before starting work,
/// append rollback steps as side effects occur, and remove the entry
/// on successful completion. On startup, incomplete entries are rolled back.
#[derive(Debug, Clone)]
pub struct WriteAheadLog {
    wal_dir: PathBuf,
}

impl WriteAheadLog {
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            wal_dir: layout.wal_dir(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.wal_dir
    }

    /// Ensure the WAL directory exists.
    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.wal_dir)?;
        Ok(())
    }

    /// Begin a new WAL entry for an operation. Returns the op_id.
    pub fn begin(&self, kind: WalOpKind, package: &str) -> Result<String, StoreError> {
        let now = chrono::Utc::now();
        let nanos = now.timestamp_nanos_opt().unwrap_or(0);
        let digest = Sha256::digest(format!("{package}:{nanos}:{}", std::process::id()));
        let op_id = format!(
            "{}-{}",
            now.format("%Y%m%d%H%M%S%3f"),
            &hex::encode(digest)[..8]
        );
        let entry = WalEntry {
            op_id: op_id.clone(),
            kind,
            package: package.to_owned(),
            timestamp: now.to_rfc3339(),
            rollback_steps: Vec::new(),
        };
        self.write_entry(&entry)?;
        debug!("WAL begin: {} for {package} (op_id={op_id})", entry.kind);
        Ok(op_id)
    }

    /// Append a rollback step to an existing WAL entry.
    pub fn add_rollback_step(&self, op_id: &str, step: RollbackStep) -> Result<(), StoreError> {
        let mut entry = self.read_entry(op_id)?;
        entry.rollback_steps.push(step);
        self.write_entry(&entry)?;
        Ok(())
    }

    /// Append several rollback steps with a single rewrite of the entry.
    pub fn add_rollback_steps(
        &self,
        op_id: &str,
        steps: &[RollbackStep],
    ) -> Result<(), StoreError> {
        if steps.is_empty() {
            return Ok(());
        }
        let mut entry = self.read_entry(op_id)?;
        entry.rollback_steps.extend_from_slice(steps);
        self.write_entry(&entry)?;
        Ok(())
    }

    /// Commit (remove) a WAL entry after successful completion.
    pub fn commit(&self, op_id: &str) -> Result<(), StoreError> {
        let path = self.entry_path(op_id);
        if path.exists() {
            fs::remove_file(&path)?;
            debug!("WAL commit: {op_id}");
        }
        Ok(())
    }

    /// Roll back a single entry now and remove it.
    pub fn abort(&self, op_id: &str) -> Result<(), StoreError> {
        let entry = self.read_entry(op_id)?;
        rollback_all(&entry.rollback_steps);
        self.commit(op_id)
    }

    /// List all incomplete WAL entries.
    pub fn list_incomplete(&self) -> Result<Vec<WalEntry>, StoreError> {
        if !self.wal_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.wal_dir)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                match fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str::<WalEntry>(&content) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => {
                            warn!("corrupt WAL entry {}: {e}", path.display());
                            let _ = fs::remove_file(&path);
                        }
                    },
                    Err(e) => {
                        warn!("unreadable WAL entry {}: {e}", path.display());
                        let _ = fs::remove_file(&path);
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }

    /// Roll back all incomplete WAL entries, newest first.
    /// Returns the number of entries rolled back.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let entries = self.list_incomplete()?;
        let count = entries.len();
        for entry in entries.iter().rev() {
            info!(
                "WAL recovery: rolling back {} of {} (op_id={})",
                entry.kind, entry.package, entry.op_id
            );
            rollback_all(&entry.rollback_steps);
            let _ = fs::remove_file(self.entry_path(&entry.op_id));
        }
        if count > 0 {
            info!("WAL recovery complete: {count} entries rolled back");
        }
        Ok(count)
    }

    fn entry_path(&self, op_id: &str) -> PathBuf {
        self.wal_dir.join(format!("{op_id}.json"))
    }

    fn write_entry(&self, entry: &WalEntry) -> Result<(), StoreError> {
        fs::create_dir_all(&self.wal_dir)?;
        let content = serde_json::to_string_pretty(entry)?;
        let mut tmp = NamedTempFile::new_in(&self.wal_dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        let dest = self.entry_path(&entry.op_id);
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        crate::fsync_dir(&self.wal_dir)?;
        Ok(())
    }

    fn read_entry(&self, op_id: &str) -> Result<WalEntry, StoreError> {
        let path = self.entry_path(op_id);
        let content = fs::read_to_string(&path)?;
        let entry: WalEntry = serde_json::from_str(&content)?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn setup() -> (tempfile::TempDir, WriteAheadLog) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        let wal = WriteAheadLog::new(&layout);
        wal.initialize().unwrap();
        (dir, wal)
    }

    #[test]
    fn begin_creates_entry() {
        let (_dir, wal) = setup();
        let op_id = wal.begin(WalOpKind::Install, "testpkg").unwrap();
        assert!(!op_id.is_empty());
        let entries = wal.list_incomplete().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].package, "testpkg");
        assert_eq!(entries[0].kind, WalOpKind::Install);
    }

    #[test]
    fn commit_removes_entry() {
        let (_dir, wal) = setup();
        let op_id = wal.begin(WalOpKind::Install, "testpkg").unwrap();
        assert_eq!(wal.list_incomplete().unwrap().len(), 1);
        wal.commit(&op_id).unwrap();
        assert!(wal.list_incomplete().unwrap().is_empty());
    }

    #[test]
    fn add_rollback_step_persists() {
        let (_dir, wal) = setup();
        let op_id = wal.begin(WalOpKind::Install, "testpkg").unwrap();
        wal.add_rollback_step(&op_id, RollbackStep::RemoveLink(PathBuf::from("/tmp/fake")))
            .unwrap();
        let entries = wal.list_incomplete().unwrap();
        assert_eq!(
            entries[0].rollback_steps,
            vec![RollbackStep::RemoveLink(PathBuf::from("/tmp/fake"))]
        );
    }

    #[test]
    fn add_rollback_steps_appends_in_order() {
        let (_dir, wal) = setup();
        let op_id = wal.begin(WalOpKind::Install, "testpkg").unwrap();
        wal.add_rollback_step(&op_id, RollbackStep::RemoveTree(PathBuf::from("/tmp/pkg")))
            .unwrap();
        let batch = vec![
            RollbackStep::RemoveDir(PathBuf::from("/tmp/root/bin")),
            RollbackStep::RemoveLink(PathBuf::from("/tmp/root/bin/app")),
        ];
        wal.add_rollback_steps(&op_id, &batch).unwrap();
        wal.add_rollback_steps(&op_id, &[]).unwrap();

        let steps = &wal.list_incomplete().unwrap()[0].rollback_steps;
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[1..], batch[..]);
    }

    #[test]
    fn recover_rolls_back_interrupted_install() {
        let (dir, wal) = setup();
        let prefix = dir.path().join("root");
        let bin = prefix.join("bin");
        fs::create_dir_all(&bin).unwrap();
        let link = bin.join("app");
        symlink("/usr/packages/testpkg/data/bin/app", &link).unwrap();

        let op_id = wal.begin(WalOpKind::Install, "testpkg").unwrap();
        wal.add_rollback_step(&op_id, RollbackStep::RemoveDir(bin.clone()))
            .unwrap();
        wal.add_rollback_step(&op_id, RollbackStep::RemoveLink(link.clone()))
            .unwrap();

        // No commit: recovery must undo both steps, link first.
        let count = wal.recover().unwrap();
        assert_eq!(count, 1);
        assert!(link.symlink_metadata().is_err());
        assert!(!bin.exists());
        assert!(prefix.exists());
        assert!(wal.list_incomplete().unwrap().is_empty());
    }

    #[test]
    fn remove_dir_keeps_non_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path().join("etc");
        fs::create_dir(&d).unwrap();
        fs::write(d.join("keep.conf"), "x").unwrap();
        RollbackStep::RemoveDir(d.clone()).apply().unwrap();
        assert!(d.join("keep.conf").exists());
    }

    #[test]
    fn remove_link_ignores_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("file");
        fs::write(&f, "x").unwrap();
        RollbackStep::RemoveLink(f.clone()).apply().unwrap();
        assert!(f.exists());
    }

    #[test]
    fn remove_tree_removes_unpacked_package() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("testpkg-1.0.0");
        fs::create_dir_all(pkg.join("data/bin")).unwrap();
        fs::write(pkg.join("data/bin/app"), "x").unwrap();
        RollbackStep::RemoveTree(pkg.clone()).apply().unwrap();
        assert!(!pkg.exists());
    }

    #[test]
    fn restore_link_repoints_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("testpkg");
        symlink("testpkg-2.0.0", &link).unwrap();
        RollbackStep::RestoreLink {
            link: link.clone(),
            target: PathBuf::from("testpkg-1.0.0"),
        }
        .apply()
        .unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("testpkg-1.0.0"));
    }

    #[test]
    fn abort_rolls_back_immediately() {
        let (dir, wal) = setup();
        let pkg = dir.path().join("unpacked");
        fs::create_dir(&pkg).unwrap();
        let op_id = wal.begin(WalOpKind::Unpack, "testpkg").unwrap();
        wal.add_rollback_step(&op_id, RollbackStep::RemoveTree(pkg.clone()))
            .unwrap();
        wal.abort(&op_id).unwrap();
        assert!(!pkg.exists());
        assert!(wal.list_incomplete().unwrap().is_empty());
    }

    #[test]
    fn recover_with_no_entries_is_noop() {
        let (_dir, wal) = setup();
        assert_eq!(wal.recover().unwrap(), 0);
    }

    #[test]
    fn op_kind_display() {
        assert_eq!(WalOpKind::Install.to_string(), "install");
        assert_eq!(WalOpKind::Remove.to_string(), "remove");
        assert_eq!(WalOpKind::Unpack.to_string(), "unpack");
    }

    #[test]
    fn recover_corrupt_wal_entry_is_removed() {
        let (dir, wal) = setup();
        let corrupt = wal.dir().join("corrupt-op.json");
        fs::write(&corrupt, "THIS IS NOT JSON{{{").unwrap();

        let op_id = wal.begin(WalOpKind::Install, "testpkg").unwrap();
        let orphan = dir.path().join("orphan");
        fs::create_dir_all(&orphan).unwrap();
        wal.add_rollback_step(&op_id, RollbackStep::RemoveTree(orphan.clone()))
            .unwrap();

        let count = wal.recover().unwrap();
        assert_eq!(count, 1, "only the valid entry counts as rolled back");
        assert!(!orphan.exists());
        assert!(!corrupt.exists());
        assert!(wal.list_incomplete().unwrap().is_empty());
    }
}
