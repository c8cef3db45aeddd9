use crate::CoreError;
use fs2::FileExt;
use mpk_store::StoreLayout;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

fn open_lock_file(lock_path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?)
}

/// Advisory lock on a file, released on drop.
#[derive(Debug)]
pub struct StoreLock {
    lock_file: File,
}

impl StoreLock {
    pub fn acquire(lock_path: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(lock_path)?;
        file.lock_exclusive()
            .map_err(|e| CoreError::Locked(format!("{}: {e}", lock_path.display())))?;
        Ok(Self { lock_file: file })
    }

    /// Shared lock: any number of holders, excluded only by `acquire`.
    pub fn acquire_shared(lock_path: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(lock_path)?;
        file.lock_shared()
            .map_err(|e| CoreError::Locked(format!("{}: {e}", lock_path.display())))?;
        Ok(Self { lock_file: file })
    }

    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, CoreError> {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

/// Lock serializing install and remove of one package name.
#[derive(Debug)]
pub struct PackageLock {
    name: String,
    _lock: StoreLock,
}

impl PackageLock {
    /// Block until no other process holds the lock for `name`.
    pub fn acquire(layout: &StoreLayout, name: &str) -> Result<Self, CoreError> {
        let lock = StoreLock::acquire(&layout.package_lock_file(name))?;
        debug!("acquired package lock for {name}");
        Ok(Self {
            name: name.to_owned(),
            _lock: lock,
        })
    }

    /// Fail with [`CoreError::Locked`] instead of waiting.
    pub fn try_acquire(layout: &StoreLayout, name: &str) -> Result<Self, CoreError> {
        match StoreLock::try_acquire(&layout.package_lock_file(name))? {
            Some(lock) => Ok(Self {
                name: name.to_owned(),
                _lock: lock,
            }),
            None => Err(CoreError::Locked(format!(
                "package '{name}' is being modified by another process"
            ))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// The first Ctrl-C asks the running pipeline to stop at its next stage
/// boundary; a second one exits immediately.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\ninterrupt received, rolling back at the next safe point...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");

        {
            let _lock = StoreLock::acquire(&lock_path).unwrap();
            assert!(lock_path.exists());
        }

        let again = StoreLock::try_acquire(&lock_path).unwrap();
        assert!(again.is_some());
    }

    #[test]
    fn try_acquire_returns_none_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");

        let _lock = StoreLock::acquire(&lock_path).unwrap();
        assert!(StoreLock::try_acquire(&lock_path).unwrap().is_none());
    }

    #[test]
    fn shared_holders_block_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("store.lock");

        let a = StoreLock::acquire_shared(&lock_path).unwrap();
        let b = StoreLock::acquire_shared(&lock_path).unwrap();
        assert!(StoreLock::try_acquire(&lock_path).unwrap().is_none());
        drop(a);
        drop(b);
        assert!(StoreLock::try_acquire(&lock_path).unwrap().is_some());
    }

    #[test]
    fn package_lock_is_per_name() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());

        let held = PackageLock::acquire(&layout, "testpkg").unwrap();
        assert_eq!(held.name(), "testpkg");
        assert!(layout.package_lock_file("testpkg").exists());
        assert!(matches!(
            PackageLock::try_acquire(&layout, "testpkg"),
            Err(CoreError::Locked(_))
        ));
        assert!(PackageLock::try_acquire(&layout, "otherpkg").is_ok());

        drop(held);
        assert!(PackageLock::try_acquire(&layout, "testpkg").is_ok());
    }
}
