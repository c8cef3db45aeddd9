use mpk_schema::{FileEntry, FileHash, FileType, PackageManifest};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("file path escapes its base directory: {0}")]
    InvalidPath(String),
}

/// Resolve `relative_path` under `base_dir`, refusing absolute paths and
/// `..` components.
pub fn resolve_relative(base_dir: &Path, relative_path: &str) -> Result<PathBuf, IntegrityError> {
    let rel = Path::new(relative_path);
    if relative_path.is_empty()
        || rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(IntegrityError::InvalidPath(relative_path.to_owned()));
    }
    Ok(base_dir.join(rel))
}

/// SHA-256 of `base_dir/relative_path`, streamed in fixed-size chunks.
pub fn hash_file(base_dir: &Path, relative_path: &str) -> Result<FileHash, IntegrityError> {
    let path = resolve_relative(base_dir, relative_path)?;
    let mut file = File::open(&path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => IntegrityError::NotFound(path.clone()),
        _ => IntegrityError::ReadFailed {
            path: path.clone(),
            source: e,
        },
    })?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(IntegrityError::ReadFailed { path, source: e }),
        };
        hasher.update(&buf[..n]);
    }
    Ok(FileHash::new(hasher.finalize().into()))
}

/// Target stored in the symlink `base_dir/relative_path`.
pub fn read_link_target(base_dir: &Path, relative_path: &str) -> Result<PathBuf, IntegrityError> {
    let path = resolve_relative(base_dir, relative_path)?;
    fs::read_link(&path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => IntegrityError::NotFound(path.clone()),
        _ => IntegrityError::ReadFailed {
            path: path.clone(),
            source: e,
        },
    })
}

fn compute_hashes(
    entries: &[FileEntry],
    root: &Path,
    select: impl Fn(&FileEntry) -> bool,
) -> Result<Vec<Option<FileHash>>, IntegrityError> {
    entries
        .iter()
        .map(|entry| {
            if select(entry) {
                let h = hash_file(root, &entry.relative_path)?;
                debug!("hashed {}: {h}", entry.relative_path);
                Ok(Some(h))
            } else {
                Ok(entry.content_hash)
            }
        })
        .collect()
}

/// Hash every tool file under `tool_root` and every hashed data file under
/// `data_root`, storing the digests in the manifest.
///
/// All digests are computed before any is stored; on error the manifest is
/// left exactly as it was. Storing new digests clears any signature.
pub fn hash_manifest_files(
    manifest: &mut PackageManifest,
    tool_root: &Path,
    data_root: &Path,
) -> Result<usize, IntegrityError> {
    let info = manifest.info();
    let tool = compute_hashes(&info.tool_files, tool_root, |_| true)?;
    let data = compute_hashes(&info.data_files, data_root, |e| e.file_type.is_hashed())?;

    let count = info.tool_files.len()
        + info
            .data_files
            .iter()
            .filter(|e| e.file_type.is_hashed())
            .count();

    let info = manifest.info_mut();
    for (entry, hash) in info.tool_files.iter_mut().zip(tool) {
        entry.content_hash = hash;
    }
    for (entry, hash) in info.data_files.iter_mut().zip(data) {
        entry.content_hash = hash;
    }
    Ok(count)
}

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub checked: usize,
    pub passed: usize,
    pub failed: Vec<IntegrityFailure>,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityFailure {
    pub path: String,
    pub reason: String,
}

fn check_entries(
    report: &mut IntegrityReport,
    prefix: &str,
    entries: &[FileEntry],
    root: &Path,
    select: impl Fn(&FileEntry) -> bool,
) {
    for entry in entries.iter().filter(|e| select(e)) {
        report.checked += 1;
        let display = format!("{prefix}/{}", entry.relative_path);
        let Some(expected) = entry.content_hash else {
            report.failed.push(IntegrityFailure {
                path: display,
                reason: "no hash recorded in manifest".to_owned(),
            });
            continue;
        };
        match hash_file(root, &entry.relative_path) {
            Ok(actual) if actual == expected => report.passed += 1,
            Ok(actual) => report.failed.push(IntegrityFailure {
                path: display,
                reason: format!("hash mismatch: expected {expected}, got {actual}"),
            }),
            Err(e) => report.failed.push(IntegrityFailure {
                path: display,
                reason: e.to_string(),
            }),
        }
    }
}

fn check_links(report: &mut IntegrityReport, entries: &[FileEntry], root: &Path) {
    for entry in entries.iter().filter(|e| e.file_type == FileType::Symlink) {
        report.checked += 1;
        let display = format!("data/{}", entry.relative_path);
        let expected = entry.symlink_target.as_deref().unwrap_or_default();
        match read_link_target(root, &entry.relative_path) {
            Ok(actual) if actual == Path::new(expected) => report.passed += 1,
            Ok(actual) => report.failed.push(IntegrityFailure {
                path: display,
                reason: format!(
                    "link target mismatch: expected {expected}, got {}",
                    actual.display()
                ),
            }),
            Err(e) => report.failed.push(IntegrityFailure {
                path: display,
                reason: e.to_string(),
            }),
        }
    }
}

/// Re-hash every file the manifest records a digest for and compare;
/// symlink entries are checked against their declared target.
pub fn verify_manifest_files(
    manifest: &PackageManifest,
    tool_root: &Path,
    data_root: &Path,
) -> IntegrityReport {
    let info = manifest.info();
    let mut report = IntegrityReport::default();
    check_entries(&mut report, "tool", &info.tool_files, tool_root, |_| true);
    check_entries(&mut report, "data", &info.data_files, data_root, |e| {
        e.file_type.is_hashed()
    });
    check_links(&mut report, &info.data_files, data_root);
    report
}
