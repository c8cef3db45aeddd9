//! `.mpk` package archives: a bzip2-compressed tar holding `tool/`,
//! `data/` and `manifest.json`.
//!
//! Tar headers are normalized so the same inputs always produce the same
//! bytes:
//! - entries in manifest order, tool files before data files
//! - all timestamps set to 0 (Unix epoch)
//! - all ownership set to 0:0 (root:root)
//! - permissions taken from the source tree

use crate::fsync_dir;
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use mpk_schema::{
    read_manifest_file, to_manifest_string, FileEntry, FileType, ManifestError, PackageManifest,
};
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Seek, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

pub const PACKAGE_EXTENSION: &str = "mpk";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const TOOL_DIR: &str = "tool";
pub const DATA_DIR: &str = "data";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("source file missing: {0}")]
    SourceMissing(PathBuf),
    #[error("failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("manifest not suitable for packing: {0}")]
    InvalidManifest(String),
    #[error("corrupt compressed stream in {path}: {source}")]
    CorruptStream {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to extract {path}: {reason}")]
    ExtractFailed { path: PathBuf, reason: String },
    #[error("destination already exists: {0}")]
    DestinationExists(PathBuf),
    #[error("cannot derive a package directory name from {0}")]
    InvalidArchiveName(PathBuf),
    #[error("archive {0} contains no manifest")]
    MissingManifest(PathBuf),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// `<name>-<version>.mpk`
pub fn package_file_name(manifest: &PackageManifest) -> String {
    format!("{}.{PACKAGE_EXTENSION}", manifest.info().package_id())
}

fn write_err(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::WriteFailed {
        path: path.to_path_buf(),
        source,
    }
}

fn check_packable(manifest: &PackageManifest) -> Result<(), ArchiveError> {
    let info = manifest.info();
    info.validate_identity()
        .map_err(|e| ArchiveError::InvalidManifest(e.to_string()))?;
    let undefined = info
        .tool_files
        .iter()
        .chain(&info.data_files)
        .find(|e| e.file_type == FileType::Undefined);
    if let Some(entry) = undefined {
        return Err(ArchiveError::InvalidManifest(format!(
            "file '{}' has an undefined type",
            entry.relative_path
        )));
    }
    Ok(())
}

/// Every non-directory entry must be present in the source tree.
fn check_sources(entries: &[FileEntry], root: &Path) -> Result<(), ArchiveError> {
    for entry in entries {
        if entry.file_type == FileType::Directory {
            continue;
        }
        let path = root.join(&entry.relative_path);
        if path.symlink_metadata().is_err() {
            return Err(ArchiveError::SourceMissing(path));
        }
    }
    Ok(())
}

fn make_header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(mode);
    header.set_size(size);
    header
}

fn append_entry<W: Write>(
    ar: &mut tar::Builder<W>,
    archive_dir: &str,
    root: &Path,
    entry: &FileEntry,
) -> Result<(), ArchiveError> {
    let full_path = root.join(&entry.relative_path);
    let name = format!("{archive_dir}/{}", entry.relative_path.trim_end_matches('/'));
    debug!("packing {name}");

    match entry.file_type {
        FileType::Directory => {
            let mode = full_path
                .symlink_metadata()
                .map_or(0o755, |m| m.permissions().mode() & 0o7777);
            let mut header = make_header(tar::EntryType::Directory, mode, 0);
            header.set_cksum();
            ar.append_data(&mut header, format!("{name}/"), io::empty())
                .map_err(write_err(&full_path))?;
        }
        FileType::Symlink => {
            let target = entry.symlink_target.as_deref().ok_or_else(|| {
                ArchiveError::InvalidManifest(format!(
                    "symlink '{}' has no target",
                    entry.relative_path
                ))
            })?;
            let on_disk = fs::read_link(&full_path).map_err(|e| match e.kind() {
                ErrorKind::NotFound => ArchiveError::SourceMissing(full_path.clone()),
                _ => ArchiveError::ReadFailed {
                    path: full_path.clone(),
                    source: e,
                },
            })?;
            // The signed target is what ships; the source tree must agree.
            if on_disk != Path::new(target) {
                return Err(ArchiveError::InvalidManifest(format!(
                    "symlink '{}' points to {} but the manifest says {target}",
                    entry.relative_path,
                    on_disk.display()
                )));
            }
            let mut header = make_header(tar::EntryType::Symlink, 0o777, 0);
            header.set_cksum();
            ar.append_link(&mut header, &name, target)
                .map_err(write_err(&full_path))?;
        }
        FileType::Regular | FileType::Executable | FileType::Writable => {
            let file = File::open(&full_path).map_err(|e| match e.kind() {
                ErrorKind::NotFound => ArchiveError::SourceMissing(full_path.clone()),
                _ => ArchiveError::ReadFailed {
                    path: full_path.clone(),
                    source: e,
                },
            })?;
            let meta = file.metadata().map_err(|e| ArchiveError::ReadFailed {
                path: full_path.clone(),
                source: e,
            })?;
            if !meta.is_file() {
                return Err(ArchiveError::InvalidManifest(format!(
                    "'{}' is listed as a file but is not one",
                    entry.relative_path
                )));
            }
            let mut mode = meta.permissions().mode() & 0o7777;
            if entry.file_type == FileType::Executable {
                mode |= 0o111;
            }
            let mut header = make_header(tar::EntryType::Regular, mode, meta.len());
            header.set_cksum();
            ar.append_data(&mut header, &name, file)
                .map_err(write_err(&full_path))?;
        }
        FileType::Undefined => {
            return Err(ArchiveError::InvalidManifest(format!(
                "file '{}' has an undefined type",
                entry.relative_path
            )));
        }
    }
    Ok(())
}

/// Pack `source_root/{tool,data}` plus the manifest into
/// `output_dir/<name>-<version>.mpk`.
///
/// The archive is written to a temporary file in `output_dir` and renamed
/// into place only once complete.
pub fn pack(
    manifest: &PackageManifest,
    source_root: &Path,
    output_dir: &Path,
) -> Result<PathBuf, ArchiveError> {
    check_packable(manifest)?;
    let info = manifest.info();
    let tool_root = source_root.join(TOOL_DIR);
    let data_root = source_root.join(DATA_DIR);
    check_sources(&info.tool_files, &tool_root)?;
    check_sources(&info.data_files, &data_root)?;

    let dest = output_dir.join(package_file_name(manifest));
    let manifest_doc = to_manifest_string(manifest)?;

    fs::create_dir_all(output_dir).map_err(write_err(output_dir))?;
    let tmp = NamedTempFile::new_in(output_dir).map_err(write_err(output_dir))?;
    let encoder = BzEncoder::new(tmp, Compression::best());
    let mut ar = tar::Builder::new(encoder);
    ar.follow_symlinks(false);

    for entry in &info.tool_files {
        append_entry(&mut ar, TOOL_DIR, &tool_root, entry)?;
    }
    for entry in &info.data_files {
        append_entry(&mut ar, DATA_DIR, &data_root, entry)?;
    }

    let mut header = make_header(tar::EntryType::Regular, 0o644, manifest_doc.len() as u64);
    header.set_cksum();
    ar.append_data(&mut header, MANIFEST_FILE, manifest_doc.as_bytes())
        .map_err(write_err(&dest))?;

    let encoder = ar.into_inner().map_err(write_err(&dest))?;
    let tmp = encoder.finish().map_err(write_err(&dest))?;
    tmp.as_file().sync_all().map_err(write_err(&dest))?;
    tmp.persist(&dest).map_err(|e| ArchiveError::WriteFailed {
        path: dest.clone(),
        source: e.error,
    })?;
    fsync_dir(output_dir).map_err(write_err(output_dir))?;

    info!("packed {}", dest.display());
    Ok(dest)
}

fn open_archive(archive_path: &Path) -> Result<File, ArchiveError> {
    File::open(archive_path).map_err(|source| ArchiveError::ReadFailed {
        path: archive_path.to_path_buf(),
        source,
    })
}

/// Decompress the archive into an anonymous temporary file in `dir`.
fn decompress_to_temp(archive_path: &Path, dir: &Path) -> Result<File, ArchiveError> {
    let mut decoder = BzDecoder::new(open_archive(archive_path)?);
    let mut tar_file = tempfile::tempfile_in(dir).map_err(write_err(dir))?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match decoder.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(ArchiveError::CorruptStream {
                    path: archive_path.to_path_buf(),
                    source,
                })
            }
        };
        tar_file.write_all(&buf[..n]).map_err(write_err(dir))?;
    }
    tar_file.rewind().map_err(write_err(dir))?;
    Ok(tar_file)
}

/// Directory name an archive unpacks into: its file name without `.mpk`.
pub fn unpack_dir_name(archive_path: &Path) -> Result<String, ArchiveError> {
    let file_name = archive_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ArchiveError::InvalidArchiveName(archive_path.to_path_buf()))?;
    let stem = file_name
        .strip_suffix(&format!(".{PACKAGE_EXTENSION}"))
        .unwrap_or(file_name);
    if stem.is_empty() || stem.starts_with('.') {
        return Err(ArchiveError::InvalidArchiveName(
            archive_path.to_path_buf(),
        ));
    }
    Ok(stem.to_owned())
}

/// Unpack an archive into a fresh `output_dir/<archive stem>` directory.
///
/// The destination must not exist. Extraction happens in a hidden staging
/// directory next to it which is renamed into place on success; the
/// temporary tar and the staging directory are removed on every path.
pub fn unpack(archive_path: &Path, output_dir: &Path) -> Result<PathBuf, ArchiveError> {
    let dest = output_dir.join(unpack_dir_name(archive_path)?);
    if dest.symlink_metadata().is_ok() {
        return Err(ArchiveError::DestinationExists(dest));
    }
    fs::create_dir_all(output_dir).map_err(write_err(output_dir))?;

    let tar_file = decompress_to_temp(archive_path, output_dir)?;
    let staging = tempfile::Builder::new()
        .prefix(".unpack-")
        .tempdir_in(output_dir)
        .map_err(write_err(output_dir))?;

    let mut ar = tar::Archive::new(tar_file);
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(false);
    ar.set_unpack_xattrs(false);
    ar.unpack(staging.path())
        .map_err(|e| ArchiveError::ExtractFailed {
            path: archive_path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if !staging.path().join(MANIFEST_FILE).is_file() {
        return Err(ArchiveError::MissingManifest(archive_path.to_path_buf()));
    }

    if dest.symlink_metadata().is_ok() {
        return Err(ArchiveError::DestinationExists(dest));
    }
    fs::rename(staging.path(), &dest).map_err(write_err(&dest))?;
    fsync_dir(output_dir).map_err(write_err(output_dir))?;

    info!("unpacked {} to {}", archive_path.display(), dest.display());
    Ok(dest)
}

/// Read `manifest.json` from an unpacked package directory.
pub fn read_unpacked_manifest(dir: &Path) -> Result<PackageManifest, ArchiveError> {
    let path = dir.join(MANIFEST_FILE);
    if !path.is_file() {
        return Err(ArchiveError::MissingManifest(dir.to_path_buf()));
    }
    Ok(read_manifest_file(&path)?)
}

/// Read the manifest straight out of an archive without extracting it.
pub fn read_archive_manifest(archive_path: &Path) -> Result<PackageManifest, ArchiveError> {
    let corrupt = |source: io::Error| ArchiveError::CorruptStream {
        path: archive_path.to_path_buf(),
        source,
    };
    let decoder = BzDecoder::new(open_archive(archive_path)?);
    let mut ar = tar::Archive::new(decoder);
    for entry in ar.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let is_manifest = entry
            .path()
            .map_err(corrupt)?
            .as_os_str()
            .eq(MANIFEST_FILE);
        if is_manifest {
            let mut content = String::new();
            entry.read_to_string(&mut content).map_err(corrupt)?;
            return Ok(mpk_schema::parse_manifest_str(&content)?);
        }
    }
    Err(ArchiveError::MissingManifest(archive_path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpk_schema::{PackageInfo, Version};
    use std::os::unix::fs::symlink;

    fn manifest() -> PackageManifest {
        PackageManifest::new(PackageInfo {
            name: "testpkg".to_owned(),
            version: Version::new(1, 2, 0),
            tool_files: vec![FileEntry::new("postinst.sh", FileType::Executable)],
            data_files: vec![
                FileEntry::new("bin/app", FileType::Executable),
                FileEntry::new("etc", FileType::Directory),
                FileEntry::new("etc/app.conf", FileType::Writable),
                FileEntry::symlink("lib/libapp.so", "libapp.so.1"),
                FileEntry::new("lib/libapp.so.1", FileType::Regular),
            ],
            ..PackageInfo::default()
        })
    }

    fn source_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("tool")).unwrap();
        fs::create_dir_all(root.join("data/bin")).unwrap();
        fs::create_dir_all(root.join("data/etc")).unwrap();
        fs::create_dir_all(root.join("data/lib")).unwrap();
        fs::write(root.join("tool/postinst.sh"), "#!/bin/sh\necho ok\n").unwrap();
        fs::write(root.join("data/bin/app"), [0u8, 1, 2, 255]).unwrap();
        fs::write(root.join("data/etc/app.conf"), "key = value\n").unwrap();
        fs::write(root.join("data/lib/libapp.so.1"), "elf").unwrap();
        symlink("libapp.so.1", root.join("data/lib/libapp.so")).unwrap();
        dir
    }

    #[test]
    fn pack_names_archive_after_package() {
        let src = source_tree();
        let out = tempfile::tempdir().unwrap();
        let path = pack(&manifest(), src.path(), out.path()).unwrap();
        assert_eq!(path, out.path().join("testpkg-1.2.0.mpk"));
        assert!(path.is_file());
    }

    #[test]
    fn symlink_disagreeing_with_manifest_is_not_packed() {
        let src = source_tree();
        let out = tempfile::tempdir().unwrap();
        let link = src.path().join("data/lib/libapp.so");
        fs::remove_file(&link).unwrap();
        symlink("libreal.so.2", &link).unwrap();

        let err = pack(&manifest(), src.path(), out.path()).unwrap_err();
        assert!(
            matches!(&err, ArchiveError::InvalidManifest(msg) if msg.contains("libreal.so.2")),
            "unexpected error: {err}"
        );
        assert!(!out.path().join("testpkg-1.2.0.mpk").exists());
    }

    #[test]
    fn packed_symlink_matches_manifest_target() {
        let src = source_tree();
        let out = tempfile::tempdir().unwrap();
        let m = manifest();
        let archive = pack(&m, src.path(), out.path()).unwrap();
        let dest = unpack(&archive, out.path()).unwrap();

        let report = crate::integrity::verify_manifest_files(
            &m,
            &dest.join(TOOL_DIR),
            &dest.join(DATA_DIR),
        );
        assert!(
            report.failed.iter().all(|f| f.path != "data/lib/libapp.so"),
            "{:?}",
            report.failed
        );
    }

    #[test]
    fn pack_is_reproducible() {
        let src = source_tree();
        let out1 = tempfile::tempdir().unwrap();
        let out2 = tempfile::tempdir().unwrap();
        let a = pack(&manifest(), src.path(), out1.path()).unwrap();
        let b = pack(&manifest(), src.path(), out2.path()).unwrap();
        assert_eq!(a.file_name(), b.file_name());
        assert_eq!(fs::read(a).unwrap(), fs::read(b).unwrap());
    }

    #[test]
    fn round_trip_preserves_contents() {
        let src = source_tree();
        let out = tempfile::tempdir().unwrap();
        let m = manifest();
        let archive = pack(&m, src.path(), out.path()).unwrap();

        let dest = unpack(&archive, out.path()).unwrap();
        assert_eq!(dest, out.path().join("testpkg-1.2.0"));
        for rel in [
            "tool/postinst.sh",
            "data/bin/app",
            "data/etc/app.conf",
            "data/lib/libapp.so.1",
        ] {
            assert_eq!(
                fs::read(dest.join(rel)).unwrap(),
                fs::read(src.path().join(rel)).unwrap(),
                "{rel}"
            );
        }
        assert!(dest.join("data/etc").is_dir());
        assert_eq!(
            fs::read_link(dest.join("data/lib/libapp.so")).unwrap(),
            PathBuf::from("libapp.so.1")
        );
        let mode = fs::metadata(dest.join("data/bin/app"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111);
        assert_eq!(read_unpacked_manifest(&dest).unwrap(), m);
    }

    #[test]
    fn unpack_leaves_no_staging_behind() {
        let src = source_tree();
        let out = tempfile::tempdir().unwrap();
        let archive = pack(&manifest(), src.path(), out.path()).unwrap();
        let target = tempfile::tempdir().unwrap();
        unpack(&archive, target.path()).unwrap();
        let names: Vec<_> = fs::read_dir(target.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["testpkg-1.2.0".to_owned()]);
    }

    #[test]
    fn missing_source_fails_without_output() {
        let src = source_tree();
        fs::remove_file(src.path().join("data/etc/app.conf")).unwrap();
        let out = tempfile::tempdir().unwrap();
        let err = pack(&manifest(), src.path(), out.path()).unwrap_err();
        assert!(matches!(err, ArchiveError::SourceMissing(_)));
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn pack_rejects_unidentified_manifest() {
        let src = source_tree();
        let out = tempfile::tempdir().unwrap();
        let mut m = manifest();
        m.info_mut().version = Version::EMPTY;
        assert!(matches!(
            pack(&m, src.path(), out.path()),
            Err(ArchiveError::InvalidManifest(_))
        ));
    }

    #[test]
    fn pack_rejects_undefined_entries() {
        let src = source_tree();
        let out = tempfile::tempdir().unwrap();
        let mut m = manifest();
        m.info_mut().data_files[0].file_type = FileType::Undefined;
        assert!(matches!(
            pack(&m, src.path(), out.path()),
            Err(ArchiveError::InvalidManifest(_))
        ));
    }

    #[test]
    fn unpack_refuses_existing_destination() {
        let src = source_tree();
        let out = tempfile::tempdir().unwrap();
        let archive = pack(&manifest(), src.path(), out.path()).unwrap();
        fs::create_dir(out.path().join("testpkg-1.2.0")).unwrap();
        assert!(matches!(
            unpack(&archive, out.path()),
            Err(ArchiveError::DestinationExists(_))
        ));
    }

    #[test]
    fn unpack_reports_corrupt_stream() {
        let out = tempfile::tempdir().unwrap();
        let bogus = out.path().join("broken-1.0.0.mpk");
        fs::write(&bogus, b"definitely not bzip2 data").unwrap();
        let target = tempfile::tempdir().unwrap();
        assert!(matches!(
            unpack(&bogus, target.path()),
            Err(ArchiveError::CorruptStream { .. })
        ));
        assert_eq!(fs::read_dir(target.path()).unwrap().count(), 0);
    }

    #[test]
    fn unpack_requires_manifest() {
        let out = tempfile::tempdir().unwrap();
        let path = out.path().join("empty-1.0.0.mpk");
        let file = File::create(&path).unwrap();
        let mut ar = tar::Builder::new(BzEncoder::new(file, Compression::best()));
        let mut header = make_header(tar::EntryType::Regular, 0o644, 2);
        header.set_cksum();
        ar.append_data(&mut header, "data/x", &b"hi"[..]).unwrap();
        ar.into_inner().unwrap().finish().unwrap();

        let target = tempfile::tempdir().unwrap();
        assert!(matches!(
            unpack(&path, target.path()),
            Err(ArchiveError::MissingManifest(_))
        ));
        assert_eq!(fs::read_dir(target.path()).unwrap().count(), 0);
    }

    #[test]
    fn manifest_readable_without_extraction() {
        let src = source_tree();
        let out = tempfile::tempdir().unwrap();
        let archive = pack(&manifest(), src.path(), out.path()).unwrap();
        let m = read_archive_manifest(&archive).unwrap();
        assert_eq!(m, manifest());
    }

    #[test]
    fn unpack_dir_name_strips_extension() {
        assert_eq!(
            unpack_dir_name(Path::new("/tmp/testpkg-1.2.0.mpk")).unwrap(),
            "testpkg-1.2.0"
        );
        assert_eq!(unpack_dir_name(Path::new("pkg.tar")).unwrap(), "pkg.tar");
        assert!(unpack_dir_name(Path::new("/")).is_err());
    }
}
