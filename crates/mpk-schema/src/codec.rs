//! JSON manifest documents.
//!
//! The document shape is plain serde; conversion into the typed
//! [`PackageManifest`] goes through a [`ParseContext`] that tracks the
//! field being converted so errors can name it.

use crate::manifest::{FileEntry, FileType, PackageInfo, PackageManifest, PackageRef};
use crate::types::{FileHash, Signature};
use crate::version::{parse_operator, Operator, Version, VersionError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path};
use thiserror::Error;

/// Placeholder written for hashes and signatures that are not computed yet.
pub const UNSET_FIELD: &str = "-";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid manifest field '{path}': {reason}")]
    Field { path: String, reason: String },
    #[error("invalid version in manifest field '{path}': {source}")]
    Version {
        path: String,
        #[source]
        source: VersionError,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct ManifestDocument {
    #[serde(default)]
    manifest: String,
    name: String,
    version: String,
    #[serde(default)]
    arch: String,
    #[serde(default)]
    regions: Vec<String>,
    #[serde(default)]
    depends: Vec<RefDocument>,
    #[serde(default)]
    conflicts: Vec<RefDocument>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    source: String,
    #[serde(default)]
    vendor: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    maintainer: String,
    #[serde(default)]
    license: String,
    #[serde(default)]
    tool: Vec<FileDocument>,
    #[serde(default, alias = "files")]
    data: Vec<FileDocument>,
    #[serde(default)]
    signature: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct RefDocument {
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    op: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct FileDocument {
    name: String,
    #[serde(default)]
    hash: String,
    #[serde(default, rename = "type")]
    file_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
}

/// Conversion state for one document: the path of the field currently
/// being converted.
#[derive(Debug, Default)]
pub struct ParseContext {
    path: Vec<String>,
}

impl ParseContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&mut self, segment: impl Into<String>) {
        self.path.push(segment.into());
    }

    fn leave(&mut self) {
        self.path.pop();
    }

    /// Dotted path of the current field, e.g. `data[3].hash`.
    pub fn current_path(&self) -> String {
        let mut out = String::new();
        for seg in &self.path {
            if !out.is_empty() && !seg.starts_with('[') {
                out.push('.');
            }
            out.push_str(seg);
        }
        out
    }

    fn field_error(&self, reason: impl Into<String>) -> ManifestError {
        ManifestError::Field {
            path: self.current_path(),
            reason: reason.into(),
        }
    }

    fn version(&mut self, field: &str, raw: &str) -> Result<Version, ManifestError> {
        self.enter(field);
        let result = if raw.trim().is_empty() {
            Ok(Version::EMPTY)
        } else {
            raw.parse::<Version>().map_err(|source| ManifestError::Version {
                path: self.current_path(),
                source,
            })
        };
        self.leave();
        result
    }

    fn package_ref(&mut self, doc: &RefDocument) -> Result<PackageRef, ManifestError> {
        if doc.name.is_empty() {
            self.enter("name");
            let err = self.field_error("must not be empty");
            self.leave();
            return Err(err);
        }
        let version = self.version("version", &doc.version)?;
        self.enter("op");
        let operator = if doc.op.is_empty() {
            Ok(Operator::Unknown)
        } else {
            parse_operator(&doc.op).map_err(|source| ManifestError::Version {
                path: self.current_path(),
                source,
            })
        };
        self.leave();
        Ok(PackageRef {
            name: doc.name.clone(),
            version,
            operator: operator?,
        })
    }

    fn package_refs(
        &mut self,
        field: &str,
        docs: &[RefDocument],
    ) -> Result<Vec<PackageRef>, ManifestError> {
        let mut out = Vec::with_capacity(docs.len());
        for (i, doc) in docs.iter().enumerate() {
            self.enter(field);
            self.enter(format!("[{i}]"));
            let r = self.package_ref(doc);
            self.leave();
            self.leave();
            out.push(r?);
        }
        Ok(out)
    }

    fn file_entry(&mut self, doc: &FileDocument) -> Result<FileEntry, ManifestError> {
        self.enter("name");
        let checked = check_relative_path(&doc.name).map_err(|reason| self.field_error(reason));
        self.leave();
        checked?;

        self.enter("type");
        let file_type = if doc.file_type.is_empty() {
            Ok(FileType::Regular)
        } else {
            FileType::from_name(&doc.file_type)
                .ok_or_else(|| self.field_error(format!("unknown file type '{}'", doc.file_type)))
        };
        self.leave();
        let file_type = file_type?;

        self.enter("hash");
        let content_hash = if doc.hash.is_empty() || doc.hash == UNSET_FIELD {
            Ok(None)
        } else {
            FileHash::from_hex(&doc.hash)
                .map(Some)
                .ok_or_else(|| self.field_error("expected 64 hex digits or '-'"))
        };
        self.leave();
        let content_hash = content_hash?;

        if file_type == FileType::Symlink && doc.target.as_deref().map_or(true, str::is_empty) {
            self.enter("target");
            let err = self.field_error("symlink entries need a target");
            self.leave();
            return Err(err);
        }

        Ok(FileEntry {
            relative_path: doc.name.clone(),
            content_hash,
            file_type,
            symlink_target: doc.target.clone().filter(|t| !t.is_empty()),
        })
    }

    fn file_entries(
        &mut self,
        field: &str,
        docs: &[FileDocument],
    ) -> Result<Vec<FileEntry>, ManifestError> {
        let mut out = Vec::with_capacity(docs.len());
        for (i, doc) in docs.iter().enumerate() {
            self.enter(field);
            self.enter(format!("[{i}]"));
            let e = self.file_entry(doc);
            self.leave();
            self.leave();
            out.push(e?);
        }
        Ok(out)
    }

    fn manifest(&mut self, doc: &ManifestDocument) -> Result<PackageManifest, ManifestError> {
        let schema_version = self.version("manifest", &doc.manifest)?;
        let version = self.version("version", &doc.version)?;
        let depends = self.package_refs("depends", &doc.depends)?;
        let conflicts = self.package_refs("conflicts", &doc.conflicts)?;
        let tool_files = self.file_entries("tool", &doc.tool)?;
        let data_files = self.file_entries("data", &doc.data)?;

        self.enter("signature");
        let signature = if doc.signature.is_empty() || doc.signature == UNSET_FIELD {
            Ok(None)
        } else {
            Signature::from_hex(&doc.signature)
                .map(Some)
                .ok_or_else(|| self.field_error("expected 512 hex digits or '-'"))
        };
        self.leave();

        let info = PackageInfo {
            schema_version,
            name: doc.name.clone(),
            version,
            arch: doc.arch.clone(),
            regions: doc.regions.iter().cloned().collect(),
            depends,
            conflicts,
            priority: doc.priority,
            source: doc.source.clone(),
            vendor: doc.vendor.clone(),
            description: doc.description.clone(),
            maintainer: doc.maintainer.clone(),
            license: doc.license.clone(),
            tool_files,
            data_files,
        };
        Ok(PackageManifest::with_signature(info, signature?))
    }
}

/// Reject empty, absolute, and parent-escaping file names.
fn check_relative_path(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("must not be empty");
    }
    let path = Path::new(name);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Err("must not contain '..'"),
            Component::RootDir | Component::Prefix(_) => return Err("must be a relative path"),
        }
    }
    Ok(())
}

fn ref_document(r: &PackageRef) -> RefDocument {
    RefDocument {
        name: r.name.clone(),
        version: r.version.to_string(),
        op: r.operator.as_str().to_owned(),
    }
}

fn file_document(f: &FileEntry) -> FileDocument {
    FileDocument {
        name: f.relative_path.clone(),
        hash: f
            .content_hash
            .map_or_else(|| UNSET_FIELD.to_owned(), |h| h.to_hex()),
        file_type: f.file_type.as_str().to_owned(),
        target: f.symlink_target.clone(),
    }
}

fn document(manifest: &PackageManifest) -> ManifestDocument {
    let info = manifest.info();
    ManifestDocument {
        manifest: info.schema_version.to_string(),
        name: info.name.clone(),
        version: info.version.to_string(),
        arch: info.arch.clone(),
        regions: info.regions.iter().cloned().collect(),
        depends: info.depends.iter().map(ref_document).collect(),
        conflicts: info.conflicts.iter().map(ref_document).collect(),
        priority: info.priority,
        source: info.source.clone(),
        vendor: info.vendor.clone(),
        description: info.description.clone(),
        maintainer: info.maintainer.clone(),
        license: info.license.clone(),
        tool: info.tool_files.iter().map(file_document).collect(),
        data: info.data_files.iter().map(file_document).collect(),
        signature: manifest
            .signature()
            .map_or_else(|| UNSET_FIELD.to_owned(), Signature::to_hex),
    }
}

pub fn parse_manifest_str(input: &str) -> Result<PackageManifest, ManifestError> {
    let doc: ManifestDocument = serde_json::from_str(input)?;
    ParseContext::new().manifest(&doc)
}

pub fn read_manifest_file(path: impl AsRef<Path>) -> Result<PackageManifest, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_manifest_str(&content)
}

pub fn to_manifest_string(manifest: &PackageManifest) -> Result<String, ManifestError> {
    let mut out = serde_json::to_string_pretty(&document(manifest))?;
    out.push('\n');
    Ok(out)
}

/// Write a manifest document atomically.
pub fn write_manifest_file(
    path: impl AsRef<Path>,
    manifest: &PackageManifest,
) -> Result<(), ManifestError> {
    let path = path.as_ref();
    let content = to_manifest_string(manifest)?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ManifestError::Io(e.error))?;
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::BuildType;

    const TEMPLATE: &str = r#"{
        "manifest": "1.0",
        "name": "testpkg",
        "version": "1.2.0",
        "arch": "armv7",
        "regions": ["eu", "us", "eu"],
        "depends": [
            {"name": "libc", "version": "2.30", "op": ">="},
            {"name": "zlib"}
        ],
        "conflicts": [{"name": "oldpkg", "version": "1.0", "op": "<"}],
        "priority": 100,
        "source": "https://example.org/testpkg",
        "vendor": "Example",
        "description": "test package",
        "maintainer": "dev@example.org",
        "license": "MIT",
        "tool": [{"name": "postinst.sh", "hash": "-"}],
        "data": [
            {"name": "bin/app", "type": "executable"},
            {"name": "lib", "type": "directory"},
            {"name": "lib/libapp.so", "type": "symlink", "target": "libapp.so.1"}
        ],
        "signature": "-"
    }"#;

    #[test]
    fn parse_template() {
        let m = parse_manifest_str(TEMPLATE).unwrap();
        let info = m.info();
        assert_eq!(info.name, "testpkg");
        assert_eq!(info.version, Version::new(1, 2, 0));
        assert_eq!(info.schema_version, Version::new(1, 0, 0));
        assert_eq!(info.regions.len(), 2);
        assert_eq!(info.depends.len(), 2);
        assert_eq!(info.depends[0].operator, Operator::GreaterOrEqual);
        assert_eq!(info.depends[1].operator, Operator::Unknown);
        assert!(info.depends[1].version.is_empty());
        assert_eq!(info.tool_files[0].file_type, FileType::Regular);
        assert_eq!(info.data_files[0].file_type, FileType::Executable);
        assert_eq!(info.data_files[1].file_type, FileType::Directory);
        assert_eq!(
            info.data_files[2].symlink_target.as_deref(),
            Some("libapp.so.1")
        );
        assert!(info.data_files.iter().all(|f| f.content_hash.is_none()));
        assert!(!m.is_signed());
    }

    #[test]
    fn legacy_files_key_maps_to_data() {
        let m = parse_manifest_str(
            r#"{"name": "a", "version": "1", "files": [{"name": "x", "hash": ""}]}"#,
        )
        .unwrap();
        assert_eq!(m.info().data_files.len(), 1);
    }

    #[test]
    fn round_trip_with_hashes_and_signature() {
        let mut m = parse_manifest_str(TEMPLATE).unwrap();
        m.info_mut().data_files[0].content_hash = Some(FileHash::new([0xcd; 32]));
        m.info_mut().version = Version::new(1, 2, 0).with_build(BuildType::Beta, Some(5));
        m.set_signature(Signature::new([0x11; 256]));
        let text = to_manifest_string(&m).unwrap();
        let back = parse_manifest_str(&text).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn unset_fields_written_as_dash() {
        let m = parse_manifest_str(TEMPLATE).unwrap();
        let text = to_manifest_string(&m).unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["signature"], "-");
        assert_eq!(v["data"][0]["hash"], "-");
        assert_eq!(v["data"][0]["type"], "executable");
    }

    #[test]
    fn bad_hash_names_field() {
        let err = parse_manifest_str(
            r#"{"name": "a", "version": "1", "data": [{"name": "x"}, {"name": "y", "hash": "abc"}]}"#,
        )
        .unwrap_err();
        match err {
            ManifestError::Field { path, .. } => assert_eq!(path, "data[1].hash"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn bad_version_names_field() {
        let err = parse_manifest_str(
            r#"{"name": "a", "version": "1", "depends": [{"name": "b", "version": "1.x"}]}"#,
        )
        .unwrap_err();
        match err {
            ManifestError::Version { path, .. } => assert_eq!(path, "depends[0].version"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn bad_operator_is_rejected() {
        let err = parse_manifest_str(
            r#"{"name": "a", "version": "1", "depends": [{"name": "b", "version": "1", "op": "<>"}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("depends[0].op"));
    }

    #[test]
    fn escaping_paths_are_rejected() {
        for name in ["../etc/passwd", "/etc/passwd", ""] {
            let doc = format!(
                r#"{{"name": "a", "version": "1", "data": [{{"name": "{name}"}}]}}"#
            );
            assert!(parse_manifest_str(&doc).is_err(), "{name}");
        }
    }

    #[test]
    fn symlink_without_target_is_rejected() {
        let err = parse_manifest_str(
            r#"{"name": "a", "version": "1", "data": [{"name": "l", "type": "symlink"}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("data[0].target"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(parse_manifest_str(r#"{"name": "a", "version": "1", "colour": "red"}"#).is_err());
    }

    #[test]
    fn write_and_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let m = parse_manifest_str(TEMPLATE).unwrap();
        write_manifest_file(&path, &m).unwrap();
        assert_eq!(read_manifest_file(&path).unwrap(), m);
    }

    #[test]
    fn write_replaces_file_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        fs::write(&path, "stale").unwrap();
        let m = parse_manifest_str(TEMPLATE).unwrap();
        write_manifest_file(&path, &m).unwrap();

        assert_eq!(read_manifest_file(&path).unwrap(), m);
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("manifest.json")]);
    }

    #[test]
    fn write_into_missing_dir_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent/manifest.json");
        let m = parse_manifest_str(TEMPLATE).unwrap();
        assert!(matches!(
            write_manifest_file(&path, &m),
            Err(ManifestError::Io(_))
        ));
        assert!(!path.exists());
    }
}
