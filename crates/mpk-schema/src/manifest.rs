use crate::types::{FileHash, Signature};
use crate::version::{Operator, Version};
use std::collections::BTreeSet;
use thiserror::Error;

/// Kind of a file listed in a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FileType {
    #[default]
    Regular,
    Executable,
    Writable,
    Symlink,
    Directory,
    Undefined,
}

impl FileType {
    /// Data entries of this type carry a content hash.
    pub fn is_hashed(self) -> bool {
        match self {
            FileType::Regular | FileType::Executable | FileType::Writable => true,
            FileType::Symlink | FileType::Directory | FileType::Undefined => false,
        }
    }

    /// Entries of this type are projected into a prefix as a symlink.
    pub fn is_payload(self) -> bool {
        match self {
            FileType::Regular | FileType::Executable | FileType::Writable | FileType::Symlink => {
                true
            }
            FileType::Directory | FileType::Undefined => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Regular => "regular",
            FileType::Executable => "executable",
            FileType::Writable => "writable",
            FileType::Symlink => "symlink",
            FileType::Directory => "directory",
            FileType::Undefined => "undefined",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "regular" | "file" => Some(FileType::Regular),
            "executable" => Some(FileType::Executable),
            "writable" => Some(FileType::Writable),
            "symlink" => Some(FileType::Symlink),
            "directory" | "dir" => Some(FileType::Directory),
            "undefined" => Some(FileType::Undefined),
            _ => None,
        }
    }

    /// Stable single-byte tag used in canonical encodings.
    pub fn tag(self) -> u8 {
        match self {
            FileType::Undefined => 0,
            FileType::Regular => 1,
            FileType::Executable => 2,
            FileType::Writable => 3,
            FileType::Symlink => 4,
            FileType::Directory => 5,
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileEntry {
    pub relative_path: String,
    pub content_hash: Option<FileHash>,
    pub file_type: FileType,
    pub symlink_target: Option<String>,
}

impl FileEntry {
    pub fn new(relative_path: impl Into<String>, file_type: FileType) -> Self {
        Self {
            relative_path: relative_path.into(),
            content_hash: None,
            file_type,
            symlink_target: None,
        }
    }

    pub fn symlink(relative_path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
            content_hash: None,
            file_type: FileType::Symlink,
            symlink_target: Some(target.into()),
        }
    }
}

/// A named, optionally version-constrained reference to another package.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackageRef {
    pub name: String,
    pub version: Version,
    pub operator: Operator,
}

impl PackageRef {
    pub fn new(name: impl Into<String>, operator: Operator, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            operator,
        }
    }

    /// Whether `candidate` satisfies this constraint. An unconstrained
    /// reference accepts any version.
    pub fn is_satisfied_by(&self, candidate: &Version) -> bool {
        match self.operator {
            Operator::Unknown => true,
            Operator::Equal => self.version.matches_template(candidate),
            Operator::Less => candidate < &self.version,
            Operator::LessOrEqual => candidate <= &self.version,
            Operator::Greater => candidate > &self.version,
            Operator::GreaterOrEqual => candidate >= &self.version,
        }
    }
}

impl std::fmt::Display for PackageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.operator == Operator::Unknown || self.version.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{} {} {}", self.name, self.operator, self.version)
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("package name must not be empty")]
    EmptyName,
    #[error("package version must not be empty")]
    EmptyVersion,
    #[error("package name '{0}' contains characters not allowed in a file name")]
    InvalidName(String),
}

/// Everything a manifest says about a package except its signature.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackageInfo {
    pub schema_version: Version,
    pub name: String,
    pub version: Version,
    pub arch: String,
    pub regions: BTreeSet<String>,
    pub depends: Vec<PackageRef>,
    pub conflicts: Vec<PackageRef>,
    pub priority: i32,
    pub source: String,
    pub vendor: String,
    pub description: String,
    pub maintainer: String,
    pub license: String,
    pub tool_files: Vec<FileEntry>,
    pub data_files: Vec<FileEntry>,
}

impl PackageInfo {
    /// Name and version must be set before a package is signed or archived.
    pub fn validate_identity(&self) -> Result<(), IdentityError> {
        if self.name.is_empty() {
            return Err(IdentityError::EmptyName);
        }
        if self.name.contains('/') || self.name.starts_with('.') {
            return Err(IdentityError::InvalidName(self.name.clone()));
        }
        if self.version.is_empty() {
            return Err(IdentityError::EmptyVersion);
        }
        Ok(())
    }

    /// `<name>-<version>`, the stem of the archive file name.
    pub fn package_id(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

/// Current manifest schema version written by this toolchain.
pub const SCHEMA_VERSION: Version = Version::new(1, 0, 0);

/// Package metadata plus its detached signature.
///
/// Mutable access to the metadata goes through [`info_mut`](Self::info_mut),
/// which drops any signature so a stale one can never be shipped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackageManifest {
    info: PackageInfo,
    signature: Option<Signature>,
}

impl PackageManifest {
    pub fn new(info: PackageInfo) -> Self {
        Self {
            info,
            signature: None,
        }
    }

    pub fn with_signature(info: PackageInfo, signature: Option<Signature>) -> Self {
        Self { info, signature }
    }

    pub fn info(&self) -> &PackageInfo {
        &self.info
    }

    /// Mutable metadata. Clears the signature.
    pub fn info_mut(&mut self) -> &mut PackageInfo {
        self.signature = None;
        &mut self.info
    }

    pub fn into_parts(self) -> (PackageInfo, Option<Signature>) {
        (self.info, self.signature)
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    pub fn set_signature(&mut self, signature: Signature) {
        self.signature = Some(signature);
    }

    pub fn clear_signature(&mut self) {
        self.signature = None;
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn version(&self) -> &Version {
        &self.info.version
    }
}
