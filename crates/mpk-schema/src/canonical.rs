//! Canonical byte encoding of [`PackageInfo`], the input to signing.
//!
//! Every variable-length value is prefixed with its length and every list
//! with its element count (both `u64` little-endian), so no two distinct
//! manifests share an encoding. Fixed-width integers are little-endian.

use crate::manifest::{FileEntry, PackageInfo, PackageRef};
use crate::types::FileHash;
use crate::version::Version;

/// Leading tag that binds the encoding to this format revision.
pub const CANONICAL_DOMAIN: &[u8] = b"mpk-manifest-v1\0";

struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn count(&mut self, n: usize) {
        self.buf.extend_from_slice(&(n as u64).to_le_bytes());
    }

    fn str(&mut self, s: &str) {
        self.count(s.len());
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn version(&mut self, v: &Version) {
        self.i32(v.major);
        self.i32(v.minor);
        self.i32(v.patch);
        self.u8(v.build_type.tag());
        self.i64(v.build_id.unwrap_or(-1));
    }

    fn hash(&mut self, h: Option<&FileHash>) {
        match h {
            Some(h) => {
                self.u8(1);
                self.buf.extend_from_slice(h.as_bytes());
            }
            None => self.u8(0),
        }
    }

    fn package_refs(&mut self, refs: &[PackageRef]) {
        self.count(refs.len());
        for r in refs {
            self.str(&r.name);
            self.version(&r.version);
            self.u8(r.operator.tag());
        }
    }

    fn tool_files(&mut self, files: &[FileEntry]) {
        self.count(files.len());
        for f in files {
            self.str(&f.relative_path);
            self.hash(f.content_hash.as_ref());
        }
    }

    fn data_files(&mut self, files: &[FileEntry]) {
        self.count(files.len());
        for f in files {
            self.str(&f.relative_path);
            self.u8(f.file_type.tag());
            self.hash(f.content_hash.as_ref());
            if f.file_type == crate::manifest::FileType::Symlink {
                self.str(f.symlink_target.as_deref().unwrap_or_default());
            }
        }
    }
}

/// Encode every signed field of `info` in fixed order.
pub fn canonical_bytes(info: &PackageInfo) -> Vec<u8> {
    let mut enc = Encoder {
        buf: Vec::with_capacity(1024),
    };
    enc.buf.extend_from_slice(CANONICAL_DOMAIN);
    enc.version(&info.schema_version);
    enc.str(&info.name);
    enc.version(&info.version);
    enc.str(&info.arch);
    enc.count(info.regions.len());
    for region in &info.regions {
        enc.str(region);
    }
    enc.package_refs(&info.depends);
    enc.package_refs(&info.conflicts);
    enc.i32(info.priority);
    enc.str(&info.source);
    enc.str(&info.vendor);
    enc.str(&info.description);
    enc.str(&info.maintainer);
    enc.str(&info.license);
    enc.tool_files(&info.tool_files);
    enc.data_files(&info.data_files);
    enc.buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{FileType, PackageInfo};
    use crate::version::Operator;

    fn base() -> PackageInfo {
        PackageInfo {
            name: "testpkg".to_owned(),
            version: Version::new(1, 2, 0),
            data_files: vec![FileEntry::new("bin/app", FileType::Executable)],
            ..PackageInfo::default()
        }
    }

    #[test]
    fn deterministic() {
        assert_eq!(canonical_bytes(&base()), canonical_bytes(&base()));
    }

    #[test]
    fn starts_with_domain_tag() {
        assert!(canonical_bytes(&base()).starts_with(CANONICAL_DOMAIN));
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let mut a = base();
        a.source = "ab".to_owned();
        a.vendor = "c".to_owned();
        let mut b = base();
        b.source = "a".to_owned();
        b.vendor = "bc".to_owned();
        assert_ne!(canonical_bytes(&a), canonical_bytes(&b));
    }

    #[test]
    fn regions_are_covered() {
        let mut a = base();
        a.regions.insert("eu".to_owned());
        assert_ne!(canonical_bytes(&a), canonical_bytes(&base()));
    }

    #[test]
    fn moving_a_ref_between_lists_changes_encoding() {
        let r = PackageRef::new("x", Operator::Equal, Version::new(1, 0, 0));
        let mut a = base();
        a.depends.push(r.clone());
        let mut b = base();
        b.conflicts.push(r);
        assert_ne!(canonical_bytes(&a), canonical_bytes(&b));
    }

    #[test]
    fn file_type_and_target_are_covered() {
        let mut a = base();
        a.data_files[0].file_type = FileType::Regular;
        assert_ne!(canonical_bytes(&a), canonical_bytes(&base()));

        let mut l1 = base();
        l1.data_files.push(FileEntry::symlink("lib/x.so", "x.so.1"));
        let mut l2 = base();
        l2.data_files.push(FileEntry::symlink("lib/x.so", "x.so.2"));
        assert_ne!(canonical_bytes(&l1), canonical_bytes(&l2));
    }

    #[test]
    fn absent_and_zero_hash_differ() {
        let mut a = base();
        a.data_files[0].content_hash = Some(FileHash::new([0; 32]));
        assert_ne!(canonical_bytes(&a), canonical_bytes(&base()));
    }
}
