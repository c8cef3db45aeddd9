//! Version grammar, package manifest model, and manifest signing for mpk.
//!
//! This crate defines the schema layer: the `major.minor.patch[-Xbuildid]`
//! version codec, the in-memory `PackageManifest`, its JSON document form,
//! the canonical byte encoding a signature covers, and RSA-2048/SHA-512
//! signing and verification.

pub mod canonical;
pub mod codec;
pub mod manifest;
pub mod signing;
pub mod types;
pub mod version;

pub use canonical::canonical_bytes;
pub use codec::{
    parse_manifest_str, read_manifest_file, to_manifest_string, write_manifest_file,
    ManifestError, ParseContext,
};
pub use manifest::{
    FileEntry, FileType, IdentityError, PackageInfo, PackageManifest, PackageRef, SCHEMA_VERSION,
};
pub use signing::{
    generate_private_key, load_private_key, load_public_key, save_private_key, save_public_key,
    sign, sign_manifest, verify, RsaPrivateKey, RsaPublicKey, SignError,
};
pub use types::{FileHash, Signature};
pub use version::{parse_operator, BuildType, Operator, Version, VersionError};
