//! RSA-2048 / SHA-512 signatures over the canonical manifest encoding.

use crate::canonical::canonical_bytes;
use crate::manifest::{IdentityError, PackageManifest};
use crate::types::Signature;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature as RsaSignature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use sha2::Sha512;
use std::fs;
use std::path::Path;
use thiserror::Error;

pub use rsa::{RsaPrivateKey, RsaPublicKey};

/// Modulus size accepted for signing and verification.
pub const KEY_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("failed to load key: {0}")]
    KeyLoadFailed(String),
    #[error("failed to write key: {0}")]
    KeyStoreFailed(String),
    #[error("unsupported key size: {0} bits, expected 2048")]
    InvalidKeySize(usize),
    #[error("signing failed: {0}")]
    SignFailed(String),
    #[error("manifest cannot be signed: {0}")]
    Identity(#[from] IdentityError),
}

fn check_size(modulus_bytes: usize) -> Result<(), SignError> {
    let bits = modulus_bytes * 8;
    if bits == KEY_BITS {
        Ok(())
    } else {
        Err(SignError::InvalidKeySize(bits))
    }
}

/// Sign the manifest's canonical encoding. The manifest is not modified.
pub fn sign(manifest: &PackageManifest, key: &RsaPrivateKey) -> Result<Signature, SignError> {
    manifest.info().validate_identity()?;
    check_size(key.size())?;
    let message = canonical_bytes(manifest.info());
    let signing_key = SigningKey::<Sha512>::new(key.clone());
    let sig = signing_key
        .try_sign(&message)
        .map_err(|e| SignError::SignFailed(e.to_string()))?;
    Signature::from_slice(&sig.to_bytes())
        .ok_or_else(|| SignError::SignFailed("unexpected signature length".to_owned()))
}

/// Sign and attach the signature. On error the manifest is left as it was.
pub fn sign_manifest(manifest: &mut PackageManifest, key: &RsaPrivateKey) -> Result<(), SignError> {
    let sig = sign(manifest, key)?;
    manifest.set_signature(sig);
    Ok(())
}

/// Check the manifest's attached signature.
///
/// A missing or non-matching signature yields `Ok(false)`; only unusable
/// key material is an error.
pub fn verify(manifest: &PackageManifest, key: &RsaPublicKey) -> Result<bool, SignError> {
    check_size(key.size())?;
    let Some(stored) = manifest.signature() else {
        return Ok(false);
    };
    let Ok(sig) = RsaSignature::try_from(stored.as_bytes().as_slice()) else {
        return Ok(false);
    };
    let message = canonical_bytes(manifest.info());
    let verifying_key = VerifyingKey::<Sha512>::new(key.clone());
    Ok(verifying_key.verify(&message, &sig).is_ok())
}

/// Parse a PEM private key, PKCS#1 or PKCS#8.
pub fn parse_private_key_pem(pem: &str) -> Result<RsaPrivateKey, SignError> {
    RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(|e| SignError::KeyLoadFailed(e.to_string()))
}

/// Parse a PEM public key, SubjectPublicKeyInfo or PKCS#1.
pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey, SignError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| SignError::KeyLoadFailed(e.to_string()))
}

pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, SignError> {
    let pem = fs::read_to_string(path)
        .map_err(|e| SignError::KeyLoadFailed(format!("{}: {e}", path.display())))?;
    parse_private_key_pem(&pem)
}

pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, SignError> {
    let pem = fs::read_to_string(path)
        .map_err(|e| SignError::KeyLoadFailed(format!("{}: {e}", path.display())))?;
    parse_public_key_pem(&pem)
}

pub fn generate_private_key() -> Result<RsaPrivateKey, SignError> {
    RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)
        .map_err(|e| SignError::SignFailed(format!("key generation: {e}")))
}

/// Write the private key as PKCS#8 PEM with owner-only permissions.
pub fn save_private_key(path: &Path, key: &RsaPrivateKey) -> Result<(), SignError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| SignError::KeyStoreFailed(e.to_string()))?;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| SignError::KeyStoreFailed(format!("{}: {e}", path.display())))?;
    file.write_all(pem.as_bytes())
        .map_err(|e| SignError::KeyStoreFailed(format!("{}: {e}", path.display())))?;
    Ok(())
}

pub fn save_public_key(path: &Path, key: &RsaPublicKey) -> Result<(), SignError> {
    let pem = key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| SignError::KeyStoreFailed(e.to_string()))?;
    fs::write(path, pem).map_err(|e| SignError::KeyStoreFailed(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{FileEntry, FileType, PackageInfo, PackageRef};
    use crate::types::FileHash;
    use crate::version::{Operator, Version};

    const PRIVATE_PEM: &str = include_str!("../tests/fixtures/signing_key.pem");
    const PRIVATE_PKCS1_PEM: &str = include_str!("../tests/fixtures/signing_key.pkcs1.pem");
    const PUBLIC_PEM: &str = include_str!("../tests/fixtures/signing_key.pub.pem");
    const OTHER_PUBLIC_PEM: &str = include_str!("../tests/fixtures/other_key.pub.pem");
    const SHORT_PEM: &str = include_str!("../tests/fixtures/short_key.pem");

    fn sample() -> PackageManifest {
        let mut info = PackageInfo {
            name: "testpkg".to_owned(),
            version: Version::new(1, 2, 0),
            arch: "armv7".to_owned(),
            depends: vec![PackageRef::new(
                "libc",
                Operator::GreaterOrEqual,
                Version::new(2, 30, 0),
            )],
            ..PackageInfo::default()
        };
        let mut app = FileEntry::new("bin/app", FileType::Executable);
        app.content_hash = Some(FileHash::new([0x42; 32]));
        info.data_files.push(app);
        PackageManifest::new(info)
    }

    fn keys() -> (RsaPrivateKey, RsaPublicKey) {
        (
            parse_private_key_pem(PRIVATE_PEM).unwrap(),
            parse_public_key_pem(PUBLIC_PEM).unwrap(),
        )
    }

    fn signed() -> PackageManifest {
        let (sk, _) = keys();
        let mut m = sample();
        sign_manifest(&mut m, &sk).unwrap();
        m
    }

    #[test]
    fn sign_then_verify() {
        let (_, pk) = keys();
        let m = signed();
        assert_eq!(m.signature().map(|s| s.as_bytes().len()), Some(256));
        assert!(verify(&m, &pk).unwrap());
    }

    #[test]
    fn pkcs1_and_pkcs8_load_the_same_key() {
        let a = parse_private_key_pem(PRIVATE_PEM).unwrap();
        let b = parse_private_key_pem(PRIVATE_PKCS1_PEM).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn signing_is_deterministic() {
        let (sk, _) = keys();
        assert_eq!(sign(&sample(), &sk).unwrap(), sign(&sample(), &sk).unwrap());
    }

    #[test]
    fn unsigned_manifest_does_not_verify() {
        let (_, pk) = keys();
        assert!(!verify(&sample(), &pk).unwrap());
    }

    #[test]
    fn wrong_key_does_not_verify() {
        let other = parse_public_key_pem(OTHER_PUBLIC_PEM).unwrap();
        assert!(!verify(&signed(), &other).unwrap());
    }

    #[test]
    fn tampered_fields_do_not_verify() {
        let (_, pk) = keys();
        let original = signed();
        let sig = *original.signature().unwrap();

        let tamper: [fn(&mut PackageInfo); 5] = [
            |i| i.name = "evilpkg".to_owned(),
            |i| i.data_files[0].content_hash = Some(FileHash::new([0x43; 32])),
            |i| i.depends[0].version = Version::new(2, 31, 0),
            |i| {
                i.regions.insert("eu".to_owned());
            },
            |i| i.data_files[0].file_type = FileType::Writable,
        ];
        for f in tamper {
            let mut m = original.clone();
            f(m.info_mut());
            assert!(!m.is_signed());
            m.set_signature(sig);
            assert!(!verify(&m, &pk).unwrap());
        }
    }

    #[test]
    fn corrupted_signature_does_not_verify() {
        let (_, pk) = keys();
        let mut m = signed();
        let mut bytes = *m.signature().unwrap().as_bytes();
        bytes[10] ^= 0xff;
        m.set_signature(Signature::new(bytes));
        assert!(!verify(&m, &pk).unwrap());
    }

    #[test]
    fn short_key_is_rejected() {
        let short = parse_private_key_pem(SHORT_PEM).unwrap();
        assert!(matches!(
            sign(&sample(), &short),
            Err(SignError::InvalidKeySize(1024))
        ));
        let short_pub = RsaPublicKey::from(&short);
        assert!(matches!(
            verify(&signed(), &short_pub),
            Err(SignError::InvalidKeySize(1024))
        ));
    }

    #[test]
    fn failed_sign_leaves_manifest_untouched() {
        let (sk, _) = keys();
        let mut m = sample();
        m.info_mut().name.clear();
        let before = m.clone();
        assert!(matches!(
            sign_manifest(&mut m, &sk),
            Err(SignError::Identity(IdentityError::EmptyName))
        ));
        assert_eq!(m, before);
    }

    #[test]
    fn garbage_pem_fails_to_load() {
        assert!(matches!(
            parse_private_key_pem("not a key"),
            Err(SignError::KeyLoadFailed(_))
        ));
        assert!(matches!(
            load_public_key(Path::new("/nonexistent/key.pem")),
            Err(SignError::KeyLoadFailed(_))
        ));
    }

    #[test]
    fn saved_keys_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let (sk, pk) = keys();
        let priv_path = dir.path().join("key.pem");
        let pub_path = dir.path().join("key.pub.pem");
        save_private_key(&priv_path, &sk).unwrap();
        save_public_key(&pub_path, &pk).unwrap();
        assert_eq!(load_private_key(&priv_path).unwrap(), sk);
        assert_eq!(load_public_key(&pub_path).unwrap(), pk);
        assert!(save_private_key(&priv_path, &sk).is_err());
    }
}
