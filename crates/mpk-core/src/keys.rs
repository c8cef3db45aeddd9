use crate::CoreError;
use mpk_schema::{generate_private_key, save_private_key, save_public_key, RsaPublicKey};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairPaths {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
}

/// `vendor.pem` → `vendor.pub.pem`; any other name gets `.pub` appended.
pub fn public_key_path(private_key: &Path) -> PathBuf {
    if private_key.extension().is_some_and(|e| e == "pem") {
        private_key.with_extension("pub.pem")
    } else {
        let mut name = private_key.as_os_str().to_owned();
        name.push(".pub");
        PathBuf::from(name)
    }
}

/// Generate a 2048-bit signing key pair. Refuses to overwrite either file.
pub fn generate_keypair(
    private_out: &Path,
    public_out: Option<&Path>,
) -> Result<KeyPairPaths, CoreError> {
    let public_out = public_out.map_or_else(|| public_key_path(private_out), Path::to_path_buf);
    for path in [private_out, public_out.as_path()] {
        if path.exists() {
            return Err(CoreError::Config(format!(
                "refusing to overwrite existing key {}",
                path.display()
            )));
        }
    }

    let key = generate_private_key()?;
    save_private_key(private_out, &key)?;
    save_public_key(&public_out, &RsaPublicKey::from(&key))?;
    info!(
        "generated key pair {} / {}",
        private_out.display(),
        public_out.display()
    );
    Ok(KeyPairPaths {
        private_key: private_out.to_path_buf(),
        public_key: public_out,
    })
}
