use super::{json_pretty, EXIT_SUCCESS};
use mpk_core::generate_keypair;
use std::path::Path;

pub fn run(private_out: &Path, public_out: Option<&Path>, json: bool) -> Result<u8, String> {
    let paths = generate_keypair(private_out, public_out).map_err(|e| e.to_string())?;
    if json {
        let payload = serde_json::json!({
            "private_key": paths.private_key,
            "public_key": paths.public_key,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("private key: {}", paths.private_key.display());
        println!("public key:  {}", paths.public_key.display());
    }
    Ok(EXIT_SUCCESS)
}
