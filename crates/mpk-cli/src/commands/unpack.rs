use super::{json_pretty, EXIT_SUCCESS};
use mpk_core::Engine;
use std::path::Path;

pub fn run(engine: &Engine, package: &Path, out_dir: &Path, json: bool) -> Result<u8, String> {
    let dir = engine
        .unpack(package, out_dir)
        .map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&serde_json::json!({ "directory": dir }))?);
    } else {
        println!("unpacked into {}", dir.display());
    }
    Ok(EXIT_SUCCESS)
}
