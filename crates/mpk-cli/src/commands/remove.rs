use super::{json_pretty, EXIT_SUCCESS};
use mpk_core::Engine;
use std::path::Path;

pub fn run(
    engine: &Engine,
    name: &str,
    prefix: &Path,
    purge: bool,
    json: bool,
) -> Result<u8, String> {
    let result = engine
        .remove(name, prefix, purge)
        .map_err(|e| e.to_string())?;

    if json {
        let payload = serde_json::json!({
            "package": name,
            "links_removed": result.links_removed,
            "identity_removed": result.identity_removed,
            "purged": result.purged,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "removed {name} from {}: {} links",
            prefix.display(),
            result.links_removed
        );
        if let Some(dir) = &result.purged {
            println!("purged {}", dir.display());
        }
    }
    Ok(EXIT_SUCCESS)
}
