use super::{json_pretty, with_spinner, EXIT_SUCCESS};
use console::Style;
use mpk_core::Engine;
use std::path::Path;

pub fn run(
    engine: &Engine,
    src_dir: &Path,
    out_dir: &Path,
    key: Option<&Path>,
    json: bool,
) -> Result<u8, String> {
    let result = with_spinner(
        json,
        "creating package...",
        "package created",
        "create failed",
        || engine.create(src_dir, out_dir, key),
    )?;
    let info = result.manifest.info();

    if json {
        let payload = serde_json::json!({
            "package": info.package_id(),
            "archive": result.archive,
            "hashed": result.hashed,
            "signed": result.manifest.is_signed(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("created {}", result.archive.display());
        println!("files hashed: {}", result.hashed);
        if !result.manifest.is_signed() {
            println!(
                "{}",
                Style::new()
                    .yellow()
                    .apply_to("warning: package is unsigned (no signing key)")
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
