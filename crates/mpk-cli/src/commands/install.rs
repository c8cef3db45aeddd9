use super::{colorize_status, json_pretty, with_spinner, EXIT_SUCCESS};
use mpk_core::Engine;
use std::path::Path;

pub fn run(engine: &Engine, package: &Path, prefix: &Path, json: bool) -> Result<u8, String> {
    let result = with_spinner(
        json,
        "installing package...",
        "package installed",
        "install failed, changes rolled back",
        || engine.install(package, prefix),
    )?;
    let package_id = result.manifest.info().package_id();
    let report = &result.report;

    if json {
        let payload = serde_json::json!({
            "package": package_id,
            "package_dir": result.package_dir,
            "prefix": prefix,
            "signature": result.signature.as_str(),
            "links_created": report.links_created,
            "dirs_created": report.dirs_created,
            "already_provided": report.already_provided,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("installed {package_id} into {}", prefix.display());
        println!("signature: {}", colorize_status(result.signature.as_str()));
        println!(
            "links: {} created, {} already provided; dirs: {} created",
            report.links_created,
            report.already_provided.len(),
            report.dirs_created
        );
    }
    Ok(EXIT_SUCCESS)
}
