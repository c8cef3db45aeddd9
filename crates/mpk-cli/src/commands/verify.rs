use super::{colorize_status, json_pretty, EXIT_SIGNATURE_ERROR, EXIT_SUCCESS};
use mpk_core::Engine;
use std::path::Path;

pub fn run(engine: &Engine, package: &Path, key: Option<&Path>, json: bool) -> Result<u8, String> {
    let report = engine.verify(package, key).map_err(|e| e.to_string())?;
    let package_id = report.manifest.info().package_id();
    let integrity = &report.integrity;

    if json {
        let failed: Vec<_> = integrity
            .failed
            .iter()
            .map(|f| serde_json::json!({ "path": f.path, "reason": f.reason }))
            .collect();
        let payload = serde_json::json!({
            "package": package_id,
            "signature": report.signature.as_str(),
            "checked": integrity.checked,
            "passed": integrity.passed,
            "failed": failed,
            "ok": report.is_ok(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("package:   {package_id}");
        println!("signature: {}", colorize_status(report.signature.as_str()));
        println!(
            "files:     {}/{} passed",
            integrity.passed, integrity.checked
        );
        for f in &integrity.failed {
            println!("  {} {}: {}", colorize_status("FAIL"), f.path, f.reason);
        }
    }

    if report.is_ok() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_SIGNATURE_ERROR)
    }
}
