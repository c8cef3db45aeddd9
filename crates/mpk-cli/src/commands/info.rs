use super::EXIT_SUCCESS;
use mpk_core::Engine;
use mpk_schema::{to_manifest_string, PackageRef};
use std::path::Path;

fn join_refs(refs: &[PackageRef]) -> String {
    if refs.is_empty() {
        return "(none)".to_owned();
    }
    refs.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn or_none(s: &str) -> &str {
    if s.is_empty() {
        "(none)"
    } else {
        s
    }
}

/// Print a package's manifest. With `--json` the manifest document itself
/// is printed.
pub fn run(engine: &Engine, package: &Path, json: bool) -> Result<u8, String> {
    let manifest = engine.inspect(package).map_err(|e| e.to_string())?;
    if json {
        let doc = to_manifest_string(&manifest).map_err(|e| format!("manifest error: {e}"))?;
        print!("{doc}");
        return Ok(EXIT_SUCCESS);
    }

    let info = manifest.info();
    let regions: Vec<&str> = info.regions.iter().map(String::as_str).collect();
    println!("name:        {}", info.name);
    println!("version:     {}", info.version);
    println!("arch:        {}", or_none(&info.arch));
    println!("regions:     {}", or_none(&regions.join(", ")));
    println!("depends:     {}", join_refs(&info.depends));
    println!("conflicts:   {}", join_refs(&info.conflicts));
    println!("priority:    {}", info.priority);
    println!("vendor:      {}", or_none(&info.vendor));
    println!("maintainer:  {}", or_none(&info.maintainer));
    println!("license:     {}", or_none(&info.license));
    println!("source:      {}", or_none(&info.source));
    println!("description: {}", or_none(&info.description));
    println!("tool files:  {}", info.tool_files.len());
    println!("data files:  {}", info.data_files.len());
    println!(
        "signed:      {}",
        if manifest.is_signed() { "yes" } else { "no" }
    );
    Ok(EXIT_SUCCESS)
}
