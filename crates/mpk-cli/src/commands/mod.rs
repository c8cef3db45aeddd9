pub mod completions;
pub mod create;
pub mod info;
pub mod install;
pub mod keygen;
pub mod man_pages;
pub mod remove;
pub mod unpack;
pub mod verify;

use indicatif::{ProgressBar, ProgressStyle};
use mpk_core::CoreError;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;
pub const EXIT_SIGNATURE_ERROR: u8 = 4;

/// Map an error message to the process exit code by its stage prefix.
pub fn exit_code_for(msg: &str) -> u8 {
    const STORE_PREFIXES: [&str; 4] = [
        "store error:",
        "store lock:",
        "archive error:",
        "install error:",
    ];
    if msg.starts_with("manifest error:") {
        EXIT_MANIFEST_ERROR
    } else if STORE_PREFIXES.iter().any(|p| msg.starts_with(p)) {
        EXIT_STORE_ERROR
    } else if msg.starts_with("signature error:") || msg.starts_with("integrity error:") {
        EXIT_SIGNATURE_ERROR
    } else {
        EXIT_FAILURE
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

fn plain_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Run a pipeline stage behind a spinner unless JSON output is requested.
pub fn with_spinner<T>(
    json: bool,
    running: &str,
    done: &str,
    failed: &str,
    f: impl FnOnce() -> Result<T, CoreError>,
) -> Result<T, String> {
    let pb = if json { None } else { Some(spinner(running)) };
    match f() {
        Ok(value) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, done);
            }
            Ok(value)
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, failed);
            }
            Err(e.to_string())
        }
    }
}

pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "valid" | "ok" => Style::new().green().apply_to(status).to_string(),
        "invalid" | "FAIL" => Style::new().red().bold().apply_to(status).to_string(),
        "unsigned" => Style::new().yellow().apply_to(status).to_string(),
        "not checked" => Style::new().dim().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"package": "testpkg-1.2.0"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"package\""));
        assert!(result.contains("testpkg-1.2.0"));
    }

    #[test]
    fn exit_codes_follow_error_stage() {
        assert_eq!(exit_code_for("manifest error: data[0].hash: bad"), 2);
        assert_eq!(exit_code_for("store error: conflict"), 3);
        assert_eq!(exit_code_for("store lock: busy"), 3);
        assert_eq!(exit_code_for("archive error: corrupt"), 3);
        assert_eq!(exit_code_for("install error: collision"), 3);
        assert_eq!(exit_code_for("signature error: not signed"), 4);
        assert_eq!(exit_code_for("integrity error: 1 file(s) failed"), 4);
        assert_eq!(exit_code_for("something else"), 1);
    }

    #[test]
    fn core_errors_map_to_codes() {
        let e = CoreError::Unsigned("testpkg-1.2.0".to_owned());
        assert_eq!(exit_code_for(&e.to_string()), EXIT_SIGNATURE_ERROR);
        let e = CoreError::Locked("busy".to_owned());
        assert_eq!(exit_code_for(&e.to_string()), EXIT_STORE_ERROR);
        assert_eq!(exit_code_for(&CoreError::Interrupted.to_string()), EXIT_FAILURE);
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            EXIT_SUCCESS,
            EXIT_FAILURE,
            EXIT_MANIFEST_ERROR,
            EXIT_STORE_ERROR,
            EXIT_SIGNATURE_ERROR,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn colorize_status_keeps_text() {
        for s in ["valid", "invalid", "unsigned", "not checked"] {
            assert!(colorize_status(s).contains(s));
        }
        assert_eq!(colorize_status("other"), "other");
    }

    #[test]
    fn spinner_finishes() {
        let pb = spinner("testing...");
        spin_ok(&pb, "done");
        let pb = spinner("testing...");
        spin_fail(&pb, "failed");
    }

    #[test]
    fn with_spinner_passes_errors_through() {
        let err = with_spinner::<()>(true, "x", "y", "z", || Err(CoreError::Interrupted));
        assert_eq!(err.unwrap_err(), "interrupted, changes rolled back");
    }
}
