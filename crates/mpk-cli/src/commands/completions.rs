use super::EXIT_SUCCESS;
use clap::CommandFactory;
use clap_complete::Shell;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Print completions for `shell`, or write them to `output`.
pub fn run<C: CommandFactory>(shell: Shell, output: Option<&Path>) -> Result<u8, String> {
    let mut cmd = C::command();
    let bin = cmd.get_name().to_owned();
    match output {
        Some(path) => {
            let mut file = File::create(path)
                .map_err(|e| format!("failed to create {}: {e}", path.display()))?;
            clap_complete::generate(shell, &mut cmd, bin, &mut file);
            file.flush()
                .map_err(|e| format!("failed to write {}: {e}", path.display()))?;
        }
        None => clap_complete::generate(shell, &mut cmd, bin, &mut std::io::stdout()),
    }
    Ok(EXIT_SUCCESS)
}
