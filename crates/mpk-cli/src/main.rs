mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::exit_code_for;
use mpk_core::{install_signal_handler, Config, Engine};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "mpm",
    version,
    about = "Build, sign, verify and install mpk packages"
)]
struct Cli {
    /// Configuration file (default: $MPK_CONFIG, then /etc/mpk/mpk.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Package store directory; overrides the configuration file.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Hash, sign and archive a package source tree.
    Create {
        /// Directory holding manifest-tmpl.json, tool/ and data/.
        srcdir: PathBuf,
        /// Private key to sign with (default: private_key from config).
        #[arg(short, long)]
        key: Option<PathBuf>,
        /// Directory the .mpk file is written to.
        #[arg(short, long, default_value = ".")]
        outdir: PathBuf,
    },
    /// Unpack a package into the store and link it into a prefix.
    Install {
        /// Path to the .mpk file.
        package: PathBuf,
        /// Root of the tree to install into (default: default_prefix from config).
        #[arg(short, long)]
        prefix: Option<PathBuf>,
    },
    /// Extract a package into <outdir>/<name>-<version>.
    Unpack {
        /// Path to the .mpk file.
        package: PathBuf,
        /// Directory to extract into.
        #[arg(short, long, default_value = ".")]
        outdir: PathBuf,
    },
    /// Remove a package's links from a prefix.
    Remove {
        /// Package name.
        name: String,
        /// Root of the tree to remove from (default: default_prefix from config).
        #[arg(short, long)]
        prefix: Option<PathBuf>,
        /// Also delete the package from the store.
        #[arg(long, default_value_t = false)]
        purge: bool,
    },
    /// Check a package's signature and file digests.
    Verify {
        /// Path to the .mpk file.
        package: PathBuf,
        /// Public key to verify with (default: public_key from config).
        #[arg(short, long)]
        key: Option<PathBuf>,
    },
    /// Show the manifest of a package.
    Info {
        /// Path to the .mpk file.
        package: PathBuf,
    },
    /// Generate an RSA-2048 signing key pair.
    Keygen {
        /// Output path of the private key.
        out: PathBuf,
        /// Output path of the public key (default: <out>.pub.pem).
        #[arg(long)]
        public: Option<PathBuf>,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
        /// Write to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

fn load_config(path: Option<&Path>, store: Option<PathBuf>) -> Result<Config, String> {
    let mut config = match path {
        Some(p) => Config::load(p),
        None => Config::load_default(),
    }
    .map_err(|e| e.to_string())?;
    if let Some(store) = store {
        config.store_root = store;
    }
    Ok(config)
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("MPK_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    let json = cli.json;
    let result = match cli.command {
        Commands::Completions { shell, output } => {
            commands::completions::run::<Cli>(shell, output.as_deref())
        }
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(&dir),
        Commands::Keygen { out, public } => {
            commands::keygen::run(&out, public.as_deref(), json)
        }
        command => match load_config(cli.config.as_deref(), cli.store) {
            Ok(config) => run_package_command(command, config, json),
            Err(msg) => Err(msg),
        },
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

fn run_package_command(command: Commands, config: Config, json: bool) -> Result<u8, String> {
    let default_prefix = config.default_prefix.clone();
    let engine = Engine::new(config);
    match command {
        Commands::Create {
            srcdir,
            key,
            outdir,
        } => commands::create::run(&engine, &srcdir, &outdir, key.as_deref(), json),
        Commands::Install { package, prefix } => commands::install::run(
            &engine,
            &package,
            prefix.as_deref().unwrap_or(&default_prefix),
            json,
        ),
        Commands::Unpack { package, outdir } => {
            commands::unpack::run(&engine, &package, &outdir, json)
        }
        Commands::Remove {
            name,
            prefix,
            purge,
        } => commands::remove::run(
            &engine,
            &name,
            prefix.as_deref().unwrap_or(&default_prefix),
            purge,
            json,
        ),
        Commands::Verify { package, key } => {
            commands::verify::run(&engine, &package, key.as_deref(), json)
        }
        Commands::Info { package } => commands::info::run(&engine, &package, json),
        Commands::Completions { .. } | Commands::ManPages { .. } | Commands::Keygen { .. } => {
            Err("command does not operate on packages".to_owned())
        }
    }
}
