mod commands;

use clap::{Parser, Subcommand};
use commands::{EXIT_FAILURE, EXIT_STORE_ERROR};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "keel",
    version,
    about = "Inspect and repair the persisted state of a Keel engine"
)]
struct Cli {
    /// Path to the engine's state root.
    #[arg(long, default_value = "~/.local/share/keel")]
    root: String,

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
    /// List changes and their status.
    List {
        /// Only show changes that are not ready yet.
        #[arg(long, default_value_t = false)]
        in_progress: bool,
    },
    /// Show a change with its tasks, edges, logs, and error.
    Show {
        /// Change ID.
        change: String,
    },
    /// Mark a change for rollback; it is undone the next time the engine runs.
    Abort {
        /// Change ID.
        change: String,
    },
    /// Remove old ready changes and abort stuck ones, using keel.toml settings.
    Prune,
    /// Verify the state document checksum and graph consistency.
    Verify,
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
            tracing_subscriber::EnvFilter::try_from_env("KEEL_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    let root = expand_tilde(&cli.root);
    let json_output = cli.json;

    let result = match cli.command {
        Commands::List { in_progress } => commands::list::run(&root, in_progress, json_output),
        Commands::Show { change } => commands::show::run(&root, &change, json_output),
        Commands::Abort { change } => commands::abort::run(&root, &change, json_output),
        Commands::Prune => commands::prune::run(&root, json_output),
        Commands::Verify => commands::verify::run(&root, json_output),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("store error:") || msg.starts_with("state lock:") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
