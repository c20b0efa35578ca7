#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

mod commands;
mod logging;

use clap::Parser;
use miette::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tracer")]
#[command(author, version, about = "Incremental JS/CSS/JSON dependency tracer", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted output (stable, machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print version information
    Version,

    /// Trace entry points and their transitive dependencies
    Trace {
        /// Entry file(s) to seed the graph with
        entries: Vec<PathBuf>,

        /// Root of the source tree (defaults to the working directory)
        #[arg(long)]
        source_root: Option<PathBuf>,

        /// URL prefix for in-tree files
        #[arg(long, default_value = "/static/")]
        root_url: String,

        /// Directory for the persisted job/resolver caches
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Directory of pre-built vendor assets, excluded from transform
        #[arg(long)]
        vendor_root: Option<PathBuf>,

        /// Bootstrap runtime file, served verbatim without module wrapping
        #[arg(long)]
        bootstrap_runtime: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cwd = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    if matches!(cli.command, Some(Commands::Version) | None) {
        return commands::version::run();
    }

    logging::init(cli.verbose, cli.json);

    match cli.command {
        Some(Commands::Trace {
            entries,
            source_root,
            root_url,
            cache_dir,
            vendor_root,
            bootstrap_runtime,
        }) => {
            let source_root = source_root.unwrap_or_else(|| cwd.clone());
            let cache_dir = cache_dir.unwrap_or_else(|| {
                dirs_next::cache_dir()
                    .unwrap_or_else(std::env::temp_dir)
                    .join("tracer")
            });

            let span = tracing::info_span!("trace", cwd = %cwd.display());
            let _guard = span.enter();

            commands::trace::run(
                commands::trace::TraceAction {
                    entries,
                    source_root,
                    root_url,
                    cache_dir,
                    vendor_root,
                    bootstrap_runtime,
                    verbosity: cli.verbose,
                    json_logs: cli.json,
                },
                cli.json,
            )
        }
        Some(Commands::Version) | None => unreachable!("handled above"),
    }
}
