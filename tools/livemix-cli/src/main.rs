//! livemix CLI: composite live sources and publish them.
//!
//! Usage:
//!   livemix --rtmp-link <URI> [OPTIONS]   Broadcast until Ctrl+C
//!   livemix stages                        List the available stage kinds

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use livemix_common::config::AppConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "livemix",
    about = "Composite live video sources into one canvas and publish it",
    version,
    author,
    args_conflicts_with_subcommands = true
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Configuration file (defaults to $XDG_CONFIG_HOME/livemix/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    broadcast: BroadcastArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct BroadcastArgs {
    /// Publish destination (rtmp://host[:port]/app/key, tcp://host:port, file:///path)
    #[arg(short = 'r', long)]
    pub rtmp_link: Option<String>,

    /// Number of capture sources
    #[arg(long)]
    pub sources: Option<usize>,

    /// Encoder bitrate in kbit/s
    #[arg(long)]
    pub bitrate: Option<u32>,

    /// Maximum distance between keyframes, in frames
    #[arg(long)]
    pub key_int: Option<u32>,

    /// Write the built graph as Graphviz DOT
    #[arg(long)]
    pub dump_graph: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long)]
    pub duration: Option<f64>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the stage kinds this runtime provides, with their ports and options
    Stages,
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig, livemix_common::LivemixError> {
    match path {
        Some(path) => AppConfig::load_from(path),
        None => Ok(AppConfig::load()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(e.exit_code());
        }
    };
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    config.logging.json |= cli.json_logs;
    livemix_common::logging::init_logging(&config.logging);

    let result = match cli.command {
        Some(Commands::Stages) => {
            commands::stages::run();
            Ok(())
        }
        None => commands::broadcast::run(cli.broadcast, config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}
