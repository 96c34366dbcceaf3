//! Evalweave CLI: inspect resolved settings and replay hook events.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use evalweave_core::logging::env_filter;
use evalweave_core::{Environment, SettingsLoader};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Evalweave: evaluation lifecycle hooks for experiment tracking
#[derive(Parser, Debug)]
#[command(name = "evalweave", version, about, long_about = None)]
struct Cli {
    /// Working directory settings are resolved from
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    /// Also write JSON logs under the user data directory
    #[arg(long)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Print the resolved settings for both integrations
    Settings {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Toml)]
        format: OutputFormat,

        /// Show which source supplied each value
        #[arg(long)]
        explain: bool,
    },
    /// Report whether each integration would be enabled for a run
    Check,
    /// Replay a JSON-lines file of hook events against in-memory backends
    Replay {
        /// File with one event object per line
        events: PathBuf,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Toml,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let level = match cli.verbose {
        0 if cli.quiet => Level::ERROR,
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(env_filter(level));

    let (json_layer, _guard) = if cli.log_file {
        let log_dir = directories::ProjectDirs::from("dev", "evalweave", "evalweave")
            .map(|d| d.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("."));
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "evalweave.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_filter(EnvFilter::new("debug"));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let loader = SettingsLoader::new(workspace, Environment::capture());

    commands::handle_command(cli.command, loader).await
}
