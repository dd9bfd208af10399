//! skinvestigator CLI: train, tune and evaluate skin-lesion classifiers.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Skinvestigator: binary skin-lesion classifier training
#[derive(Parser, Debug)]
#[command(name = "skinvestigator", version, about, long_about = None)]
struct Cli {
    /// Workspace directory; relative paths in the configuration resolve against it
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train the fixed architecture, evaluate it and save both artifacts
    Train {
        /// Apply flips and brightness jitter to training images
        #[arg(long)]
        augment: bool,
        /// Override the configured epoch count
        #[arg(long)]
        epochs: Option<usize>,
        /// Artifact path (defaults to <model_dir>/skinvestigator.safetensors)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run the Hyperband search, train the winner, evaluate and save it
    Tune {
        /// Override the configured epoch budget
        #[arg(long)]
        max_epochs: Option<usize>,
        /// Discard an earlier search under the same project name
        #[arg(long)]
        overwrite: bool,
        /// Artifact path (defaults to <model_dir>/skinvestigator.safetensors)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Evaluate a saved model against the test directory
    Evaluate {
        /// Path to a saved model
        #[arg(short, long)]
        model: PathBuf,
    },
    /// Print the layer table of the fixed architecture or a saved model
    Summary {
        /// Path to a saved model
        #[arg(short, long)]
        model: Option<PathBuf>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write the default configuration to the workspace
    Init,
    /// Print the merged configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "skinvestigator", "skinvestigator")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "skinvestigator.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("Workspace {}: {}", cli.workspace.display(), e))?;

    commands::handle_command(cli.command, &workspace, cli.config.as_deref()).await
}
