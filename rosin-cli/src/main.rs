//! Rosin CLI: run verification chains from the terminal or serve them over SSE.

mod commands;
mod render;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Rosin: every answer checked by a chain of independent models
#[derive(Parser, Debug)]
#[command(name = "rosin", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (for `.rosin/config.toml`)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a query through a verification chain
    Verify {
        /// The query to verify
        query: String,
        /// Comma-separated chain of provider:model pairs (2-4)
        #[arg(short, long, value_delimiter = ',', conflicts_with = "stages")]
        chain: Vec<String>,
        /// Use the default 2- or 3-stage chain
        #[arg(short, long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(2..=3))]
        stages: u8,
        /// Verifiers challenge earlier stages instead of refining them
        #[arg(long)]
        adversarial: bool,
        /// Print events as JSON lines instead of formatted text
        #[arg(long)]
        json: bool,
    },
    /// Show the complexity tier assigned to a query
    Classify {
        /// The query to classify
        query: String,
    },
    /// Run the SSE gateway
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// List known models and provider credential status
    Models,
    /// Manage provider API keys in the OS keyring
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum KeyAction {
    /// Store an API key (prompted without echo)
    Set {
        /// Provider id (openai, anthropic, gemini, xai)
        provider: String,
    },
    /// Remove a stored API key
    Remove {
        /// Provider id (openai, anthropic, gemini, xai)
        provider: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create default workspace configuration file
    Init,
    /// Show the merged configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        _ => "debug",
    };

    // Human-readable layer for stderr; stdout carries the answer stream
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "rosin", "rosin")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "rosin.log");
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
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace).await
}
