//! Paperloop CLI: run and manage arXiv literature-review instances.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use uuid::Uuid;

/// Paperloop: iterative literature reviews over arXiv
#[derive(Parser, Debug)]
#[command(name = "paperloop", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (holds `.paperloop/config.toml`)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// LLM model to use
    #[arg(short, long, global = true)]
    model: Option<String>,

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
    /// Research a topic and print the final report
    Research {
        /// Research topic
        topic: String,
        /// Maximum research iterations (1-10)
        #[arg(short = 'i', long)]
        max_iterations: Option<u32>,
        /// Seconds to wait for the report
        #[arg(short, long, default_value = "300")]
        timeout: u64,
        /// Print the instance id and exit without waiting
        #[arg(long)]
        nowait: bool,
    },
    /// Show the status of an instance
    Status {
        /// Instance id
        id: Uuid,
    },
    /// Drive an instance to completion and print its report
    Wait {
        /// Instance id
        id: Uuid,
        /// Seconds to wait for the report
        #[arg(short, long, default_value = "300")]
        timeout: u64,
    },
    /// Ask a running instance to stop
    Terminate {
        /// Instance id
        id: Uuid,
    },
    /// List all known instances
    List,
    /// Resume every unfinished instance and wait for them
    Resume {
        /// Seconds to wait for each instance
        #[arg(short, long, default_value = "300")]
        timeout: u64,
    },
    /// Serve the REST gateway
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind (overrides config)
        #[arg(long)]
        host: Option<String>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default config file to `.paperloop/config.toml`
    Init,
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    // Human-readable layer for stderr
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "paperloop", "paperloop")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "paperloop.log");
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

    let ctx = commands::Context {
        workspace,
        model: cli.model,
    };
    commands::handle_command(cli.command, &ctx).await
}
