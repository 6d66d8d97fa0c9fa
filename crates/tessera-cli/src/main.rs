//! Tessera CLI - Reactive notebook kernel driven by JSON lines.

mod stdio;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tessera_kernel::KernelConfig;

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Reactive notebook kernel driven by JSON lines")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Kernel configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve one session on stdin/stdout
    Stdio,

    /// Run a file of requests and print every kernel message
    Run {
        /// Path to the requests (.jsonl file)
        requests: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<KernelConfig> {
    let Some(path) = path else {
        return Ok(KernelConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout carries only kernel messages
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Stdio => {
            let input = tokio::io::BufReader::new(tokio::io::stdin());
            stdio::execute(input, config).await?;
        }

        Commands::Run { requests } => {
            let file = tokio::fs::File::open(&requests)
                .await
                .with_context(|| format!("Failed to open {}", requests.display()))?;
            stdio::execute(tokio::io::BufReader::new(file), config).await?;
        }
    }

    Ok(())
}
