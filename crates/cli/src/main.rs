//! Netcheck CLI - Main Entry Point
//!
//! Runs, validates and lists declarative network conformance suites.

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::{list, run, validate};

/// Netcheck - Network Behavior Conformance Tests
#[derive(Parser)]
#[command(name = "netcheck")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Log line format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run suites against a live or simulated lab
    Run(run::RunArgs),

    /// Check suites without touching the lab
    Validate(validate::ValidateArgs),

    /// List the cases in suites
    List(list::ListArgs),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
    }

    let code = match cli.command {
        Commands::Run(args) => run::execute(args, cli.format).await?,
        Commands::Validate(args) => validate::execute(args)?,
        Commands::List(args) => list::execute(args, cli.format)?,
        Commands::Version => {
            println!("Netcheck CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Declarative conformance tests for switched and routed lab networks");
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
