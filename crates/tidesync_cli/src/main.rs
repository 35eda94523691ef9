//! TideSync CLI
//!
//! Command-line tools for exercising TideSync.
//!
//! # Commands
//!
//! - `demo` - Run a server and clients in-process and sync a table
//! - `backoff` - Print the reconnect delay table

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// TideSync command-line tools.
#[derive(Parser)]
#[command(name = "tidesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync a seeded table between an in-process server and two clients
    Demo {
        /// Rows seeded on the server before the clients connect
        #[arg(short, long, default_value = "250")]
        rows: usize,

        /// Catch-up page size
        #[arg(short, long, default_value = "100")]
        page_size: usize,

        /// Local writes made by the first client
        #[arg(short, long, default_value = "5")]
        writes: usize,
    },

    /// Print the jittered backoff delay for each attempt
    Backoff {
        /// Number of attempts to print
        #[arg(short, long, default_value = "10")]
        attempts: u32,

        /// Base delay in milliseconds
        #[arg(long, default_value = "1000")]
        base_ms: u64,

        /// Delay cap in milliseconds
        #[arg(long, default_value = "30000")]
        cap_ms: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Demo {
            rows,
            page_size,
            writes,
        } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(commands::demo::run(rows, page_size, writes))?;
        }
        Commands::Backoff {
            attempts,
            base_ms,
            cap_ms,
            format,
        } => {
            commands::backoff::run(attempts, base_ms, cap_ms, &format)?;
        }
        Commands::Version => {
            println!("TideSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
