mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "scriptbox")]
#[command(about = "Run JavaScript in pooled, sandboxed V8 isolates")]
#[command(version)]
pub struct Cli {
    /// TOML configuration file ([policy] and [pool] sections)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Evaluate an inline expression and print its value as JSON
    Eval {
        /// JavaScript source
        code: String,

        #[command(flatten)]
        run: RunArgs,
    },
    /// Run a script file and print its value as JSON
    Run {
        /// Path to the script
        file: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },
    /// Check a script file for syntax errors without running it
    Check {
        /// Path to the script
        file: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

/// Options shared by every command that executes code
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Inject a variable as name=<json>, repeatable
    #[arg(long = "var", value_name = "NAME=JSON")]
    pub vars: Vec<String>,

    /// Timeout in milliseconds
    #[arg(short, long)]
    pub timeout_ms: Option<i64>,

    /// Allow file access through `io`
    #[arg(long)]
    pub allow_io: bool,

    /// Allow HTTP requests through `fetch`
    #[arg(long)]
    pub allow_network: bool,

    /// Heap budget in bytes
    #[arg(long)]
    pub max_heap_bytes: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Eval { code, run } => {
            commands::execute_eval(cli.config.as_deref(), code, &run).await
        }
        Commands::Run { file, run } => {
            commands::execute_run(cli.config.as_deref(), &file, &run).await
        }
        Commands::Check { file } => commands::execute_check(cli.config.as_deref(), &file).await,
        Commands::Config => commands::execute_config(cli.config.as_deref()),
    }
}

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "warn" };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "scriptbox={},scriptbox_sandbox={},scriptbox_cli={}",
                    log_level, log_level, log_level
                ))
            }),
        )
        .init();
}
