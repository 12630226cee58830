//! Stagehand CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;

/// Exit code for invalid pipelines, bad configuration, and setup failures.
const EXIT_CONFIG_ERROR: u8 = 2;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Run CI pipelines locally in containers", version, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline
    Run(commands::run::RunArgs),
    /// Validate a pipeline configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "stagehand.kdl")]
        path: PathBuf,
    },
    /// Show the stages and jobs a run would execute
    Plan {
        /// Path to the configuration file
        #[arg(default_value = "stagehand.kdl")]
        path: PathBuf,
        /// Only show jobs that run on this branch
        #[arg(long, env = "STAGEHAND_BRANCH")]
        branch: Option<String>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let outcome = match cli.command {
        Commands::Run(args) => commands::run::run(args).await,
        Commands::Validate { path } => commands::validate(&path),
        Commands::Plan { path, branch } => commands::plan(&path, branch.as_deref()),
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}
