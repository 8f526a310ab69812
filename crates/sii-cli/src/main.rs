//! # sii CLI entry point
//!
//! Parses command-line arguments, sets up logging and dispatches to the
//! subcommand handlers.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use sii_cli::caf::{run_caf, CafArgs};
use sii_cli::cert::{run_cert, CertArgs};
use sii_cli::remote::{run_query, run_status, run_submit, QueryArgs, StatusArgs, SubmitArgs};
use sii_cli::sign::{run_sign, run_verify, SignArgs, VerifyArgs};

/// SII electronic document client.
///
/// Signs documents, manages folio authorizations and talks to the
/// authority's web services.
#[derive(Parser, Debug)]
#[command(name = "sii", version, about, long_about = None)]
struct Cli {
    /// Enable verbose output. Repeat for more verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log line format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// YAML configuration file. `SII_*` environment variables are used when absent.
    #[arg(long, global = true, env = "SII_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Signing certificate operations.
    Cert(CertArgs),

    /// Sign an XML document.
    Sign(SignArgs),

    /// Verify the signature of an XML document.
    Verify(VerifyArgs),

    /// Folio authorization management (import, list, availability).
    Caf(CafArgs),

    /// Upload documents to the authority.
    Submit(SubmitArgs),

    /// Status of a previous upload.
    Status(StatusArgs),

    /// Status of one issued document.
    Query(QueryArgs),
}

fn init_tracing(verbose: u8, format: LogFormat) {
    // RUST_LOG wins over -v when set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn dispatch(cli: &Cli) -> anyhow::Result<u8> {
    if let Commands::Verify(args) = &cli.command {
        return run_verify(args);
    }
    let config = sii_cli::load_config(cli.config.as_deref())?;
    match &cli.command {
        Commands::Cert(args) => run_cert(args, &config),
        Commands::Sign(args) => run_sign(args, &config),
        Commands::Verify(args) => run_verify(args),
        Commands::Caf(args) => run_caf(args, &config).await,
        Commands::Submit(args) => run_submit(args, config).await,
        Commands::Status(args) => run_status(args, config).await,
        Commands::Query(args) => run_query(args, config).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "sii CLI starting");

    let result = dispatch(&cli).await;

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(1)
        }
    }
}
