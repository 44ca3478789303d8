//! Custos CLI: classify policy rule results offline.
//!
//! Applies a policy's include/exclude configuration and effective time to
//! rule-engine results, running the engine itself when asked to, and
//! derives attestation times.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

/// Custos: policy result classification for signed container images.
///
/// Works offline on rule-engine results and attestation statements that
/// were produced elsewhere.
#[derive(Parser)]
#[command(name = "custos", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (repeat for more detail: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Output logs as JSON (for machine consumption).
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Classify rule results against a policy's configuration.
    Classify(commands::classify::ClassifyArgs),
    /// Print the attestation time of a set of attestation statements.
    AttestationTime(commands::attestation_time::AttestationTimeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Logs go to stderr so --json output stays parseable.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Commands::Classify(args) => commands::classify::execute(args).await,
        Commands::AttestationTime(args) => commands::attestation_time::execute(&args),
    }
}
