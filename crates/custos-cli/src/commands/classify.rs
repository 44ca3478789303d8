//! The `custos classify` subcommand.
//!
//! Classifies rule-engine results against a policy: excluded results are
//! dropped and failures that are not yet effective become warnings. The
//! results come from a file, or from running a rule engine over the
//! attestations.

use std::path::{Path, PathBuf};
use std::process;

use chrono::SecondsFormat;
use clap::Args;
use color_eyre::eyre::{Result, WrapErr, eyre};
use custos_verify::attestation::{self, AttestationRecord};
use custos_verify::classify::Classifier;
use custos_verify::context::{ContextOverrides, PolicyContext, PolicySpec};
use custos_verify::evaluator::{CommandEvaluator, Evaluator};
use custos_verify::input::{InputWriter, JsonInputWriter};
use custos_verify::result::{CheckResult, Outcome};
use tokio_util::sync::CancellationToken;

use super::attestation_time::load_attestations;

/// Arguments for `custos classify`.
#[derive(Args)]
pub struct ClassifyArgs {
    /// JSON file holding an array of rule results
    /// (`[{"namespace": …, "successes": […], "warnings": […], "failures": […]}]`).
    #[arg(long, value_name = "PATH", required_unless_present = "engine", conflicts_with = "engine")]
    pub results: Option<PathBuf>,

    /// Rule engine to run over the attestations instead of reading
    /// `--results`. It must print the results array on stdout.
    #[arg(long, value_name = "PROGRAM", requires = "attestations")]
    pub engine: Option<PathBuf>,

    /// Argument for the rule engine, placed before the input path
    /// (repeatable).
    #[arg(long = "engine-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub engine_args: Vec<String>,

    /// Rule file copied into the engine's policy directory (repeatable).
    #[arg(long = "rule", value_name = "PATH")]
    pub rules: Vec<PathBuf>,

    /// Policy: inline JSON, a path to a JSON file, or empty for no policy.
    #[arg(long, value_name = "POLICY", default_value = "")]
    pub policy: String,

    /// Attestation statements whose latest build time becomes the
    /// effective time, unless one is given explicitly.
    #[arg(long, value_name = "PATH")]
    pub attestations: Option<PathBuf>,

    /// Effective time (RFC3339, or `now`).
    #[arg(long, value_name = "TIME")]
    pub effective_time: Option<String>,

    /// Override the policy's public key.
    #[arg(long, value_name = "KEY")]
    pub public_key: Option<String>,

    /// Keep the rule engine's workspace for inspection.
    #[arg(
        long,
        env = "CUSTOS_DEBUG",
        action = clap::ArgAction::SetTrue,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub keep_workspace: bool,

    /// Output results as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Execute the classify command.
pub async fn execute(args: ClassifyArgs) -> Result<()> {
    let spec = PolicySpec::load(&args.policy)?;
    let mut context = PolicyContext::new(
        spec,
        ContextOverrides {
            public_key: args.public_key,
            rekor_url: None,
            effective_time: args.effective_time,
        },
    )?;

    let attestations = match &args.attestations {
        Some(path) => load_attestations(path)?,
        None => Vec::new(),
    };
    if let Some(time) = attestation::resolve_attestation_time(&attestations) {
        context.set_attestation_time(time);
    }

    let checks = if let Some(engine) = args.engine {
        let evaluator = CommandEvaluator::new(engine)
            .args(args.engine_args)
            .rules(args.rules)
            .retain_workspace(args.keep_workspace);
        run_engine(&evaluator, &attestations, &context).await?
    } else {
        let path = args
            .results
            .ok_or_else(|| eyre!("either --results or --engine is required"))?;
        read_results(&path)?
    };

    let classified = Classifier::new(&context).classify(checks)?;
    let failed = classified.iter().any(|c| !c.failures.is_empty());
    let effective_time = context
        .effective_time()
        .to_rfc3339_opts(SecondsFormat::Secs, true);

    if args.json {
        let json_report = serde_json::json!({
            "passed": !failed,
            "effectiveTime": effective_time,
            "results": classified,
        });
        println!("{}", serde_json::to_string_pretty(&json_report)?);
    } else {
        println!("Effective time: {effective_time}");
        for check in &classified {
            for entry in check.classified() {
                let label = match entry.outcome {
                    Outcome::Success => "PASS",
                    Outcome::Warning => "WARN",
                    Outcome::Failure => "FAIL",
                };
                println!("[{label}] {}", entry.result.message);
            }
        }

        println!();
        if failed {
            println!("Policy check FAILED");
        } else {
            println!("Policy check PASSED");
        }
    }

    if failed {
        process::exit(1);
    }

    Ok(())
}

async fn run_engine(
    evaluator: &CommandEvaluator,
    attestations: &[AttestationRecord],
    context: &PolicyContext,
) -> Result<Vec<CheckResult>> {
    let staged = JsonInputWriter::new().write_input(attestations)?;
    let outcome = evaluator
        .evaluate(&[staged.path().to_path_buf()], context, &CancellationToken::new())
        .await;
    evaluator.release();
    staged.release();
    outcome.wrap_err_with(|| format!("rule engine {} failed", evaluator.name()))
}

fn read_results(path: &Path) -> Result<Vec<CheckResult>> {
    let data = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&data)
        .wrap_err_with(|| format!("{} is not a JSON array of rule results", path.display()))
}
