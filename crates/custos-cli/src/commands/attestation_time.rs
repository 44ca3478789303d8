//! The `custos attestation-time` subcommand.
//!
//! Prints the latest `buildFinishedOn` among a set of attestation
//! statements, the instant a policy is judged against when no explicit
//! effective time is given.

use std::path::{Path, PathBuf};

use chrono::SecondsFormat;
use clap::Args;
use color_eyre::eyre::{Result, WrapErr, bail};
use custos_verify::attestation::{self, AttestationRecord};

/// Arguments for `custos attestation-time`.
#[derive(Args)]
pub struct AttestationTimeArgs {
    /// JSON file holding an array of in-toto statements.
    pub attestations: PathBuf,
}

/// Read a JSON array of in-toto statements.
pub fn load_attestations(path: &Path) -> Result<Vec<AttestationRecord>> {
    let data = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    let statements: Vec<serde_json::Value> = serde_json::from_str(&data)
        .wrap_err_with(|| format!("{} is not a JSON array of statements", path.display()))?;
    Ok(statements.into_iter().map(AttestationRecord::new).collect())
}

/// Execute the attestation-time command.
pub fn execute(args: &AttestationTimeArgs) -> Result<()> {
    let attestations = load_attestations(&args.attestations)?;
    let Some(time) = attestation::resolve_attestation_time(&attestations) else {
        bail!(
            "no attestation in {} records a build finish time",
            args.attestations.display()
        );
    };
    println!("{}", time.to_rfc3339_opts(SecondsFormat::Secs, true));
    Ok(())
}
