//! Top-level verification orchestrator.
//!
//! The `Pipeline` runs the checks for one image in a fixed order:
//!
//! 1. **Access**: parse, probe, resolve to a digest (hard gate)
//! 2. **Image signature**: recorded, never terminates
//! 3. **Attestation signatures**: hard gate
//! 4. **Attestation syntax**: recorded, invalid statements dropped
//! 5. **Policy**: attestation time, input staging, rule engines,
//!    classification
//!
//! Verification failures end up in the [`Report`]; only input errors,
//! collaborator breakdowns and cancellation surface as `Err`.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::attestation::{self, AttestationRecord, SignatureInfo};
use crate::classify::Classifier;
use crate::context::PolicyContext;
use crate::error::{CollaboratorError, VerificationError};
use crate::evaluator::Evaluator;
use crate::input::InputWriter;
use crate::reference::ImageReference;
use crate::report::{Report, VerificationStatus};
use crate::result::{CheckResult, RawResult};

/// Message of the synthesized failure when no attestation matches the image.
pub const NO_MATCHING_ATTESTATION: &str =
    "No attestations contain a subject that match the given image.";

/// Registry access and signature verification for images.
#[async_trait]
pub trait ImageVerifier: Send + Sync {
    /// Check that the image can be reached.
    async fn probe_accessible(
        &self,
        image: &ImageReference,
        cancel: &CancellationToken,
    ) -> Result<(), CollaboratorError>;

    /// Resolve the image to its manifest digest (`sha256:<hex>`).
    async fn resolve_digest(
        &self,
        image: &ImageReference,
        cancel: &CancellationToken,
    ) -> Result<String, CollaboratorError>;

    /// Verify the image's signatures with the context's key material.
    async fn verify_image_signatures(
        &self,
        image: &ImageReference,
        context: &PolicyContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<SignatureInfo>, CollaboratorError>;

    /// Verify and decode the image's attestations.
    async fn verify_attestations(
        &self,
        image: &ImageReference,
        context: &PolicyContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<AttestationRecord>, CollaboratorError>;
}

/// Verifies images against a policy.
///
/// The pipeline keeps no per-image state; every call to
/// [`validate_image`](Self::validate_image) starts from its own context.
pub struct Pipeline {
    verifier: Box<dyn ImageVerifier>,
    evaluators: Vec<Box<dyn Evaluator>>,
    input_writer: Box<dyn InputWriter>,
}

impl Pipeline {
    /// Assemble a pipeline from its collaborators.
    pub fn new(
        verifier: Box<dyn ImageVerifier>,
        evaluators: Vec<Box<dyn Evaluator>>,
        input_writer: Box<dyn InputWriter>,
    ) -> Self {
        Self {
            verifier,
            evaluators,
            input_writer,
        }
    }

    /// Verify one image.
    ///
    /// Evaluators are released before this returns, on every path. The
    /// staged input belongs to this call alone and is removed when the run
    /// ends.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed reference, a failed digest
    /// resolution, an evaluator breakdown, an empty evaluation, or
    /// cancellation.
    pub async fn validate_image(
        &self,
        url: &str,
        context: PolicyContext,
        cancel: &CancellationToken,
    ) -> Result<Report, VerificationError> {
        debug!(url, "validating image");
        let outcome = self.run(url, context, cancel).await;
        self.release();
        outcome
    }

    fn release(&self) {
        for evaluator in &self.evaluators {
            evaluator.release();
        }
    }

    async fn run(
        &self,
        url: &str,
        mut context: PolicyContext,
        cancel: &CancellationToken,
    ) -> Result<Report, VerificationError> {
        let mut report = Report::new(url);
        let image = ImageReference::parse(url)?;

        match self.verifier.probe_accessible(&image, cancel).await {
            Ok(()) => {
                report.image_accessible_check = Some(VerificationStatus::pass("Image URL is accessible"));
            }
            Err(CollaboratorError::Cancelled) => {
                return Err(VerificationError::Cancelled("image access check"));
            }
            Err(e) => {
                debug!(error = %e, "image is not accessible");
                report.image_accessible_check = Some(VerificationStatus::fail(format!(
                    "Image URL is not accessible: {e}"
                )));
                return Ok(report);
            }
        }

        let digest = self
            .verifier
            .resolve_digest(&image, cancel)
            .await
            .map_err(|e| VerificationError::from_collaborator("digest resolution", e))?;
        let image = image.resolved(&digest)?;
        report.image_url = image.to_string();
        debug!(resolved = %report.image_url, "resolved image");

        let image_signatures: Option<Vec<SignatureInfo>> = match self
            .verifier
            .verify_image_signatures(&image, &context, cancel)
            .await
        {
            Ok(signatures) => {
                report.image_signature_check =
                    Some(VerificationStatus::pass("Image signature check passed"));
                Some(signatures)
            }
            Err(CollaboratorError::Cancelled) => {
                return Err(VerificationError::Cancelled("image signature check"));
            }
            Err(e) => {
                debug!(error = %e, "image signature check failed");
                report.image_signature_check = Some(VerificationStatus::fail(format!(
                    "Image signature check failed: {e}"
                )));
                None
            }
        };

        let attestations = match self
            .verifier
            .verify_attestations(&image, &context, cancel)
            .await
        {
            Ok(attestations) => {
                report.attestation_signature_check =
                    Some(VerificationStatus::pass("Image attestation check passed"));
                attestations
            }
            Err(CollaboratorError::Cancelled) => {
                return Err(VerificationError::Cancelled("attestation signature check"));
            }
            Err(e) => {
                debug!(error = %e, "attestation signature check failed");
                report.attestation_signature_check = Some(VerificationStatus::fail(format!(
                    "Image attestation check failed: {e}"
                )));
                return Ok(report);
            }
        };

        report.signatures = image_signatures.unwrap_or_else(|| {
            attestations
                .iter()
                .flat_map(|a| a.signatures.iter().cloned())
                .collect()
        });

        let (attestations, syntax_errors) = attestation::partition_by_syntax(attestations);
        report.attestation_syntax_check = Some(if syntax_errors.is_empty() {
            VerificationStatus::pass("Attestation syntax check passed")
        } else {
            VerificationStatus::fail(format!(
                "Attestation syntax check failed: {}",
                syntax_errors.join("; ")
            ))
        });

        let digest_hex = image.digest_hex().unwrap_or_default();
        let attestations = attestation::filter_matching(attestations, digest_hex);
        debug!(count = attestations.len(), "attestations matching image digest");

        if let Some(time) = attestation::resolve_attestation_time(&attestations) {
            context.set_attestation_time(time);
        }
        report.effective_time = Some(context.effective_time());

        if attestations.is_empty() {
            report.policy_check = vec![CheckResult {
                failures: vec![RawResult::new(NO_MATCHING_ATTESTATION)],
                ..Default::default()
            }];
            return Ok(report);
        }

        let staged = self.input_writer.write_input(&attestations)?;
        let inputs = [staged.path().to_path_buf()];

        let mut results = Vec::new();
        for evaluator in &self.evaluators {
            debug!(evaluator = evaluator.name(), "running rule evaluation");
            let checks = evaluator
                .evaluate(&inputs, &context, cancel)
                .await
                .map_err(|e| VerificationError::from_collaborator("rule evaluation", e))?;
            results.extend(checks);
        }
        debug!("rule evaluation complete");
        staged.release();

        report.policy_check = Classifier::new(&context).classify(results)?;
        Ok(report)
    }
}
