//! The outcome of verifying one image.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::attestation::SignatureInfo;
use crate::result::{CheckResult, RawResult};

/// Pass/fail of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationStatus {
    /// Whether the stage passed.
    pub passed: bool,
    /// Message describing the outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<RawResult>,
}

impl VerificationStatus {
    /// A passing status with a message.
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            result: Some(RawResult::new(message)),
        }
    }

    /// A failing status with a message.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            result: Some(RawResult::new(message)),
        }
    }

    /// The message of a failed status.
    fn violation(&self) -> Option<&RawResult> {
        if self.passed {
            None
        } else {
            self.result.as_ref()
        }
    }
}

/// Everything known about one image after the pipeline ran.
///
/// Stages that never ran are `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    /// Image reference; canonical digest form once resolution succeeded.
    pub image_url: String,
    /// Reachability of the image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_accessible_check: Option<VerificationStatus>,
    /// Image signature verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_signature_check: Option<VerificationStatus>,
    /// Attestation signature verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation_signature_check: Option<VerificationStatus>,
    /// Attestation statement structure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation_syntax_check: Option<VerificationStatus>,
    /// Classified rule results.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub policy_check: Vec<CheckResult>,
    /// Signatures of the image (or, failing that, of its attestations).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<SignatureInfo>,
    /// The effective time that governed classification, once determined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_time: Option<DateTime<Utc>>,
}

impl Report {
    /// An empty report for `image_url`.
    pub fn new(image_url: impl Into<String>) -> Self {
        Self {
            image_url: image_url.into(),
            image_accessible_check: None,
            image_signature_check: None,
            attestation_signature_check: None,
            attestation_syntax_check: None,
            policy_check: Vec::new(),
            signatures: Vec::new(),
            effective_time: None,
        }
    }

    fn stages(&self) -> [Option<&VerificationStatus>; 4] {
        [
            self.image_accessible_check.as_ref(),
            self.image_signature_check.as_ref(),
            self.attestation_signature_check.as_ref(),
            self.attestation_syntax_check.as_ref(),
        ]
    }

    /// Failed stage messages, then policy failures, in order.
    pub fn violations(&self) -> Vec<&RawResult> {
        self.stages()
            .into_iter()
            .flatten()
            .filter_map(VerificationStatus::violation)
            .chain(self.policy_check.iter().flat_map(|c| c.failures.iter()))
            .collect()
    }

    /// Policy warnings, in order.
    pub fn warnings(&self) -> Vec<&RawResult> {
        self.policy_check
            .iter()
            .flat_map(|c| c.warnings.iter())
            .collect()
    }

    /// Policy successes, in order.
    pub fn successes(&self) -> Vec<&RawResult> {
        self.policy_check
            .iter()
            .flat_map(|c| c.successes.iter())
            .collect()
    }

    /// `true` when nothing blocks.
    pub fn passed(&self) -> bool {
        self.violations().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(results: &[&RawResult]) -> Vec<String> {
        results.iter().map(|r| r.message.clone()).collect()
    }

    #[test]
    fn empty_report_passes() {
        let report = Report::new("registry.example/spam");
        assert!(report.passed());
        assert!(report.violations().is_empty());
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            serde_json::json!({ "imageUrl": "registry.example/spam" })
        );
    }

    #[test]
    fn violations_list_stage_failures_then_policy_failures() {
        let mut report = Report::new("img");
        report.image_accessible_check = Some(VerificationStatus::pass("accessible"));
        report.image_signature_check = Some(VerificationStatus::fail("image signature failed"));
        report.attestation_signature_check =
            Some(VerificationStatus::fail("attestation signature failed"));
        report.attestation_syntax_check = Some(VerificationStatus::fail("invalid syntax"));
        report.policy_check = vec![
            CheckResult {
                failures: vec![RawResult::new("failure 1"), RawResult::new("failure 2")],
                ..Default::default()
            },
            CheckResult {
                warnings: vec![RawResult::new("warning 3")],
                successes: vec![RawResult::new("success 4")],
                ..Default::default()
            },
            CheckResult {
                failures: vec![RawResult::new("failure 5")],
                warnings: vec![RawResult::new("warning 6")],
                ..Default::default()
            },
        ];

        assert_eq!(
            messages(&report.violations()),
            [
                "image signature failed",
                "attestation signature failed",
                "invalid syntax",
                "failure 1",
                "failure 2",
                "failure 5"
            ]
        );
        assert_eq!(messages(&report.warnings()), ["warning 3", "warning 6"]);
        assert_eq!(messages(&report.successes()), ["success 4"]);
        assert!(!report.passed());
    }

    #[test]
    fn serializes_stage_shape() {
        let mut report = Report::new("img");
        report.image_accessible_check = Some(VerificationStatus::fail("no response received"));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "imageUrl": "img",
                "imageAccessibleCheck": {
                    "passed": false,
                    "result": { "msg": "no response received" }
                }
            })
        );
    }
}
