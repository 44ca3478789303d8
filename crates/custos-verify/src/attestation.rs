//! Verified attestations and the checks the pipeline runs over them.
//!
//! Records arrive from the signing-verification collaborator already
//! signature-checked. This module validates their in-toto statement shape,
//! filters them by subject digest, and derives the attestation time used as
//! the effective time of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Predicate type of SLSA provenance v0.2 statements.
pub const SLSA_PROVENANCE_V02: &str = "https://slsa.dev/provenance/v0.2";

/// JSON pointer to the build finish time in SLSA v0.2 provenance.
pub const BUILD_FINISHED_ON_POINTER: &str = "/predicate/metadata/buildFinishedOn";

/// Accepted in-toto statement type URIs.
const STATEMENT_TYPES: &[&str] = &[
    "https://in-toto.io/Statement/v0.1",
    "https://in-toto.io/Statement/v1",
];

/// Signature metadata reported alongside the verification result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    /// Key identifier, if the signer recorded one.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_id: String,
    /// Base64 signature.
    #[serde(rename = "sig")]
    pub signature: String,
    /// PEM signing certificate, for keyless signatures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    /// PEM certificate chain, for keyless signatures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
}

/// One verified attestation: the decoded in-toto statement and the
/// signatures that covered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationRecord {
    /// The decoded statement.
    pub statement: serde_json::Value,
    /// Signatures over the statement envelope.
    #[serde(default)]
    pub signatures: Vec<SignatureInfo>,
}

impl AttestationRecord {
    /// Wrap a statement with no signature metadata.
    pub const fn new(statement: serde_json::Value) -> Self {
        Self {
            statement,
            signatures: Vec::new(),
        }
    }

    /// The statement's `predicateType`, if it is a string.
    pub fn predicate_type(&self) -> Option<&str> {
        self.statement
            .get("predicateType")
            .and_then(serde_json::Value::as_str)
    }

    /// All `sha256` subject digests (hex, without algorithm prefix).
    pub fn subject_digests(&self) -> Vec<&str> {
        self.statement
            .get("subject")
            .and_then(serde_json::Value::as_array)
            .map(|subjects| {
                subjects
                    .iter()
                    .filter_map(|s| s.get("digest")?.get("sha256")?.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The SLSA v0.2 `buildFinishedOn` time.
    ///
    /// `None` when the statement is not SLSA v0.2 provenance, lacks the
    /// field, or the value is not an RFC3339 string.
    pub fn build_finished_on(&self) -> Option<DateTime<Utc>> {
        if self.predicate_type() != Some(SLSA_PROVENANCE_V02) {
            debug!(
                predicate_type = self.predicate_type().unwrap_or("<none>"),
                "attestation is not SLSA provenance"
            );
            return None;
        }
        let Some(value) = self.statement.pointer(BUILD_FINISHED_ON_POINTER) else {
            debug!("attestation has no {BUILD_FINISHED_ON_POINTER}");
            return None;
        };
        let Some(text) = value.as_str() else {
            debug!(%value, "unexpected buildFinishedOn value");
            return None;
        };
        match DateTime::parse_from_rfc3339(text) {
            Ok(t) => Some(t.with_timezone(&Utc)),
            Err(e) => {
                debug!(value = text, error = %e, "unable to parse buildFinishedOn as RFC3339");
                None
            }
        }
    }

    /// Check the statement against the in-toto statement layout.
    ///
    /// # Errors
    ///
    /// Returns a description of the first structural problem found.
    pub fn check_syntax(&self) -> Result<(), String> {
        let statement = self
            .statement
            .as_object()
            .ok_or_else(|| "statement is not a JSON object".to_owned())?;

        match statement.get("_type").and_then(serde_json::Value::as_str) {
            Some(t) if STATEMENT_TYPES.contains(&t) => {}
            Some(t) => return Err(format!("unsupported statement type `{t}`")),
            None => return Err("missing `_type`".to_owned()),
        }

        match statement.get("predicateType").and_then(serde_json::Value::as_str) {
            Some(t) if !t.is_empty() => {}
            _ => return Err("missing `predicateType`".to_owned()),
        }

        let subjects = statement
            .get("subject")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| "missing `subject` list".to_owned())?;
        if subjects.is_empty() {
            return Err("`subject` list is empty".to_owned());
        }
        for (i, subject) in subjects.iter().enumerate() {
            let digest = subject
                .get("digest")
                .and_then(serde_json::Value::as_object)
                .ok_or_else(|| format!("subject {i} has no `digest`"))?;
            if digest.is_empty() || !digest.values().all(serde_json::Value::is_string) {
                return Err(format!("subject {i} has a malformed `digest`"));
            }
        }

        if !statement
            .get("predicate")
            .is_some_and(serde_json::Value::is_object)
        {
            return Err("missing `predicate` object".to_owned());
        }

        Ok(())
    }
}

/// The most recent `buildFinishedOn` among `attestations`.
///
/// Attestations without a usable time are skipped. Returns `None` when no
/// attestation yields one.
pub fn resolve_attestation_time(attestations: &[AttestationRecord]) -> Option<DateTime<Utc>> {
    if attestations.is_empty() {
        debug!("no attestations provided to determine attestation time");
        return None;
    }

    let latest = attestations
        .iter()
        .enumerate()
        .filter_map(|(index, attestation)| {
            let time = attestation.build_finished_on();
            if time.is_none() {
                debug!(index, "skipping attestation without a usable build time");
            }
            time
        })
        .max();

    if let Some(t) = latest {
        debug!(time = %t.to_rfc3339(), "determined attestation time");
    }
    latest
}

/// Split attestations into syntactically valid ones and error messages for
/// the rest.
pub fn partition_by_syntax(
    attestations: Vec<AttestationRecord>,
) -> (Vec<AttestationRecord>, Vec<String>) {
    let mut valid = Vec::with_capacity(attestations.len());
    let mut errors = Vec::new();
    for (index, attestation) in attestations.into_iter().enumerate() {
        match attestation.check_syntax() {
            Ok(()) => valid.push(attestation),
            Err(e) => {
                debug!(index, error = %e, "dropping syntactically invalid attestation");
                errors.push(format!("attestation {index}: {e}"));
            }
        }
    }
    (valid, errors)
}

/// Keep only attestations with a subject whose sha256 equals `digest_hex`.
pub fn filter_matching(
    attestations: Vec<AttestationRecord>,
    digest_hex: &str,
) -> Vec<AttestationRecord> {
    attestations
        .into_iter()
        .filter(|a| a.subject_digests().contains(&digest_hex))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const DIGEST: &str = "4e388ab32b10dc8dbc7e28144f552830adc74787c1e2c0824032078a79f227fb";

    fn provenance(finished: Option<&str>) -> AttestationRecord {
        let mut metadata = serde_json::json!({});
        if let Some(f) = finished {
            metadata["buildFinishedOn"] = serde_json::Value::String(f.to_owned());
        }
        AttestationRecord::new(serde_json::json!({
            "_type": "https://in-toto.io/Statement/v0.1",
            "predicateType": SLSA_PROVENANCE_V02,
            "subject": [{ "name": "registry.example/spam", "digest": { "sha256": DIGEST } }],
            "predicate": {
                "buildType": "https://tekton.dev/attestations/chains/pipelinerun@v2",
                "builder": { "id": "scheme:uri" },
                "metadata": metadata
            }
        }))
    }

    #[test]
    fn resolver_picks_latest_time() {
        let t1 = Utc.with_ymd_and_hms(2001, 2, 3, 4, 5, 6).unwrap();
        let t2 = Utc.with_ymd_and_hms(2010, 11, 12, 13, 14, 15).unwrap();
        let atts = vec![
            provenance(Some("2001-02-03T04:05:06Z")),
            provenance(Some("2010-11-12T13:14:15Z")),
            provenance(None),
        ];
        assert_eq!(resolve_attestation_time(&atts), Some(t2));
        assert_eq!(resolve_attestation_time(&atts[..1]), Some(t1));
    }

    #[test]
    fn resolver_normalizes_offsets() {
        let atts = vec![
            provenance(Some("2020-01-01T10:00:00+05:00")),
            provenance(Some("2020-01-01T06:00:00Z")),
        ];
        assert_eq!(
            resolve_attestation_time(&atts),
            Some(Utc.with_ymd_and_hms(2020, 1, 1, 6, 0, 0).unwrap())
        );
    }

    #[test]
    fn resolver_returns_none_without_usable_times() {
        assert_eq!(resolve_attestation_time(&[]), None);

        let mut not_slsa = provenance(Some("2020-01-01T00:00:00Z"));
        not_slsa.statement["predicateType"] = "https://spdx.dev/Document".into();
        let mut numeric = provenance(None);
        numeric.statement["predicate"]["metadata"]["buildFinishedOn"] = 1_234.into();

        let atts = vec![
            provenance(None),
            provenance(Some("last tuesday")),
            not_slsa,
            numeric,
        ];
        assert_eq!(resolve_attestation_time(&atts), None);
    }

    #[test]
    fn subject_digests_and_filtering() {
        let matching = provenance(None);
        let mut other = provenance(None);
        other.statement["subject"][0]["digest"]["sha256"] = "ff".into();

        assert_eq!(matching.subject_digests(), vec![DIGEST]);
        let kept = filter_matching(vec![matching.clone(), other], DIGEST);
        assert_eq!(kept, vec![matching]);
    }

    #[test]
    fn syntax_check_accepts_provenance() {
        assert!(provenance(Some("2020-01-01T00:00:00Z")).check_syntax().is_ok());
    }

    #[test]
    fn syntax_check_reports_problems() {
        let cases: Vec<(serde_json::Value, &str)> = vec![
            (serde_json::json!([]), "not a JSON object"),
            (
                serde_json::json!({ "predicateType": "x", "subject": [], "predicate": {} }),
                "missing `_type`",
            ),
            (
                serde_json::json!({ "_type": "https://in-toto.io/Statement/v1", "subject": [], "predicate": {} }),
                "missing `predicateType`",
            ),
            (
                serde_json::json!({ "_type": "https://in-toto.io/Statement/v1", "predicateType": "x", "subject": [], "predicate": {} }),
                "`subject` list is empty",
            ),
            (
                serde_json::json!({ "_type": "https://in-toto.io/Statement/v1", "predicateType": "x", "subject": [{ "name": "a" }], "predicate": {} }),
                "has no `digest`",
            ),
            (
                serde_json::json!({ "_type": "https://in-toto.io/Statement/v1", "predicateType": "x", "subject": [{ "digest": { "sha256": "a" } }] }),
                "missing `predicate`",
            ),
        ];

        for (statement, expected) in cases {
            let err = AttestationRecord::new(statement).check_syntax().unwrap_err();
            assert!(err.contains(expected), "`{err}` should mention `{expected}`");
        }
    }

    #[test]
    fn partition_keeps_order_and_reports_index() {
        let good = provenance(None);
        let bad = AttestationRecord::new(serde_json::json!({}));
        let (valid, errors) = partition_by_syntax(vec![bad, good.clone()]);
        assert_eq!(valid, vec![good]);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("attestation 0:"));
    }
}
