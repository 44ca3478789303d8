//! Policy context: rule-selection configuration and the effective time for
//! one verification run.
//!
//! The context is built from a [`PolicySpec`] plus caller overrides. Its
//! effective time starts either pinned by the caller or as a "now"
//! placeholder that the attestation time may replace exactly once.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::VerificationError;

/// A policy specification as deserialized from JSON.
///
/// Unknown fields are ignored so that full policy resources can be fed in
/// directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// Public key material or key reference, opaque to this crate.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_key: String,
    /// Transparency log URL.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rekor_url: String,
    /// Rule selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<PolicyConfiguration>,
    /// Deprecated exception list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exceptions: Option<PolicyExceptions>,
    /// Rule bundle locations, passed through to evaluators.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<serde_json::Value>,
}

/// Include/exclude/collection rule selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfiguration {
    /// Matchers for results to include.
    #[serde(default)]
    pub include: Vec<String>,
    /// Matchers for results to exclude.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Collections whose results are included.
    #[serde(default)]
    pub collections: Vec<String>,
}

/// Deprecated exception configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyExceptions {
    /// Matchers treated exactly like `exclude`.
    #[serde(default)]
    pub non_blocking: Vec<String>,
}

impl PolicySpec {
    /// Parse a specification from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::InvalidPolicy`] on malformed JSON.
    pub fn from_json(json: &str) -> Result<Self, VerificationError> {
        serde_json::from_str(json)
            .map_err(|e| VerificationError::InvalidPolicy(format!("unable to parse policy: {e}")))
    }

    /// Load a specification from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or
    /// [`VerificationError::InvalidPolicy`] if it is not a valid policy.
    pub fn from_file(path: &Path) -> Result<Self, VerificationError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// Resolve a policy reference: empty means an empty policy, text
    /// containing `{` is inline JSON, anything else is a file path.
    ///
    /// # Errors
    ///
    /// See [`PolicySpec::from_json`] and [`PolicySpec::from_file`].
    pub fn load(reference: &str) -> Result<Self, VerificationError> {
        if reference.is_empty() {
            debug!("using an empty policy");
            Ok(Self::default())
        } else if reference.contains('{') {
            debug!("reading policy as inline JSON");
            Self::from_json(reference)
        } else {
            debug!(path = reference, "reading policy from file");
            Self::from_file(Path::new(reference)).map_err(|e| match e {
                VerificationError::IoError(io) => VerificationError::InvalidPolicy(format!(
                    "unable to read policy file `{reference}`: {io}"
                )),
                other => other,
            })
        }
    }
}

/// Caller-supplied values that take precedence over the specification.
#[derive(Debug, Clone, Default)]
pub struct ContextOverrides {
    /// Replaces the policy's public key when non-empty.
    pub public_key: Option<String>,
    /// Replaces the policy's transparency log URL when non-empty.
    pub rekor_url: Option<String>,
    /// RFC3339 instant, or `now`. Pins the effective time for the run.
    pub effective_time: Option<String>,
}

/// Where the effective time of a run came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "source", content = "time", rename_all = "lowercase")]
pub enum EffectiveTime {
    /// Placeholder taken at construction; may be replaced once.
    Now(DateTime<Utc>),
    /// Set explicitly by the caller; never replaced.
    Pinned(DateTime<Utc>),
    /// Taken from the attestations; never replaced again.
    Attested(DateTime<Utc>),
}

impl EffectiveTime {
    /// The instant, regardless of origin.
    pub const fn instant(&self) -> DateTime<Utc> {
        match self {
            Self::Now(t) | Self::Pinned(t) | Self::Attested(t) => *t,
        }
    }
}

/// Immutable-per-run policy configuration.
#[derive(Debug, Clone)]
pub struct PolicyContext {
    public_key: String,
    rekor_url: Option<String>,
    include: Vec<String>,
    exclude: Vec<String>,
    collections: Vec<String>,
    non_blocking: Vec<String>,
    sources: Vec<serde_json::Value>,
    effective_time: EffectiveTime,
}

impl PolicyContext {
    /// Build a context from a specification and overrides.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::InvalidPolicy`] if no public key is left
    /// after overrides, or [`VerificationError::InvalidEffectiveTime`] if the
    /// explicit effective time does not parse.
    pub fn new(spec: PolicySpec, overrides: ContextOverrides) -> Result<Self, VerificationError> {
        let mut public_key = spec.public_key;
        if let Some(key) = overrides.public_key.filter(|k| !k.is_empty()) {
            if key != public_key {
                debug!("public key overridden by caller");
                public_key = key;
            }
        }
        if public_key.is_empty() {
            return Err(VerificationError::InvalidPolicy(
                "policy must provide a public key".to_owned(),
            ));
        }

        let mut rekor_url = spec.rekor_url;
        if let Some(url) = overrides.rekor_url.filter(|u| !u.is_empty()) {
            debug!(url = %url, "rekor URL overridden by caller");
            rekor_url = url;
        }

        let effective_time = match overrides.effective_time.as_deref() {
            None | Some("") => {
                let now = Utc::now();
                debug!(time = %now.to_rfc3339_opts(SecondsFormat::Secs, true), "using current time");
                EffectiveTime::Now(now)
            }
            Some("now") => EffectiveTime::Pinned(Utc::now()),
            Some(value) => {
                let when = DateTime::parse_from_rfc3339(value).map_err(|source| {
                    VerificationError::InvalidEffectiveTime {
                        value: value.to_owned(),
                        source,
                    }
                })?;
                debug!(time = value, "using custom effective time");
                EffectiveTime::Pinned(when.with_timezone(&Utc))
            }
        };

        let configuration = spec.configuration.unwrap_or_default();
        let non_blocking = spec
            .exceptions
            .map(|e| e.non_blocking)
            .unwrap_or_default();

        Ok(Self {
            public_key,
            rekor_url: Some(rekor_url).filter(|u| !u.is_empty()),
            include: ordered_set(configuration.include),
            exclude: ordered_set(configuration.exclude),
            collections: ordered_set(configuration.collections),
            non_blocking: ordered_set(non_blocking),
            sources: spec.sources,
            effective_time,
        })
    }

    /// Replace the "now" placeholder with the attestation time.
    ///
    /// Has no effect when the caller pinned an effective time or when the
    /// placeholder was already replaced.
    pub fn set_attestation_time(&mut self, time: DateTime<Utc>) {
        match self.effective_time {
            EffectiveTime::Now(_) => {
                debug!(time = %time.to_rfc3339_opts(SecondsFormat::Secs, true), "using attestation time as effective time");
                self.effective_time = EffectiveTime::Attested(time);
            }
            EffectiveTime::Pinned(_) | EffectiveTime::Attested(_) => {
                debug!("effective time already fixed, ignoring attestation time");
            }
        }
    }

    /// The instant against which time-scoped rules are judged.
    pub const fn effective_time(&self) -> DateTime<Utc> {
        self.effective_time.instant()
    }

    /// The effective time together with its origin.
    pub const fn effective_time_source(&self) -> EffectiveTime {
        self.effective_time
    }

    /// Opaque public key material.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Transparency log URL, if configured.
    pub fn rekor_url(&self) -> Option<&str> {
        self.rekor_url.as_deref()
    }

    /// Include matchers.
    pub fn include(&self) -> &[String] {
        &self.include
    }

    /// Exclude matchers.
    pub fn exclude(&self) -> &[String] {
        &self.exclude
    }

    /// Included collections.
    pub fn collections(&self) -> &[String] {
        &self.collections
    }

    /// Deprecated non-blocking matchers.
    pub fn non_blocking(&self) -> &[String] {
        &self.non_blocking
    }

    /// Rule bundle sources from the specification.
    pub fn sources(&self) -> &[serde_json::Value] {
        &self.sources
    }
}

/// Deduplicate, keeping the first occurrence.
fn ordered_set(values: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for v in values {
        if !out.contains(&v) {
            out.push(v);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn spec_with_key() -> PolicySpec {
        PolicySpec {
            public_key: "k8s://tekton-chains/public-key".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn parses_full_spec() {
        let spec = PolicySpec::from_json(
            r#"{
                "publicKey": "-----BEGIN PUBLIC KEY-----",
                "rekorUrl": "https://rekor.example",
                "configuration": {
                    "include": ["release", "release"],
                    "exclude": ["release.test"],
                    "collections": ["minimal"]
                },
                "exceptions": { "nonBlocking": ["tasks"] },
                "description": "ignored"
            }"#,
        )
        .expect("parse");

        let ctx = PolicyContext::new(spec, ContextOverrides::default()).expect("context");
        assert_eq!(ctx.include(), ["release"]);
        assert_eq!(ctx.exclude(), ["release.test"]);
        assert_eq!(ctx.collections(), ["minimal"]);
        assert_eq!(ctx.non_blocking(), ["tasks"]);
        assert_eq!(ctx.rekor_url(), Some("https://rekor.example"));
    }

    #[test]
    fn malformed_json_is_invalid_policy() {
        let err = PolicySpec::from_json("{ nope").unwrap_err();
        assert!(matches!(err, VerificationError::InvalidPolicy(_)));
    }

    #[test]
    fn load_dispatches_on_reference_shape() {
        assert_eq!(PolicySpec::load("").unwrap(), PolicySpec::default());
        assert_eq!(
            PolicySpec::load(r#"{"publicKey": "abc"}"#).unwrap().public_key,
            "abc"
        );

        let file = tempfile::NamedTempFile::new().expect("tempfile");
        std::fs::write(file.path(), r#"{"publicKey": "from-file"}"#).expect("write");
        let spec = PolicySpec::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(spec.public_key, "from-file");

        assert!(matches!(
            PolicySpec::load("ns/does-not-exist"),
            Err(VerificationError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn missing_public_key_is_rejected() {
        let err = PolicyContext::new(PolicySpec::default(), ContextOverrides::default());
        assert!(matches!(err, Err(VerificationError::InvalidPolicy(_))));
    }

    #[test]
    fn overrides_replace_spec_values() {
        let ctx = PolicyContext::new(
            spec_with_key(),
            ContextOverrides {
                public_key: Some("other-key".to_owned()),
                rekor_url: Some("https://rekor.other".to_owned()),
                effective_time: None,
            },
        )
        .unwrap();
        assert_eq!(ctx.public_key(), "other-key");
        assert_eq!(ctx.rekor_url(), Some("https://rekor.other"));

        let ctx = PolicyContext::new(
            spec_with_key(),
            ContextOverrides {
                public_key: Some(String::new()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(ctx.public_key(), "k8s://tekton-chains/public-key");
    }

    #[test]
    fn invalid_effective_time_is_rejected() {
        let err = PolicyContext::new(
            spec_with_key(),
            ContextOverrides {
                effective_time: Some("yesterday".to_owned()),
                ..Default::default()
            },
        );
        assert!(matches!(
            err,
            Err(VerificationError::InvalidEffectiveTime { .. })
        ));
    }

    #[test]
    fn attestation_time_replaces_placeholder_once() {
        let mut ctx = PolicyContext::new(spec_with_key(), ContextOverrides::default()).unwrap();
        assert!(matches!(ctx.effective_time_source(), EffectiveTime::Now(_)));

        let t1 = Utc.with_ymd_and_hms(2001, 2, 3, 4, 5, 6).unwrap();
        let t2 = Utc.with_ymd_and_hms(2010, 11, 12, 13, 14, 15).unwrap();
        ctx.set_attestation_time(t1);
        assert_eq!(ctx.effective_time(), t1);

        ctx.set_attestation_time(t2);
        assert_eq!(ctx.effective_time(), t1, "second replacement must be ignored");
    }

    #[test]
    fn pinned_time_wins_over_attestation_time() {
        let mut ctx = PolicyContext::new(
            spec_with_key(),
            ContextOverrides {
                effective_time: Some("2022-06-01T00:00:00+02:00".to_owned()),
                ..Default::default()
            },
        )
        .unwrap();
        let pinned = Utc.with_ymd_and_hms(2022, 5, 31, 22, 0, 0).unwrap();
        assert_eq!(ctx.effective_time(), pinned);

        ctx.set_attestation_time(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(ctx.effective_time(), pinned);
        assert!(matches!(ctx.effective_time_source(), EffectiveTime::Pinned(_)));
    }
}
