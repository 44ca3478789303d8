//! Raw rule-evaluation results and their classified form.
//!
//! The metadata keys `code`, `term`, `collections` and `effective_on` are a
//! wire contract with the rule engines. [`ResultMetadata`] is the only place
//! that interprets them; a recognized key holding the wrong JSON type reads as
//! absent.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key holding the dot-delimited rule code.
pub const CODE_KEY: &str = "code";
/// Metadata key holding the optional term qualifier.
pub const TERM_KEY: &str = "term";
/// Metadata key holding the list of collections.
pub const COLLECTIONS_KEY: &str = "collections";
/// Metadata key holding the date a rule starts to block.
pub const EFFECTIVE_ON_KEY: &str = "effective_on";
/// Exact format of `effective_on` values.
pub const EFFECTIVE_ON_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// A single result produced by a rule engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    /// Human-readable message.
    #[serde(rename = "msg")]
    pub message: String,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl RawResult {
    /// A result with a message and no metadata.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Builder-style metadata insertion.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_owned(), value.into());
        self
    }

    /// Typed view of the recognized metadata keys.
    pub fn typed_metadata(&self) -> ResultMetadata<'_> {
        ResultMetadata::from_map(&self.metadata)
    }
}

/// State of a result's `effective_on` metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectiveOn {
    /// Key not present.
    Absent,
    /// Present but not a string in [`EFFECTIVE_ON_FORMAT`].
    Invalid(String),
    /// The instant from which the rule blocks.
    At(DateTime<Utc>),
}

/// Recognized metadata of a [`RawResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultMetadata<'a> {
    /// Rule code, e.g. `release.test`.
    pub code: Option<&'a str>,
    /// Term qualifier.
    pub term: Option<&'a str>,
    /// Declared collections; non-string entries are dropped.
    pub collections: Vec<&'a str>,
    /// Effective-on date.
    pub effective_on: EffectiveOn,
}

impl<'a> ResultMetadata<'a> {
    /// Interpret a metadata map.
    pub fn from_map(metadata: &'a serde_json::Map<String, serde_json::Value>) -> Self {
        let string = |key: &str| {
            metadata
                .get(key)
                .and_then(serde_json::Value::as_str)
                .filter(|s| !s.is_empty())
        };

        let collections = metadata
            .get(COLLECTIONS_KEY)
            .and_then(serde_json::Value::as_array)
            .map(|values| values.iter().filter_map(serde_json::Value::as_str).collect())
            .unwrap_or_default();

        let effective_on = match metadata.get(EFFECTIVE_ON_KEY) {
            None => EffectiveOn::Absent,
            Some(serde_json::Value::String(s)) => parse_effective_on(s)
                .map_or_else(|| EffectiveOn::Invalid(s.clone()), EffectiveOn::At),
            Some(other) => EffectiveOn::Invalid(other.to_string()),
        };

        Self {
            code: string(CODE_KEY),
            term: string(TERM_KEY),
            collections,
            effective_on,
        }
    }
}

/// Parse an `effective_on` value in the exact [`EFFECTIVE_ON_FORMAT`].
pub fn parse_effective_on(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, EFFECTIVE_ON_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Results from one rule-engine evaluation of one input, grouped by outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Input file the results were produced for.
    #[serde(default)]
    pub filename: String,
    /// Rule namespace.
    #[serde(default)]
    pub namespace: String,
    /// Passing rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub successes: Vec<RawResult>,
    /// Non-blocking findings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<RawResult>,
    /// Blocking findings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<RawResult>,
}

impl CheckResult {
    /// Number of results across all outcomes.
    pub fn total(&self) -> usize {
        self.successes.len() + self.warnings.len() + self.failures.len()
    }

    /// Every result tagged with its outcome: successes, then warnings, then
    /// failures, each in original order.
    pub fn classified(&self) -> impl Iterator<Item = ClassifiedResult<'_>> {
        let successes = self.successes.iter().map(|result| ClassifiedResult {
            outcome: Outcome::Success,
            result,
        });
        let warnings = self.warnings.iter().map(|result| ClassifiedResult {
            outcome: Outcome::Warning,
            result,
        });
        let failures = self.failures.iter().map(|result| ClassifiedResult {
            outcome: Outcome::Failure,
            result,
        });
        successes.chain(warnings).chain(failures)
    }
}

/// Final classification of a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The rule passed.
    Success,
    /// Reported, does not block.
    Warning,
    /// Blocks.
    Failure,
}

/// A [`RawResult`] tagged with its [`Outcome`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifiedResult<'a> {
    /// The classification.
    pub outcome: Outcome,
    /// The underlying result.
    pub result: &'a RawResult,
}
