//! Classification of raw rule-engine results.
//!
//! Every warning and failure candidate is matched against the policy's
//! include/exclude configuration and discarded unless it is included and not
//! excluded. Kept failures whose `effective_on` lies after the effective time
//! are demoted to warnings. Successes pass through untouched.

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::context::PolicyContext;
use crate::error::VerificationError;
use crate::result::{CheckResult, EffectiveOn, RawResult};

/// Matcher that selects every result.
pub const WILDCARD: &str = "*";

/// The candidate matcher strings for a result, most specific last before
/// the wildcard: `pkg`, `pkg.*`, `pkg.rule`, their `:term` variants, `*`.
pub fn matchers(result: &RawResult) -> Vec<String> {
    let metadata = result.typed_metadata();
    let code = metadata.code.unwrap_or_default();

    let mut parts = code.rsplit('.');
    let rule = parts.next().unwrap_or_default();
    let package = parts.next().filter(|p| !p.is_empty());

    let mut out = Vec::with_capacity(7);
    if let Some(pkg) = package {
        out.push(pkg.to_owned());
        out.push(format!("{pkg}.*"));
        out.push(format!("{pkg}.{rule}"));
    }

    if let Some(term) = metadata.term {
        let qualified: Vec<String> = out.iter().map(|m| format!("{m}:{term}")).collect();
        out.extend(qualified);
    }

    out.push(WILDCARD.to_owned());
    out
}

/// Rule selection derived from a [`PolicyContext`].
#[derive(Debug, Clone)]
pub struct RuleSelection {
    include: Vec<String>,
    exclude: Vec<String>,
    collections: Vec<String>,
}

impl RuleSelection {
    /// Fold the context's configuration into effective include and exclude
    /// sets. `non_blocking` joins `exclude`; an empty include and collection
    /// configuration includes everything.
    pub fn from_context(context: &PolicyContext) -> Self {
        let include = if context.include().is_empty() && context.collections().is_empty() {
            vec![WILDCARD.to_owned()]
        } else {
            context.include().to_vec()
        };

        let mut exclude = context.exclude().to_vec();
        for matcher in context.non_blocking() {
            if !exclude.contains(matcher) {
                exclude.push(matcher.clone());
            }
        }

        Self {
            include,
            exclude,
            collections: context.collections().to_vec(),
        }
    }

    /// Whether `result` survives rule selection.
    pub fn is_included(&self, result: &RawResult) -> bool {
        let matchers = matchers(result);
        let metadata = result.typed_metadata();

        let by_collection = metadata
            .collections
            .iter()
            .any(|c| self.collections.iter().any(|wanted| wanted == c));
        let included = by_collection || has_any_match(&matchers, &self.include);
        let excluded = has_any_match(&matchers, &self.exclude);

        included && !excluded
    }
}

fn has_any_match(needles: &[String], haystack: &[String]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Whether a failure already blocks at `now`.
///
/// Missing or unusable `effective_on` metadata counts as effective.
pub fn is_effective(result: &RawResult, now: DateTime<Utc>) -> bool {
    match result.typed_metadata().effective_on {
        EffectiveOn::Absent => true,
        EffectiveOn::Invalid(value) => {
            warn!(
                value = %value,
                message = %result.message,
                "ignoring invalid effective_on value, treating result as effective"
            );
            true
        }
        EffectiveOn::At(effective_on) => effective_on <= now,
    }
}

/// Partitions raw results according to a policy context.
#[derive(Debug, Clone)]
pub struct Classifier {
    selection: RuleSelection,
    effective_time: DateTime<Utc>,
}

impl Classifier {
    /// Snapshot the context's rule selection and effective time.
    pub fn new(context: &PolicyContext) -> Self {
        Self {
            selection: RuleSelection::from_context(context),
            effective_time: context.effective_time(),
        }
    }

    /// Classify one group of results.
    pub fn classify_check(&self, check: CheckResult) -> CheckResult {
        let CheckResult {
            filename,
            namespace,
            successes,
            warnings: warning_candidates,
            failures: failure_candidates,
        } = check;

        let mut warnings = Vec::with_capacity(warning_candidates.len());
        for result in warning_candidates {
            if self.selection.is_included(&result) {
                warnings.push(result);
            } else {
                debug!(message = %result.message, "skipping excluded warning");
            }
        }

        let mut failures = Vec::with_capacity(failure_candidates.len());
        for result in failure_candidates {
            if !self.selection.is_included(&result) {
                debug!(message = %result.message, "skipping excluded failure");
            } else if is_effective(&result, self.effective_time) {
                failures.push(result);
            } else {
                debug!(message = %result.message, "failure not yet effective, reporting as warning");
                warnings.push(result);
            }
        }

        CheckResult {
            filename,
            namespace,
            successes,
            warnings,
            failures,
        }
    }

    /// Classify every group.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::NoResults`] when the classified groups
    /// hold no successes, warnings, or failures at all.
    pub fn classify(&self, checks: Vec<CheckResult>) -> Result<Vec<CheckResult>, VerificationError> {
        let classified: Vec<CheckResult> = checks
            .into_iter()
            .map(|c| self.classify_check(c))
            .collect();

        let total: usize = classified.iter().map(CheckResult::total).sum();
        if total == 0 {
            error!("no successes, warnings, or failures, check input");
            return Err(VerificationError::NoResults);
        }
        Ok(classified)
    }
}
