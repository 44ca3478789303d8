//! Error types for the verification subsystem.

/// Errors that stop a verification run.
///
/// A failed signature or an inaccessible image is *not* an error: those are
/// recorded in the [`Report`](crate::report::Report). These variants mean the
/// pipeline could not run to completion.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    /// The image reference could not be parsed.
    #[error("invalid image reference `{reference}`: {reason}")]
    InvalidReference {
        /// The reference as given by the caller.
        reference: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The policy specification is unusable.
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    /// An explicit effective time could not be parsed as RFC3339.
    #[error("invalid effective time `{value}`: {source}")]
    InvalidEffectiveTime {
        /// The rejected value.
        value: String,
        /// The underlying parse error.
        source: chrono::ParseError,
    },

    /// A collaborator failed in a way that is not a verification outcome.
    #[error("{stage} failed: {source}")]
    Collaborator {
        /// Pipeline stage that invoked the collaborator.
        stage: &'static str,
        /// The collaborator's error.
        source: CollaboratorError,
    },

    /// The run was cancelled through its cancellation token.
    #[error("verification cancelled during {0}")]
    Cancelled(&'static str),

    /// The rule engines produced no successes, warnings, or failures.
    #[error("no successes, warnings, or failures, check input")]
    NoResults,

    /// I/O error while staging evaluation input.
    #[error("verification I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl VerificationError {
    /// Wrap a collaborator error raised during `stage`, mapping cancellation
    /// to [`VerificationError::Cancelled`].
    pub(crate) fn from_collaborator(stage: &'static str, source: CollaboratorError) -> Self {
        match source {
            CollaboratorError::Cancelled => Self::Cancelled(stage),
            source => Self::Collaborator { stage, source },
        }
    }
}

/// Errors reported by collaborator implementations.
///
/// For the signature and attestation checks a `Failed` error is a
/// verification outcome and ends up in the report; `Cancelled` always aborts
/// the run.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    /// The operation ran and failed.
    #[error("{0}")]
    Failed(String),

    /// The cancellation token fired before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error inside the collaborator.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
