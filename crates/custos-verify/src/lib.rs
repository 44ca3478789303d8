//! Policy verification for container images and their attestations.
//!
//! `custos-verify` checks that an image is reachable, that its signatures
//! and attestations verify, and then evaluates policy rules against the
//! attestations that describe it.
//!
//! The verification pipeline has three phases:
//! 1. **Access**: the reference resolves to a digest
//! 2. **Signatures**: image and attestation signatures verify
//! 3. **Policy**: rule results are classified against the policy
//!    configuration and its effective time
//!
//! Registry access and rule engines are collaborators
//! behind the [`ImageVerifier`] and [`Evaluator`] traits.

pub mod attestation;
pub mod classify;
pub mod context;
pub mod error;
pub mod evaluator;
pub mod input;
pub mod pipeline;
pub mod reference;
pub mod report;
pub mod result;

// Re-export primary types for convenience.
pub use attestation::AttestationRecord;
pub use classify::Classifier;
pub use context::{ContextOverrides, EffectiveTime, PolicyContext, PolicySpec};
pub use error::{CollaboratorError, VerificationError};
pub use evaluator::{EvaluationWorkspace, Evaluator};
pub use input::{InputWriter, JsonInputWriter, StagedInput};
pub use pipeline::{ImageVerifier, Pipeline};
pub use reference::ImageReference;
pub use report::{Report, VerificationStatus};
pub use result::{CheckResult, RawResult};
