//! Serialization of verified attestations into rule-engine input.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::TempDir;
use tracing::debug;

use crate::attestation::AttestationRecord;
use crate::error::VerificationError;

/// Writes the input document rule engines evaluate.
///
/// Each call stages a fresh input owned by the returned [`StagedInput`], so
/// one writer can serve concurrent runs.
pub trait InputWriter: Send + Sync {
    /// Serialize `attestations` into a newly staged input.
    ///
    /// # Errors
    ///
    /// Returns an error if the input cannot be staged.
    fn write_input(&self, attestations: &[AttestationRecord])
    -> Result<StagedInput, VerificationError>;
}

/// An input file staged for one run.
///
/// The staging directory is removed when the value is released or dropped.
#[derive(Debug)]
pub struct StagedInput {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl StagedInput {
    /// Take ownership of `dir`, which holds the input at `path`.
    pub fn new(dir: TempDir, path: PathBuf) -> Self {
        Self {
            dir: Some(dir),
            path,
        }
    }

    /// Path of the input file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the staging directory now, logging instead of failing.
    pub fn release(mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove input staging directory");
            }
        }
    }
}

#[derive(Serialize)]
struct InputDocument<'a> {
    attestations: Vec<&'a serde_json::Value>,
}

/// Writes `{"attestations": [<statement>, …]}` to `input.json` in a fresh
/// temporary directory per call.
#[derive(Debug, Default)]
pub struct JsonInputWriter;

impl JsonInputWriter {
    /// File name of the written input.
    pub const FILE_NAME: &str = "input.json";

    /// A new writer.
    pub fn new() -> Self {
        Self
    }
}

impl InputWriter for JsonInputWriter {
    fn write_input(
        &self,
        attestations: &[AttestationRecord],
    ) -> Result<StagedInput, VerificationError> {
        let dir = tempfile::Builder::new().prefix("custos-input-").tempdir()?;
        let doc = InputDocument {
            attestations: attestations.iter().map(|a| &a.statement).collect(),
        };
        let path = dir.path().join(Self::FILE_NAME);
        std::fs::write(&path, serde_json::to_vec(&doc)?)?;

        debug!(path = %path.display(), count = attestations.len(), "wrote evaluation input");
        Ok(StagedInput::new(dir, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_attestation_statements() {
        let writer = JsonInputWriter::new();
        let atts = vec![
            AttestationRecord::new(serde_json::json!({ "predicateType": "a" })),
            AttestationRecord::new(serde_json::json!({ "predicateType": "b" })),
        ];
        let staged = writer.write_input(&atts).expect("write");
        let path = staged.path().to_path_buf();
        assert!(path.ends_with(JsonInputWriter::FILE_NAME));

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            doc,
            serde_json::json!({
                "attestations": [{ "predicateType": "a" }, { "predicateType": "b" }]
            })
        );

        staged.release();
        assert!(!path.exists());
    }

    #[test]
    fn each_write_gets_its_own_directory() {
        let writer = JsonInputWriter::new();
        let first = writer
            .write_input(&[AttestationRecord::new(serde_json::json!({ "n": 1 }))])
            .expect("first");
        let second = writer
            .write_input(&[AttestationRecord::new(serde_json::json!({ "n": 2 }))])
            .expect("second");
        assert_ne!(first.path(), second.path());

        let second_path = second.path().to_path_buf();
        first.release();
        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&second_path).unwrap()).unwrap();
        assert_eq!(doc["attestations"][0]["n"], 2);
    }

    #[test]
    fn drop_removes_staging() {
        let staged = JsonInputWriter::new().write_input(&[]).expect("write");
        let path = staged.path().to_path_buf();
        drop(staged);
        assert!(!path.exists());
    }
}
