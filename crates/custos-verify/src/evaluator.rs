//! Rule-evaluation collaborators and their scratch workspace.
//!
//! The `Evaluator` trait is the seam to an external rule engine. Engines
//! that stage rules and data on disk can use [`EvaluationWorkspace`], which
//! lays out `policy/` and `data/` directories and writes the policy
//! configuration the rules read as `data.config.policy`.
//! [`CommandEvaluator`] runs such an engine as a subprocess.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use tempfile::TempDir;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::PolicyContext;
use crate::error::CollaboratorError;
use crate::result::CheckResult;

/// An external rule engine.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Evaluate the configured rules against the input files.
    ///
    /// Failing rules are reported in the returned results; an `Err` means
    /// the engine itself could not run.
    async fn evaluate(
        &self,
        inputs: &[PathBuf],
        context: &PolicyContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<CheckResult>, CollaboratorError>;

    /// Release resources held by the engine. Called once per run, whether
    /// or not `evaluate` ran or succeeded.
    fn release(&self);

    /// Name used in logs.
    fn name(&self) -> &str {
        "evaluator"
    }
}

/// Rule configuration as the rules see it under `data.config.policy`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyConfig {
    /// Deprecated non-blocking matchers.
    #[serde(rename = "non_blocking_checks", skip_serializing_if = "Vec::is_empty")]
    pub non_blocking: Vec<String>,
    /// Exclude matchers.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    /// Include matchers.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    /// Included collections.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<String>,
    /// Effective time in nanoseconds since the Unix epoch.
    pub when_ns: i64,
}

impl PolicyConfig {
    /// Snapshot the rule-facing configuration of `context`.
    pub fn from_context(context: &PolicyContext) -> Self {
        Self {
            non_blocking: context.non_blocking().to_vec(),
            exclude: context.exclude().to_vec(),
            include: context.include().to_vec(),
            collections: context.collections().to_vec(),
            // Out of range only past the year 2262.
            when_ns: context
                .effective_time()
                .timestamp_nanos_opt()
                .unwrap_or(i64::MAX),
        }
    }
}

#[derive(Serialize)]
struct ConfigDocument {
    config: ConfigSection,
}

#[derive(Serialize)]
struct ConfigSection {
    policy: PolicyConfig,
}

/// Temporary directory tree for one evaluator.
///
/// The tree is removed on [`release`](Self::release) or drop, unless the
/// workspace was created with `retain` set.
#[derive(Debug)]
pub struct EvaluationWorkspace {
    dir: Mutex<Option<TempDir>>,
    root: PathBuf,
    retain: bool,
}

impl EvaluationWorkspace {
    /// File name of the configuration inside the data directory.
    pub const CONFIG_FILE: &str = "config.json";

    /// Create the workspace with empty `policy/` and `data/` directories.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directories cannot be created.
    pub fn create(retain: bool) -> Result<Self, CollaboratorError> {
        let dir = tempfile::Builder::new().prefix("custos-").tempdir()?;
        let root = dir.path().to_path_buf();
        std::fs::create_dir_all(root.join("policy"))?;
        std::fs::create_dir_all(root.join("data"))?;
        debug!(path = %root.display(), "created evaluation workspace");
        Ok(Self {
            dir: Mutex::new(Some(dir)),
            root,
            retain,
        })
    }

    /// Root of the workspace.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory rule bundles are placed in.
    pub fn policy_dir(&self) -> PathBuf {
        self.root.join("policy")
    }

    /// Directory data documents are placed in.
    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Write `data/config.json` for `context`, replacing any earlier copy.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be written.
    pub fn write_config(&self, context: &PolicyContext) -> Result<PathBuf, CollaboratorError> {
        let config = ConfigDocument {
            config: ConfigSection {
                policy: PolicyConfig::from_context(context),
            },
        };
        let json = serde_json::to_vec_pretty(&config)
            .map_err(|e| CollaboratorError::Failed(format!("serialize policy config: {e}")))?;
        let path = self.data_dir().join(Self::CONFIG_FILE);
        std::fs::write(&path, json)?;
        debug!(path = %path.display(), "wrote policy config");
        Ok(path)
    }

    /// Remove the directory tree, or keep it if retention was requested.
    /// Idempotent.
    pub fn release(&self) {
        let taken = match self.dir.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(dir) = taken else {
            return;
        };
        if self.retain {
            let kept = dir.keep();
            info!(path = %kept.display(), "retaining evaluation workspace");
        } else if let Err(e) = dir.close() {
            tracing::warn!(path = %self.root.display(), error = %e, "failed to remove evaluation workspace");
        }
    }
}

impl Drop for EvaluationWorkspace {
    fn drop(&mut self) {
        self.release();
    }
}

/// Environment variable holding the workspace root.
pub const WORKSPACE_ENV: &str = "CUSTOS_WORKSPACE";
/// Environment variable holding the rule directory.
pub const POLICY_DIR_ENV: &str = "CUSTOS_POLICY_DIR";
/// Environment variable holding the data directory.
pub const DATA_DIR_ENV: &str = "CUSTOS_DATA_DIR";

/// An external rule engine run as a subprocess.
///
/// Every evaluation stages its own [`EvaluationWorkspace`]: rule files are
/// copied into `policy/` and the configuration is written to
/// `data/config.json`. The engine runs with [`WORKSPACE_ENV`],
/// [`POLICY_DIR_ENV`] and [`DATA_DIR_ENV`] set and the input paths appended
/// to its arguments, and must print a JSON array of [`CheckResult`]s.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    program: PathBuf,
    args: Vec<String>,
    rules: Vec<PathBuf>,
    retain: bool,
}

impl CommandEvaluator {
    /// An evaluator running `program` with no extra arguments or rules.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            rules: Vec::new(),
            retain: false,
        }
    }

    /// Arguments passed before the input paths.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Rule files copied into each workspace's `policy/` directory.
    #[must_use]
    pub fn rules(mut self, rules: impl IntoIterator<Item = PathBuf>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Keep workspaces after evaluation for inspection.
    #[must_use]
    pub const fn retain_workspace(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    fn stage(&self, context: &PolicyContext) -> Result<EvaluationWorkspace, CollaboratorError> {
        let workspace = EvaluationWorkspace::create(self.retain)?;
        for rule in &self.rules {
            let name = rule.file_name().ok_or_else(|| {
                CollaboratorError::Failed(format!("rule path `{}` has no file name", rule.display()))
            })?;
            std::fs::copy(rule, workspace.policy_dir().join(name))?;
        }
        workspace.write_config(context)?;
        Ok(workspace)
    }
}

#[async_trait]
impl Evaluator for CommandEvaluator {
    async fn evaluate(
        &self,
        inputs: &[PathBuf],
        context: &PolicyContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<CheckResult>, CollaboratorError> {
        if cancel.is_cancelled() {
            return Err(CollaboratorError::Cancelled);
        }
        let workspace = self.stage(context)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(inputs)
            .env(WORKSPACE_ENV, workspace.root())
            .env(POLICY_DIR_ENV, workspace.policy_dir())
            .env(DATA_DIR_ENV, workspace.data_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            program = %self.program.display(),
            workspace = %workspace.root().display(),
            inputs = inputs.len(),
            "starting rule engine"
        );
        let child = cmd.spawn().map_err(|e| {
            CollaboratorError::Failed(format!("failed to start `{}`: {e}", self.program.display()))
        })?;

        let output = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(CollaboratorError::Cancelled),
            output = child.wait_with_output() => output?,
        };
        workspace.release();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CollaboratorError::Failed(format!(
                "`{}` exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }

        let results: Vec<CheckResult> = serde_json::from_slice(&output.stdout).map_err(|e| {
            CollaboratorError::Failed(format!("unreadable output from `{}`: {e}", self.program.display()))
        })?;
        debug!(groups = results.len(), "rule engine finished");
        Ok(results)
    }

    // Workspaces live for a single evaluation.
    fn release(&self) {}

    fn name(&self) -> &str {
        self.program.to_str().unwrap_or("command")
    }
}
