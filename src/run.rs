//! Run specifications and results.
//!
//! A [`RunSpecification`] describes one requested test run: which image to
//! provision, what to call the container, which function package to mount,
//! and which command runs its tests. A [`RunResult`] records how far the run
//! got and how it ended.
//!
//! # Stages
//!
//! Every run moves through the same four stages. The first failing stage
//! ends the run:
//!
//! ```text
//!   Pull ──► Create ──► Start ──► Execute ──► Succeeded
//!    │         │          │          │
//!    ▼         ▼          ▼          ▼
//!  Failed    Failed     Failed     Failed
//!            (no id)    (id kept)  (id + output kept)
//! ```
//!
//! The stage a run failed at decides what cleanup has to undo; see
//! [`RunResult::teardown`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runtime::{ExecOutput, RuntimeError};

/// One requested test run.
///
/// Specifications are built once per invocation (see
/// [`variant::build_specifications`](crate::variant::build_specifications))
/// and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpecification {
    /// Image reference of the runtime environment.
    pub image: String,

    /// Container name, unique within the batch and already sanitized.
    pub name: String,

    /// Human-readable variant label, e.g. `nodejs:20`.
    pub variant: String,

    /// Function package mounted into the container.
    pub code_path: Option<PathBuf>,

    /// Command run inside the container. Empty skips the Execute stage.
    pub test_command: Vec<String>,

    /// Environment variables for the container.
    pub env: Vec<(String, String)>,
}

impl RunSpecification {
    pub fn new(image: impl Into<String>, name: impl Into<String>) -> Self {
        let image = image.into();
        Self {
            variant: image.clone(),
            image,
            name: name.into(),
            code_path: None,
            test_command: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = variant.into();
        self
    }

    pub fn code_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.code_path = Some(path.into());
        self
    }

    pub fn test_command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.test_command = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// A step of a run's workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Pull,
    Create,
    Start,
    Execute,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Pull, Stage::Create, Stage::Start, Stage::Execute];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pull => "pull",
            Stage::Create => "create",
            Stage::Start => "start",
            Stage::Execute => "execute",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureCause {
    /// The runtime reported an error.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// The run exceeded its deadline.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// The batch was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The test command ran and exited non-zero.
    #[error("tests failed with exit code {exit_code}")]
    TestsFailed { exit_code: i64 },
}

impl FailureCause {
    /// Returns `true` for cancellation and deadline failures.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, FailureCause::Cancelled | FailureCause::TimedOut(_))
    }
}

/// A failed stage together with its cause.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{stage} failed: {cause}")]
pub struct StageFailure {
    pub stage: Stage,
    pub cause: FailureCause,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed { stage: Stage, cause: FailureCause },
}

impl RunOutcome {
    pub fn failed(stage: Stage, cause: impl Into<FailureCause>) -> Self {
        RunOutcome::Failed {
            stage,
            cause: cause.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }

    /// The stage that failed, if any.
    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            RunOutcome::Succeeded => None,
            RunOutcome::Failed { stage, .. } => Some(*stage),
        }
    }

    /// The failure as an error value, if any.
    pub fn failure(&self) -> Option<StageFailure> {
        match self {
            RunOutcome::Succeeded => None,
            RunOutcome::Failed { stage, cause } => Some(StageFailure {
                stage: *stage,
                cause: cause.clone(),
            }),
        }
    }
}

/// What cleanup has to do with a run's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Nothing was created.
    Nothing,
    /// Created but never confirmed started: remove only.
    Remove,
    /// Started: stop, then remove.
    StopAndRemove,
}

/// Outcome of one attempted run.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// The specification this run was built from.
    pub spec: RunSpecification,

    /// Runtime id of the container, `None` if Create never completed.
    pub resource_id: Option<String>,

    /// Output of the test command, present only if Execute was reached.
    pub output: Option<ExecOutput>,

    /// How the run ended.
    pub outcome: RunOutcome,

    /// Wall-clock time spent in the workflow.
    pub duration: Duration,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_success()
    }

    /// The cleanup action this result calls for.
    ///
    /// Runs that failed at Start never reached a running state, so their
    /// container is removed without a stop. Anything past Start is stopped
    /// first.
    pub fn teardown(&self) -> Teardown {
        if self.resource_id.is_none() {
            return Teardown::Nothing;
        }
        match self.outcome {
            RunOutcome::Failed {
                stage: Stage::Pull | Stage::Create | Stage::Start,
                ..
            } => Teardown::Remove,
            RunOutcome::Failed {
                stage: Stage::Execute,
                ..
            }
            | RunOutcome::Succeeded => Teardown::StopAndRemove,
        }
    }
}
