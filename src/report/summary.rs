//! Aggregation of a batch into a reportable summary.

use std::time::Duration;

use serde::Serialize;

use crate::cleanup::CleanupError;
use crate::run::{RunOutcome, RunResult, Stage};

/// Number of failed runs per stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub pull: usize,
    pub create: usize,
    pub start: usize,
    pub execute: usize,
}

impl StageCounts {
    fn record(&mut self, stage: Stage) {
        match stage {
            Stage::Pull => self.pull += 1,
            Stage::Create => self.create += 1,
            Stage::Start => self.start += 1,
            Stage::Execute => self.execute += 1,
        }
    }

    pub fn get(&self, stage: Stage) -> usize {
        match stage {
            Stage::Pull => self.pull,
            Stage::Create => self.create,
            Stage::Start => self.start,
            Stage::Execute => self.execute,
        }
    }

    pub fn total(&self) -> usize {
        self.pull + self.create + self.start + self.execute
    }
}

/// Pass/fail status of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Passed,
    Failed,
}

/// Display-ready detail of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub variant: String,
    pub image: String,
    pub name: String,
    pub resource_id: Option<String>,
    pub status: RunStatus,
    /// Stage the run failed at.
    pub stage: Option<Stage>,
    /// Failure description.
    pub message: Option<String>,
    /// Whether the failure was a cancellation or deadline.
    pub interrupted: bool,
    pub exit_code: Option<i64>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

impl RunSummary {
    fn from_result(result: &RunResult) -> Self {
        let (status, stage, message, interrupted) = match &result.outcome {
            RunOutcome::Succeeded => (RunStatus::Passed, None, None, false),
            RunOutcome::Failed { stage, cause } => (
                RunStatus::Failed,
                Some(*stage),
                Some(cause.to_string()),
                cause.is_interrupted(),
            ),
        };

        let output = result.output.as_ref();
        Self {
            variant: result.spec.variant.clone(),
            image: result.spec.image.clone(),
            name: result.spec.name.clone(),
            resource_id: result.resource_id.clone(),
            status,
            stage,
            message,
            interrupted,
            exit_code: output.map(|o| o.exit_code),
            stdout: output.map(|o| o.stdout.clone()),
            stderr: output.map(|o| o.stderr.clone()),
            duration: result.duration,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == RunStatus::Passed
    }

    /// Returns `true` when the run failed because its tests failed, as
    /// opposed to a provisioning problem.
    pub fn tests_failed(&self) -> bool {
        self.stage == Some(Stage::Execute) && !self.interrupted && self.exit_code.is_some()
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Summary of one batch.
///
/// Built by [`BatchSummary::from_results`], a pure function of the batch.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every run succeeded |
/// | 1 | At least one run failed |
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_by_stage: StageCounts,
    /// Runs that failed because of cancellation or their deadline.
    pub interrupted: usize,
    pub runs: Vec<RunSummary>,
    /// Containers that could not be torn down.
    pub cleanup_errors: Vec<String>,
}

impl BatchSummary {
    pub fn from_results(results: &[RunResult]) -> Self {
        let mut failed_by_stage = StageCounts::default();
        let mut interrupted = 0;

        for result in results {
            if let RunOutcome::Failed { stage, cause } = &result.outcome {
                failed_by_stage.record(*stage);
                if cause.is_interrupted() {
                    interrupted += 1;
                }
            }
        }

        let failed = failed_by_stage.total();
        Self {
            total: results.len(),
            succeeded: results.len() - failed,
            failed,
            failed_by_stage,
            interrupted,
            runs: results.iter().map(RunSummary::from_result).collect(),
            cleanup_errors: Vec::new(),
        }
    }

    /// Attaches cleanup failures. Run counts are unaffected.
    pub fn with_cleanup_errors(mut self, errors: &[CleanupError]) -> Self {
        self.cleanup_errors = errors.iter().map(ToString::to_string).collect();
        self
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }

    /// Sum of per-run durations.
    pub fn total_run_time(&self) -> Duration {
        self.runs.iter().map(|r| r.duration).sum()
    }
}
