//! Batch orchestration.
//!
//! The [`Orchestrator`] takes an immutable batch of [`RunSpecification`]s and
//! drives every run through its workflow concurrently, with at most
//! `max_parallel` runs talking to the container runtime at any moment.
//!
//! # Architecture
//!
//! ```text
//!   &[RunSpecification]
//!          │
//!          │ validate (non-empty image, unique names)
//!          ▼
//!   ┌──────────────┐   acquire()   ┌────────────┐
//!   │ run_one × N  │──────────────►│ WorkerPool │  max_parallel slots
//!   └──────┬───────┘               └────────────┘
//!          │ Workflow::run
//!          ▼
//!   Pull ──► Create ──► Start ──► Execute
//!    (each call raced against cancellation and the run deadline)
//!          │
//!          ▼
//!   Vec<RunResult>  (index-aligned with the input)
//!          │
//!          │ cleanup()
//!          ▼
//!   Vec<CleanupError> ──► finish() ──► BatchSummary ──► Reporter
//! ```
//!
//! # Failure Isolation
//!
//! A failing run never affects its siblings: every stage failure is
//! recorded in that run's [`RunResult`] and the batch carries on.
//! [`Orchestrator::run_all`] itself only fails before any work starts.
//!
//! # Example
//!
//! ```no_run
//! use lambda_harness::cleanup::ResourceLedger;
//! use lambda_harness::config::Config;
//! use lambda_harness::orchestrator::{Orchestrator, OrchestratorSettings};
//! use lambda_harness::run::RunSpecification;
//! use lambda_harness::runtime::docker::DockerRuntime;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let runtime = DockerRuntime::new(config.runtime.clone())?;
//!     let orchestrator = Orchestrator::new(
//!         runtime,
//!         ResourceLedger::in_memory(),
//!         OrchestratorSettings::from_config(&config.harness),
//!     );
//!
//!     let specs = vec![
//!         RunSpecification::new("public.ecr.aws/lambda/nodejs:20", "lth-nodejs_20-0")
//!             .test_command(["npm", "test"]),
//!     ];
//!
//!     let token = CancellationToken::new();
//!     let results = orchestrator.run_all(&token, &specs).await?;
//!     let errors = orchestrator.cleanup(&CancellationToken::new(), &results).await;
//!     let summary = orchestrator.finish(&results, &errors).await;
//!
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod pool;
pub(crate) mod workflow;

pub use pool::WorkerPool;

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cleanup::{self, CleanupError, CleanupSettings, ResourceLedger};
use crate::config::HarnessConfig;
use crate::report::{BatchSummary, NullReporter, Reporter};
use crate::run::{FailureCause, RunOutcome, RunResult, RunSpecification, Stage};
use crate::runtime::ContainerRuntime;

use workflow::Workflow;

/// Errors that prevent a batch from starting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    /// The cancellation token was already cancelled.
    #[error("batch cancelled before it started")]
    Cancelled,

    /// A specification in the batch cannot be run.
    #[error("invalid run specification at index {index}: {reason}")]
    InvalidSpecification { index: usize, reason: String },
}

/// Limits applied to a batch.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Runs in flight at once.
    pub max_parallel: usize,

    /// Wall-clock ceiling per run.
    pub run_timeout: Duration,

    /// Ceiling per container teardown.
    pub cleanup_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            max_parallel: config.max_parallel,
            run_timeout: config.run_timeout(),
            cleanup_timeout: config.cleanup_timeout(),
        }
    }

    fn cleanup_settings(&self) -> CleanupSettings {
        CleanupSettings {
            max_parallel: self.max_parallel,
            timeout: self.cleanup_timeout,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&HarnessConfig::default())
    }
}

/// Drives batches of runs against a container runtime.
///
/// # Type Parameters
///
/// - `C`: the container runtime
/// - `R`: the reporter notified of run and batch events
pub struct Orchestrator<C, R = NullReporter> {
    runtime: C,
    reporter: R,
    ledger: ResourceLedger,
    settings: OrchestratorSettings,
    /// Batches started but not yet cleaned up.
    batches: Mutex<Vec<String>>,
}

impl<C: ContainerRuntime> Orchestrator<C> {
    pub fn new(runtime: C, ledger: ResourceLedger, settings: OrchestratorSettings) -> Self {
        Self {
            runtime,
            reporter: NullReporter,
            ledger,
            settings,
            batches: Mutex::new(Vec::new()),
        }
    }
}

impl<C, R> Orchestrator<C, R>
where
    C: ContainerRuntime,
    R: Reporter,
{
    /// Replaces the reporter.
    pub fn with_reporter<R2: Reporter>(self, reporter: R2) -> Orchestrator<C, R2> {
        Orchestrator {
            runtime: self.runtime,
            reporter,
            ledger: self.ledger,
            settings: self.settings,
            batches: self.batches,
        }
    }

    pub fn runtime(&self) -> &C {
        &self.runtime
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Runs every specification and returns one result per specification,
    /// in input order.
    ///
    /// Returns only after every run has finished. Cancelling `token` makes
    /// in-flight stage calls fail with [`FailureCause::Cancelled`] and
    /// queued runs fail at Pull without touching the runtime; containers
    /// created before the cancellation stay visible through
    /// [`RunResult::resource_id`].
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::Cancelled`] if `token` is already cancelled.
    /// - [`OrchestratorError::InvalidSpecification`] if a specification has
    ///   an empty image or a missing or duplicate name.
    ///
    /// An empty batch is not an error and returns an empty vector.
    pub async fn run_all(
        &self,
        token: &CancellationToken,
        specs: &[RunSpecification],
    ) -> Result<Vec<RunResult>, OrchestratorError> {
        if specs.is_empty() {
            return Ok(Vec::new());
        }
        if token.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        validate(specs)?;

        let batch_id = Uuid::new_v4().to_string();
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch_id.clone());
        let pool = WorkerPool::new(self.settings.max_parallel);
        info!(
            "Starting batch {} with {} run(s) on {} ({} in parallel)",
            batch_id,
            specs.len(),
            self.runtime.name(),
            pool.size()
        );

        self.reporter.on_batch_start(specs).await;

        let runs = specs
            .iter()
            .map(|spec| self.run_one(&pool, token, &batch_id, spec));
        let results = join_all(runs).await;

        let failed = results.iter().filter(|r| !r.succeeded()).count();
        info!(
            "Batch {} finished: {} passed, {} failed",
            batch_id,
            results.len() - failed,
            failed
        );
        Ok(results)
    }

    async fn run_one(
        &self,
        pool: &WorkerPool,
        token: &CancellationToken,
        batch_id: &str,
        spec: &RunSpecification,
    ) -> RunResult {
        let slot = select! {
            biased;
            _ = token.cancelled() => None,
            slot = pool.acquire() => slot,
        };

        let result = match slot {
            Some(_slot) => {
                self.reporter.on_run_start(spec).await;
                Workflow::new(
                    &self.runtime,
                    &self.ledger,
                    token,
                    batch_id,
                    self.settings.run_timeout,
                )
                .run(spec)
                .await
            }
            None => {
                warn!("{}: cancelled before it started", spec.name);
                RunResult {
                    spec: spec.clone(),
                    resource_id: None,
                    output: None,
                    outcome: RunOutcome::failed(Stage::Pull, FailureCause::Cancelled),
                    duration: Duration::ZERO,
                }
            }
        };

        self.reporter.on_run_complete(&result).await;
        result
    }

    /// Tears down every container the batch created.
    ///
    /// Besides the containers named by `results`, every container carrying
    /// the label of a batch this orchestrator ran is removed, which reclaims
    /// creates that landed after their call was abandoned.
    ///
    /// Pass a fresh token when the batch token was cancelled, otherwise every
    /// teardown fails immediately.
    pub async fn cleanup(
        &self,
        token: &CancellationToken,
        results: &[RunResult],
    ) -> Vec<CleanupError> {
        let settings = self.settings.cleanup_settings();
        let mut errors =
            cleanup::cleanup(&self.runtime, &self.ledger, token, results, &settings).await;

        let batches = std::mem::take(
            &mut *self.batches.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for batch_id in &batches {
            errors.extend(
                cleanup::reclaim_batch(&self.runtime, token, batch_id, results, &settings).await,
            );
        }
        errors
    }

    /// Builds the batch summary and hands it to the reporter.
    pub async fn finish(
        &self,
        results: &[RunResult],
        cleanup_errors: &[CleanupError],
    ) -> BatchSummary {
        let summary = BatchSummary::from_results(results).with_cleanup_errors(cleanup_errors);
        self.reporter.on_batch_complete(&summary).await;
        summary
    }
}

fn validate(specs: &[RunSpecification]) -> Result<(), OrchestratorError> {
    let mut names = HashSet::new();
    for (index, spec) in specs.iter().enumerate() {
        let reason = if spec.image.trim().is_empty() {
            "image is empty".to_string()
        } else if spec.name.trim().is_empty() {
            "name is empty".to_string()
        } else if !names.insert(spec.name.as_str()) {
            format!("duplicate container name '{}'", spec.name)
        } else {
            continue;
        };
        return Err(OrchestratorError::InvalidSpecification { index, reason });
    }
    Ok(())
}
