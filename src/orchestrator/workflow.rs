//! The per-run stage driver.
//!
//! A [`Workflow`] takes one specification through Pull → Create → Start →
//! Execute. Every runtime call is raced against the batch cancellation token
//! and the run's deadline, so a stuck daemon can hold a run for at most the
//! run timeout.

use std::future::Future;
use std::time::Duration;

use tokio::select;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cleanup::{LedgerEntry, ResourceLedger};
use crate::run::{FailureCause, RunOutcome, RunResult, RunSpecification, Stage, StageFailure};
use crate::runtime::{BATCH_LABEL, ContainerRuntime, CreateRequest, RuntimeResult};

/// Deadline used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Drives a single run against a shared runtime.
pub(crate) struct Workflow<'a, C> {
    runtime: &'a C,
    ledger: &'a ResourceLedger,
    token: &'a CancellationToken,
    batch_id: &'a str,
    timeout: Duration,
    deadline: Instant,
}

impl<'a, C: ContainerRuntime> Workflow<'a, C> {
    /// Creates a workflow whose deadline starts now.
    pub(crate) fn new(
        runtime: &'a C,
        ledger: &'a ResourceLedger,
        token: &'a CancellationToken,
        batch_id: &'a str,
        timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            ledger,
            token,
            batch_id,
            timeout,
            deadline: deadline_after(timeout),
        }
    }

    /// Runs every stage and returns the finished result. Never fails: stage
    /// failures are recorded in the result's outcome.
    pub(crate) async fn run(self, spec: &RunSpecification) -> RunResult {
        let started = std::time::Instant::now();
        let mut result = RunResult {
            spec: spec.clone(),
            resource_id: None,
            output: None,
            outcome: RunOutcome::Succeeded,
            duration: Duration::ZERO,
        };

        if let Err(failure) = self.drive(&mut result).await {
            match &failure.cause {
                FailureCause::TestsFailed { .. } => {
                    info!("{}: {}", result.spec.name, failure);
                }
                _ => warn!("{}: {}", result.spec.name, failure),
            }
            result.outcome = RunOutcome::Failed {
                stage: failure.stage,
                cause: failure.cause,
            };
        } else {
            info!("{}: passed", result.spec.name);
        }

        result.duration = started.elapsed();
        result
    }

    async fn drive(&self, result: &mut RunResult) -> Result<(), StageFailure> {
        let spec = &result.spec;

        debug!("{}: pulling {}", spec.name, spec.image);
        self.guard(Stage::Pull, self.runtime.pull_image(&spec.image))
            .await?;

        let mut request = CreateRequest::new(&spec.name, &spec.image)
            .label(BATCH_LABEL, self.batch_id);
        request.code_path = spec.code_path.clone();
        request.env = spec.env.clone();

        debug!("{}: creating container", spec.name);
        let id = self
            .guard(Stage::Create, self.runtime.create_container(&request))
            .await?;

        // Record the container before anything else can fail.
        result.resource_id = Some(id.clone());
        if let Err(e) = self.ledger.register(LedgerEntry::new(
            &id,
            &spec.name,
            &spec.image,
            self.batch_id,
        )) {
            warn!("{}: failed to persist ledger entry for {}: {}", spec.name, id, e);
        }

        debug!("{}: starting container {}", spec.name, id);
        self.guard(Stage::Start, self.runtime.start_container(&id))
            .await?;

        if spec.test_command.is_empty() {
            debug!("{}: no test command, skipping execute", spec.name);
            return Ok(());
        }

        debug!("{}: executing {:?}", spec.name, spec.test_command);
        let output = self
            .guard(Stage::Execute, self.runtime.exec(&id, &spec.test_command))
            .await?;

        let exit_code = output.exit_code;
        result.output = Some(output);
        if exit_code != 0 {
            return Err(StageFailure {
                stage: Stage::Execute,
                cause: FailureCause::TestsFailed { exit_code },
            });
        }

        Ok(())
    }

    /// Awaits a runtime call unless the batch is cancelled or the deadline
    /// passes first. Losing the race drops the call.
    async fn guard<T>(
        &self,
        stage: Stage,
        call: impl Future<Output = RuntimeResult<T>>,
    ) -> Result<T, StageFailure> {
        let outcome = select! {
            biased;
            _ = self.token.cancelled() => Err(FailureCause::Cancelled),
            res = tokio::time::timeout_at(self.deadline, call) => match res {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(FailureCause::Runtime(e)),
                Err(_) => Err(FailureCause::TimedOut(self.timeout)),
            },
        };
        outcome.map_err(|cause| StageFailure { stage, cause })
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_saturates() {
        let deadline = deadline_after(Duration::from_secs(u64::MAX));
        assert!(deadline > Instant::now() + Duration::from_secs(86400 * 365));

        let short = deadline_after(Duration::from_secs(1));
        assert!(short <= Instant::now() + Duration::from_secs(1));
    }
}
