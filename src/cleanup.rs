//! Teardown of provisioned containers.
//!
//! [`cleanup`] walks a finished batch and removes every container a run
//! created, whatever the run's outcome: passing runs need teardown as much as
//! failing ones. What is done per container follows the stage the run
//! reached (see [`RunResult::teardown`]):
//!
//! | Outcome | Action |
//! |---------|--------|
//! | Failed at Pull / Create | nothing (no container) |
//! | Failed at Start | remove |
//! | Failed at Execute, Succeeded | stop, then remove |
//!
//! Failures are collected as [`CleanupError`]s and never change a run's
//! recorded outcome.
//!
//! [`reclaim_batch`] catches what the results cannot name: a create call
//! dropped by cancellation or a deadline may still land on the daemon, so the
//! batch label is listed and every container it finds that no result refers
//! to is removed.
//!
//! [`sweep`] is the crash-recovery counterpart: it removes every container
//! recorded in the ledger and every container carrying the managed label.

pub mod ledger;

pub use ledger::{LedgerEntry, LedgerError, ResourceLedger};

use std::collections::HashSet;
use std::time::Duration;

use futures::future::join_all;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestrator::WorkerPool;
use crate::run::{FailureCause, RunResult, Teardown};
use crate::runtime::ContainerRuntime;

/// A container that could not be removed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to remove {name} ({resource_id}): {cause}")]
pub struct CleanupError {
    pub name: String,
    pub resource_id: String,
    pub cause: FailureCause,
}

/// Limits applied to teardown.
#[derive(Debug, Clone)]
pub struct CleanupSettings {
    /// Containers torn down concurrently.
    pub max_parallel: usize,

    /// Ceiling per container.
    pub timeout: Duration,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Tears down every container referenced by `results`.
///
/// Returns one error per container that could not be removed, in result
/// order. Successfully removed containers are released from `ledger`.
pub async fn cleanup<C: ContainerRuntime>(
    runtime: &C,
    ledger: &ResourceLedger,
    token: &CancellationToken,
    results: &[RunResult],
    settings: &CleanupSettings,
) -> Vec<CleanupError> {
    let pool = WorkerPool::new(settings.max_parallel);

    let attempts = results.iter().filter_map(|result| {
        let action = result.teardown();
        let id = result.resource_id.as_deref()?;
        if action == Teardown::Nothing {
            return None;
        }
        let name = result.spec.name.as_str();
        let pool = &pool;

        Some(async move {
            let _slot = pool.acquire().await;
            debug!("Tearing down {} ({}): {:?}", name, id, action);
            match teardown_one(runtime, id, action, settings.timeout, token).await {
                Ok(()) => {
                    if let Err(e) = ledger.release(id) {
                        warn!("Failed to update ledger after removing {}: {}", id, e);
                    }
                    None
                }
                Err(cause) => {
                    warn!("Failed to remove {} ({}): {}", name, id, cause);
                    Some(CleanupError {
                        name: name.to_string(),
                        resource_id: id.to_string(),
                        cause,
                    })
                }
            }
        })
    });

    let errors: Vec<CleanupError> = join_all(attempts).await.into_iter().flatten().collect();

    info!(
        "Cleanup finished for {} result(s), {} error(s)",
        results.len(),
        errors.len()
    );
    errors
}

/// Removes containers labelled with `batch_id` that no result refers to.
///
/// Only containers of this batch are touched, so a concurrent batch is left
/// alone. A failure to list the batch is returned as a single error against
/// the batch id.
pub async fn reclaim_batch<C: ContainerRuntime>(
    runtime: &C,
    token: &CancellationToken,
    batch_id: &str,
    results: &[RunResult],
    settings: &CleanupSettings,
) -> Vec<CleanupError> {
    let listed = select! {
        biased;
        _ = token.cancelled() => Err(FailureCause::Cancelled),
        res = tokio::time::timeout(settings.timeout, runtime.list_batch_containers(batch_id)) => {
            match res {
                Ok(Ok(ids)) => Ok(ids),
                Ok(Err(e)) => Err(FailureCause::Runtime(e)),
                Err(_) => Err(FailureCause::TimedOut(settings.timeout)),
            }
        }
    };

    let ids = match listed {
        Ok(ids) => ids,
        Err(cause) => {
            warn!("Failed to list containers of batch {}: {}", batch_id, cause);
            return vec![CleanupError {
                name: batch_id.to_string(),
                resource_id: batch_id.to_string(),
                cause,
            }];
        }
    };

    let known: HashSet<&str> = results
        .iter()
        .filter_map(|r| r.resource_id.as_deref())
        .collect();
    let untracked: Vec<String> = ids
        .into_iter()
        .filter(|id| !known.contains(id.as_str()))
        .collect();
    if untracked.is_empty() {
        return Vec::new();
    }

    info!(
        "Removing {} untracked container(s) of batch {}",
        untracked.len(),
        batch_id
    );

    let pool = WorkerPool::new(settings.max_parallel);
    let attempts = untracked.iter().map(|id| {
        let pool = &pool;
        async move {
            let _slot = pool.acquire().await;
            teardown_one(runtime, id, Teardown::Remove, settings.timeout, token)
                .await
                .err()
                .map(|cause| {
                    warn!("Failed to remove untracked container {}: {}", id, cause);
                    CleanupError {
                        name: id.clone(),
                        resource_id: id.clone(),
                        cause,
                    }
                })
        }
    });

    join_all(attempts).await.into_iter().flatten().collect()
}

/// What [`sweep`] removed and what it could not.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub removed: Vec<String>,
    pub errors: Vec<CleanupError>,
}

/// Removes every container recorded in `ledger` and every container the
/// runtime reports as managed by this tool.
///
/// Used to recover from a process that died between Create and cleanup.
/// A failure to list managed containers is logged and the ledger entries
/// are still swept.
pub async fn sweep<C: ContainerRuntime>(
    runtime: &C,
    ledger: &ResourceLedger,
    token: &CancellationToken,
    settings: &CleanupSettings,
) -> SweepReport {
    let mut targets: Vec<(String, String)> = ledger
        .entries()
        .into_iter()
        .map(|e| (e.resource_id, e.name))
        .collect();

    match runtime.list_managed_containers().await {
        Ok(ids) => {
            let known: HashSet<String> = targets.iter().map(|(id, _)| id.clone()).collect();
            targets.extend(
                ids.into_iter()
                    .filter(|id| !known.contains(id))
                    .map(|id| (id.clone(), id)),
            );
        }
        Err(e) => warn!("Failed to list managed containers: {}", e),
    }

    let mut report = SweepReport::default();
    for (id, name) in targets {
        match teardown_one(runtime, &id, Teardown::Remove, settings.timeout, token).await {
            Ok(()) => {
                if let Err(e) = ledger.release(&id) {
                    warn!("Failed to update ledger after removing {}: {}", id, e);
                }
                info!("Removed {} ({})", name, id);
                report.removed.push(id);
            }
            Err(cause) => report.errors.push(CleanupError {
                name,
                resource_id: id,
                cause,
            }),
        }
    }
    report
}

async fn teardown_one<C: ContainerRuntime>(
    runtime: &C,
    id: &str,
    action: Teardown,
    timeout: Duration,
    token: &CancellationToken,
) -> Result<(), FailureCause> {
    let call = async {
        match action {
            Teardown::Nothing => Ok(()),
            Teardown::Remove => runtime.remove_container(id).await,
            Teardown::StopAndRemove => runtime.stop_and_remove(id).await,
        }
    };

    select! {
        biased;
        _ = token.cancelled() => Err(FailureCause::Cancelled),
        res = tokio::time::timeout(timeout, call) => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(FailureCause::Runtime(e)),
            Err(_) => Err(FailureCause::TimedOut(timeout)),
        },
    }
}
