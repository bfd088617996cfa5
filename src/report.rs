//! Batch reporting.
//!
//! Reporters observe a batch as it runs: the orchestrator calls
//! [`Reporter::on_run_start`] and [`Reporter::on_run_complete`] from inside
//! each workflow, and [`Reporter::on_batch_complete`] once cleanup has
//! finished and the [`BatchSummary`] is final.

pub mod junit;
pub mod summary;

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};

use crate::run::{RunResult, RunSpecification};

pub use junit::JUnitReporter;
pub use summary::{BatchSummary, RunStatus, RunSummary, StageCounts};

/// Receives events while a batch runs.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once before any run starts.
    async fn on_batch_start(&self, specs: &[RunSpecification]);

    /// Called when a run acquires its slot and begins pulling.
    async fn on_run_start(&self, spec: &RunSpecification);

    /// Called when a run's workflow returns.
    async fn on_run_complete(&self, result: &RunResult);

    /// Called after cleanup with the final summary.
    async fn on_batch_complete(&self, summary: &BatchSummary);
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_batch_start(&self, _specs: &[RunSpecification]) {}
    async fn on_run_start(&self, _spec: &RunSpecification) {}
    async fn on_run_complete(&self, _result: &RunResult) {}
    async fn on_batch_complete(&self, _summary: &BatchSummary) {}
}

/// Forwards every event to each of its reporters in turn.
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_batch_start(&self, specs: &[RunSpecification]) {
        for reporter in &self.reporters {
            reporter.on_batch_start(specs).await;
        }
    }

    async fn on_run_start(&self, spec: &RunSpecification) {
        for reporter in &self.reporters {
            reporter.on_run_start(spec).await;
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        for reporter in &self.reporters {
            reporter.on_run_complete(result).await;
        }
    }

    async fn on_batch_complete(&self, summary: &BatchSummary) {
        for reporter in &self.reporters {
            reporter.on_batch_complete(summary).await;
        }
    }
}

/// Progress bar while the batch runs, then a per-variant table.
pub struct ConsoleReporter {
    progress: Mutex<Option<ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn with_progress(&self, f: impl FnOnce(&ProgressBar)) {
        let guard = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pb) = guard.as_ref() {
            f(pb);
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_batch_start(&self, specs: &[RunSpecification]) {
        println!("Testing {} variant(s)", specs.len());

        let pb = ProgressBar::new(specs.len() as u64);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        pb.set_style(style);

        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = Some(pb);
    }

    async fn on_run_start(&self, spec: &RunSpecification) {
        if self.verbose {
            self.with_progress(|pb| pb.println(format!("Starting {} ({})", spec.variant, spec.image)));
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        self.with_progress(|pb| {
            pb.inc(1);
            let line = match result.outcome.failure() {
                None => format!("{} {}", console::style("PASS").green(), result.spec.variant),
                Some(failure) => format!(
                    "{} {}  {}",
                    console::style("FAIL").red(),
                    result.spec.variant,
                    console::style(failure).dim()
                ),
            };
            pb.println(line);
        });
    }

    async fn on_batch_complete(&self, summary: &BatchSummary) {
        if let Some(pb) = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pb.finish_and_clear();
        }
        print_summary(summary, self.verbose);
    }
}

/// Prints a batch summary to stdout.
pub fn print_summary(summary: &BatchSummary, verbose: bool) {
    println!();
    println!("Results:");
    for run in &summary.runs {
        let status = if run.passed() {
            console::style("PASS").green()
        } else if run.tests_failed() {
            console::style("FAIL").red()
        } else {
            console::style("ERR ").red().bold()
        };
        let detail = run.message.as_deref().unwrap_or("");
        println!(
            "  {} {:<14} {:>8.1}s  {}",
            status,
            run.variant,
            run.duration.as_secs_f64(),
            console::style(detail).dim()
        );
    }

    println!();
    println!("  Total:     {}", summary.total);
    println!("  Succeeded: {}", console::style(summary.succeeded).green());
    println!("  Failed:    {}", console::style(summary.failed).red());
    if summary.failed > 0 {
        let counts = &summary.failed_by_stage;
        println!(
            "    pull: {}  create: {}  start: {}  execute: {}",
            counts.pull, counts.create, counts.start, counts.execute
        );
    }

    for run in summary.runs.iter().filter(|r| !r.passed()) {
        if !verbose && !run.tests_failed() {
            continue;
        }
        for (label, text) in [("stdout", &run.stdout), ("stderr", &run.stderr)] {
            let Some(text) = text.as_deref().filter(|t| !t.trim().is_empty()) else {
                continue;
            };
            println!();
            println!("  {} {}:", console::style(&run.variant).bold(), label);
            for line in text.lines() {
                println!("    {}", line);
            }
        }
    }

    if !summary.cleanup_errors.is_empty() {
        println!();
        println!(
            "{}",
            console::style("Some containers could not be removed (run `lth sweep`):").yellow()
        );
        for err in &summary.cleanup_errors {
            println!("  - {}", err);
        }
    }

    println!();
    if summary.success() {
        println!("{}", console::style("All variants passed!").green().bold());
    } else {
        println!("{}", console::style("Some variants failed.").red().bold());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::run::RunOutcome;

    #[derive(Clone, Default)]
    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Reporter for Counting {
        async fn on_batch_start(&self, _specs: &[RunSpecification]) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_run_start(&self, _spec: &RunSpecification) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_run_complete(&self, _result: &RunResult) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_batch_complete(&self, _summary: &BatchSummary) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_multi_reporter_forwards_to_all() {
        let a = Counting::default();
        let b = Counting::default();
        let multi = MultiReporter::new()
            .with_reporter(a.clone())
            .with_reporter(b.clone())
            .with_reporter(NullReporter);
        assert_eq!(multi.len(), 3);

        let spec = RunSpecification::new("img", "lth-img-0");
        let result = RunResult {
            spec: spec.clone(),
            resource_id: None,
            output: None,
            outcome: RunOutcome::Succeeded,
            duration: Duration::ZERO,
        };

        multi.on_batch_start(std::slice::from_ref(&spec)).await;
        multi.on_run_start(&spec).await;
        multi.on_run_complete(&result).await;
        multi
            .on_batch_complete(&BatchSummary::from_results(&[result]))
            .await;

        assert_eq!(a.0.load(Ordering::SeqCst), 4);
        assert_eq!(b.0.load(Ordering::SeqCst), 4);
    }
}
