//! lambda-harness: run a function package's tests against several Lambda
//! runtime images in disposable containers.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Runtime**: container lifecycle behind the [`ContainerRuntime`] trait
//!   (Docker via `bollard`)
//! - **Variant**: turns a variant selection into [`RunSpecification`]s
//! - **Orchestrator**: drives a batch through Pull → Create → Start →
//!   Execute with bounded parallelism, per-run deadlines and cancellation
//! - **Cleanup**: tears down every created container and keeps a ledger of
//!   the ones still outstanding
//! - **Report**: batch summary, console and JUnit XML output
//! - **Analyzer**: client for the external static analyzer
//!
//! # Example
//!
//! ```no_run
//! use lambda_harness::cleanup::ResourceLedger;
//! use lambda_harness::config::load_config_or_default;
//! use lambda_harness::orchestrator::{Orchestrator, OrchestratorSettings};
//! use lambda_harness::runtime::docker::DockerRuntime;
//! use lambda_harness::variant::{build_specifications, resolve_variants};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config_or_default(std::path::Path::new("lth.toml"))?;
//!     let variants = resolve_variants(&["20".to_string()], &config.variants, false)?;
//!     let specs = build_specifications(
//!         &variants,
//!         std::path::Path::new("/work/orders-fn"),
//!         &["npm".to_string(), "test".to_string()],
//!         &[],
//!     );
//!
//!     let orchestrator = Orchestrator::new(
//!         DockerRuntime::new(config.runtime.clone())?,
//!         ResourceLedger::in_memory(),
//!         OrchestratorSettings::from_config(&config.harness),
//!     );
//!     let results = orchestrator.run_all(&CancellationToken::new(), &specs).await?;
//!     orchestrator.cleanup(&CancellationToken::new(), &results).await;
//!     Ok(())
//! }
//! ```

pub mod analyzer;
pub mod cleanup;
pub mod config;
pub mod orchestrator;
pub mod report;
pub mod run;
pub mod runtime;
pub mod variant;

// Re-export commonly used types
pub use config::{Config, load_config, load_config_or_default};
pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorSettings};
pub use report::{BatchSummary, Reporter};
pub use run::{FailureCause, RunOutcome, RunResult, RunSpecification, Stage};
pub use runtime::{ContainerRuntime, RuntimeError};
