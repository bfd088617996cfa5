//! Container runtime capability consumed by the orchestrator.
//!
//! The orchestrator never talks to a container engine directly. It drives
//! every run through the [`ContainerRuntime`] trait, which exposes exactly the
//! lifecycle operations a run needs:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ContainerRuntime                         │
//! │                                                              │
//! │  pull_image(image)                                           │
//! │  create_container(CreateRequest) ──────► container id        │
//! │  start_container(id)                                         │
//! │  exec(id, argv) ───────────────────────► ExecOutput          │
//! │  stop_container(id) / remove_container(id)                   │
//! │  list_managed_containers() ────────────► Vec<container id>   │
//! │  list_batch_containers(batch_id) ──────► Vec<container id>   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Runtimes
//!
//! | Runtime | Module | Description |
//! |---------|--------|-------------|
//! | Docker | [`docker`] | Docker Engine API via `bollard` |
//!
//! # Cancellation
//!
//! Runtime methods take no cancellation handle. Callers race each call
//! against their own cancellation token and deadline; dropping the returned
//! future abandons the request. Implementations must therefore not rely on
//! running to completion for correctness.

pub mod docker;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors reported by a container runtime.
///
/// Variants are coarse on purpose: the orchestrator only needs enough detail
/// to classify which stage failed and why, and to tell a name collision apart
/// from other create failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// The requested image does not exist in the registry.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// The registry or daemon rejected our credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The daemon or registry could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// A container with the requested name already exists.
    ///
    /// Usually a leftover from an earlier run that was never cleaned up.
    /// `lth sweep` removes such containers.
    #[error("container name already in use: {0}")]
    NameConflict(String),

    /// The container no longer exists.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Anything the runtime reported that does not fit the other variants.
    #[error("{0}")]
    Other(String),
}

/// Everything needed to create one container.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Container name. Must already satisfy the runtime's naming rules.
    pub name: String,

    /// Image reference the container is created from.
    pub image: String,

    /// Host directory mounted read-only into the container, if any.
    pub code_path: Option<PathBuf>,

    /// Environment variables, as key-value pairs.
    pub env: Vec<(String, String)>,

    /// Labels attached to the container.
    pub labels: HashMap<String, String>,
}

impl CreateRequest {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            code_path: None,
            env: Vec::new(),
            labels: HashMap::new(),
        }
    }

    pub fn code_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.code_path = Some(path.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Captured result of a command executed inside a container.
///
/// A command that runs and exits non-zero is NOT a runtime error; it is
/// reported here and judged by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Exit code of the command (-1 if the runtime could not report one).
    pub exit_code: i64,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,
}

impl ExecOutput {
    /// Returns `true` if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The container lifecycle operations a run depends on.
///
/// Implementations are shared by reference across every concurrent run of a
/// batch, so all methods take `&self`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Makes `image` available locally. Pulling an image that is already
    /// present is a no-op.
    async fn pull_image(&self, image: &str) -> RuntimeResult<()>;

    /// Creates (but does not start) a container and returns its id.
    async fn create_container(&self, request: &CreateRequest) -> RuntimeResult<String>;

    /// Starts a created container.
    async fn start_container(&self, id: &str) -> RuntimeResult<()>;

    /// Runs `argv` inside a started container and collects its output.
    async fn exec(&self, id: &str, argv: &[String]) -> RuntimeResult<ExecOutput>;

    /// Stops a running container. Stopping a container that is not running
    /// succeeds.
    async fn stop_container(&self, id: &str) -> RuntimeResult<()>;

    /// Removes a container. Removing a container that no longer exists
    /// succeeds.
    async fn remove_container(&self, id: &str) -> RuntimeResult<()>;

    /// Lists the ids of every container this tool created, running or not.
    async fn list_managed_containers(&self) -> RuntimeResult<Vec<String>>;

    /// Lists the ids of every container labelled with `batch_id`, including
    /// containers whose create call was abandoned after the daemon accepted
    /// it.
    async fn list_batch_containers(&self, batch_id: &str) -> RuntimeResult<Vec<String>>;

    /// Stops then removes a container.
    async fn stop_and_remove(&self, id: &str) -> RuntimeResult<()> {
        self.stop_container(id).await?;
        self.remove_container(id).await
    }

    /// Short name used in log output.
    fn name(&self) -> &'static str;
}

/// Label marking every container created by this tool.
pub const MANAGED_LABEL: &str = "lth.managed";

/// Label carrying the id of the batch that created a container.
pub const BATCH_LABEL: &str = "lth.batch";
