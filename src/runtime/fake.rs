//! In-memory runtime used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    BATCH_LABEL, ContainerRuntime, CreateRequest, ExecOutput, RuntimeError, RuntimeResult,
};
use crate::run::Stage;

/// Scripted container runtime.
///
/// Failures and delays are keyed by image reference. Every call is recorded
/// so tests can assert on what the orchestrator and cleanup actually did.
///
/// Like a real daemon, create registers the container before its scripted
/// delay, so a create call dropped mid-flight still leaves a container.
#[derive(Default)]
pub struct FakeRuntime {
    failures: HashMap<(String, Stage), RuntimeError>,
    delays: HashMap<(String, Stage), Duration>,
    exit_codes: HashMap<String, i64>,
    remove_failures: HashSet<String>,
    default_delay: Duration,

    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,

    pub pulled: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
}

struct FakeContainer {
    image: String,
    labels: HashMap<String, String>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(mut self, image: &str, stage: Stage, error: RuntimeError) -> Self {
        self.failures.insert((image.to_string(), stage), error);
        self
    }

    pub fn delay(mut self, image: &str, stage: Stage, delay: Duration) -> Self {
        self.delays.insert((image.to_string(), stage), delay);
        self
    }

    /// Delay applied to every stage call that has no specific delay.
    pub fn default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn exit_code(mut self, image: &str, code: i64) -> Self {
        self.exit_codes.insert(image.to_string(), code);
        self
    }

    pub fn fail_remove(mut self, id: &str) -> Self {
        self.remove_failures.insert(id.to_string());
        self
    }

    /// Highest number of stage calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Ids of containers created and not yet removed.
    pub fn live_containers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.containers.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn image_of(&self, id: &str) -> RuntimeResult<String> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .map(|c| c.image.clone())
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))
    }

    async fn stage_call(&self, image: &str, stage: Stage) -> RuntimeResult<()> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let delay = self
            .delays
            .get(&(image.to_string(), stage))
            .copied()
            .unwrap_or(self.default_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match self.failures.get(&(image.to_string(), stage)) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// Decrements the in-flight counter even when the call future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        self.stage_call(image, Stage::Pull).await?;
        self.pulled.lock().unwrap().push(image.to_string());
        Ok(())
    }

    async fn create_container(&self, request: &CreateRequest) -> RuntimeResult<String> {
        let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                image: request.image.clone(),
                labels: request.labels.clone(),
            },
        );

        if let Err(e) = self.stage_call(&request.image, Stage::Create).await {
            self.containers.lock().unwrap().remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        let image = self.image_of(id)?;
        self.stage_call(&image, Stage::Start).await
    }

    async fn exec(&self, id: &str, argv: &[String]) -> RuntimeResult<ExecOutput> {
        let image = self.image_of(id)?;
        self.stage_call(&image, Stage::Execute).await?;
        let exit_code = self.exit_codes.get(&image).copied().unwrap_or(0);
        Ok(ExecOutput {
            exit_code,
            stdout: format!("ran {} on {}\n", argv.join(" "), image),
            stderr: String::new(),
        })
    }

    async fn stop_container(&self, id: &str) -> RuntimeResult<()> {
        self.stopped.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> RuntimeResult<()> {
        if self.remove_failures.contains(id) {
            return Err(RuntimeError::Other(format!("cannot remove {}", id)));
        }
        self.containers.lock().unwrap().remove(id);
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn list_managed_containers(&self) -> RuntimeResult<Vec<String>> {
        Ok(self.live_containers())
    }

    async fn list_batch_containers(&self, batch_id: &str) -> RuntimeResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| c.labels.get(BATCH_LABEL).map(String::as_str) == Some(batch_id))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}
