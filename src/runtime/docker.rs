//! Docker container runtime implementation.
//!
//! Talks to the Docker Engine API through `bollard`. Each run gets a container
//! that idles on a keep-alive entrypoint while the test command is executed
//! inside it with `docker exec`.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use futures::StreamExt;
use tracing::debug;

use super::{
    BATCH_LABEL, ContainerRuntime, CreateRequest, ExecOutput, MANAGED_LABEL, RuntimeError,
    RuntimeResult,
};
use crate::config::RuntimeConfig;

/// Seconds Docker waits after SIGTERM before killing a container on stop.
const STOP_GRACE_SECS: i64 = 5;

/// Docker-backed [`ContainerRuntime`].
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    config: RuntimeConfig,
}

impl DockerRuntime {
    /// Connects to the daemon named in `config.docker_host`, or to the local
    /// socket when none is configured.
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        let docker = if let Some(host) = &config.docker_host {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| RuntimeError::Connection(e.to_string()))?
        } else {
            Docker::connect_with_local_defaults()
                .map_err(|e| RuntimeError::Connection(e.to_string()))?
        };

        Ok(Self { docker, config })
    }

    fn container_config(&self, request: &CreateRequest) -> ContainerConfig<String> {
        let mut env: Vec<String> = self
            .config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.extend(request.env.iter().map(|(k, v)| format!("{}={}", k, v)));

        let binds = request
            .code_path
            .as_ref()
            .map(|path| vec![format!("{}:{}:ro", path.display(), self.config.code_mount)]);

        let host_config = bollard::models::HostConfig {
            binds,
            network_mode: Some(self.config.network_mode.clone()),
            ..Default::default()
        };

        let mut labels = request.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        ContainerConfig {
            image: Some(request.image.clone()),
            env: Some(env),
            working_dir: Some(self.config.code_mount.clone()),
            // Overriding the entrypoint also drops the image's default CMD.
            entrypoint: Some(self.config.keep_alive.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            tty: Some(false),
            ..Default::default()
        }
    }

    /// Ids of all containers, running or not, matching a `key=value` label.
    async fn list_labelled(&self, label: String) -> RuntimeResult<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.clone()]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| classify(e, &label))?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        let (from_image, tag) = split_image_reference(image);
        debug!("Pulling {}:{}", from_image, tag);

        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };

        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(item) = progress.next().await {
            item.map_err(|e| classify(e, image))?;
        }

        Ok(())
    }

    async fn create_container(&self, request: &CreateRequest) -> RuntimeResult<String> {
        let options = CreateContainerOptions {
            name: request.name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), self.container_config(request))
            .await
            .map_err(|e| classify(e, &request.name))?;

        for warning in &response.warnings {
            debug!("Docker warning for {}: {}", request.name, warning);
        }

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify(e, id))
    }

    async fn exec(&self, id: &str, argv: &[String]) -> RuntimeResult<ExecOutput> {
        let exec_options = CreateExecOptions {
            cmd: Some(argv.to_vec()),
            working_dir: Some(self.config.code_mount.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_options)
            .await
            .map_err(|e| classify(e, id))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| classify(e, id))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(msg) = output.next().await {
                match msg.map_err(|e| classify(e, id))? {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdIn { .. } => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| classify(e, id))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn stop_container(&self, id: &str) -> RuntimeResult<()> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: already gone
            Err(BollardError::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(e) => Err(classify(e, id)),
        }
    }

    async fn remove_container(&self, id: &str) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(classify(e, id)),
        }
    }

    async fn list_managed_containers(&self) -> RuntimeResult<Vec<String>> {
        self.list_labelled(format!("{}=true", MANAGED_LABEL)).await
    }

    async fn list_batch_containers(&self, batch_id: &str) -> RuntimeResult<Vec<String>> {
        self.list_labelled(format!("{}={}", BATCH_LABEL, batch_id)).await
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

/// Maps a bollard error onto the runtime error taxonomy.
///
/// `subject` names the image or container the failing call was about.
fn classify(err: BollardError, subject: &str) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 if message.contains("image") || message.contains("manifest") => {
                RuntimeError::ImageNotFound(format!("{}: {}", subject, message))
            }
            404 => RuntimeError::ContainerNotFound(format!("{}: {}", subject, message)),
            401 | 403 => RuntimeError::Unauthorized(format!("{}: {}", subject, message)),
            // Docker also answers 409 for exec or stop on a stopped container.
            409 if message.contains("already in use") => {
                RuntimeError::NameConflict(format!("{}: {}", subject, message))
            }
            _ => RuntimeError::Other(format!("{} ({}): {}", subject, status_code, message)),
        },
        BollardError::DockerStreamError { error } => classify_message(subject, &error),
        e @ (BollardError::IOError { .. }
        | BollardError::RequestTimeoutError
        | BollardError::HyperResponseError { .. }
        | BollardError::HyperLegacyError { .. }
        | BollardError::SocketNotFoundError(_)) => {
            RuntimeError::Connection(format!("{}: {}", subject, e))
        }
        e => RuntimeError::Other(format!("{}: {}", subject, e)),
    }
}

/// Classifies a free-form error message reported inside a progress stream.
fn classify_message(subject: &str, message: &str) -> RuntimeError {
    let lower = message.to_lowercase();
    let detail = format!("{}: {}", subject, message);

    if lower.contains("not found") || lower.contains("manifest unknown") {
        RuntimeError::ImageNotFound(detail)
    } else if lower.contains("unauthorized")
        || lower.contains("denied")
        || lower.contains("authentication required")
    {
        RuntimeError::Unauthorized(detail)
    } else if lower.contains("timeout") || lower.contains("connection") {
        RuntimeError::Connection(detail)
    } else {
        RuntimeError::Other(detail)
    }
}

/// Splits an image reference into the `fromImage` and `tag` query values the
/// Engine API expects.
///
/// A missing tag defaults to `latest`. Digest references keep the digest as
/// the tag. A colon in the registry host (a port) is not a tag separator.
pub fn split_image_reference(image: &str) -> (String, String) {
    if let Some((repo, digest)) = image.split_once('@') {
        return (repo.to_string(), digest.to_string());
    }

    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (image[..split].to_string(), image[split + 1..].to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}
