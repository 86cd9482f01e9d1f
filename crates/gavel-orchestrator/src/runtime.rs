//! Container runtime abstraction.
//!
//! The worker manager drives containers through [`ContainerRuntime`]; the
//! production implementation wraps the Docker daemon via bollard, tests
//! substitute a fake.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use gavel_core::{GavelError, GavelResult};
use std::collections::HashMap;
use tracing::debug;

/// Everything needed to launch one worker container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    /// Command passed to the image entrypoint.
    pub cmd: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Operations the worker manager needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Ids of all containers (running or exited) carrying the given label.
    async fn list_labeled(&self, label: &str, value: &str) -> GavelResult<Vec<String>>;

    /// Create a container and return its id.
    async fn create(&self, spec: &ContainerSpec) -> GavelResult<String>;

    /// Start a created container.
    async fn start(&self, id: &str) -> GavelResult<()>;

    /// Block until the container exits; returns its exit code.
    async fn wait(&self, id: &str) -> GavelResult<i64>;

    /// The last `lines` lines of combined stdout/stderr.
    async fn tail_logs(&self, id: &str, lines: usize) -> GavelResult<String>;

    /// Force-remove a container.
    async fn remove(&self, id: &str) -> GavelResult<()>;

    /// Digest of a local image, for audit fields.
    async fn image_id(&self, image: &str) -> GavelResult<String>;
}

fn runtime_err(e: bollard::errors::Error) -> GavelError {
    GavelError::Runtime(e.to_string())
}

/// Production runtime over the local Docker daemon.
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon and verify it answers a ping.
    pub async fn connect() -> GavelResult<Self> {
        let client = Docker::connect_with_local_defaults().map_err(runtime_err)?;
        client.ping().await.map_err(runtime_err)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_labeled(&self, label: &str, value: &str) -> GavelResult<Vec<String>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{label}={value}")],
        )]);
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(runtime_err)?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn create(&self, spec: &ContainerSpec) -> GavelResult<String> {
        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            cmd: Some(spec.cmd.clone()),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        };
        let created = self
            .client
            .create_container::<String, String>(None, config)
            .await
            .map_err(runtime_err)?;
        debug!(container_id = %created.id, image = %spec.image, "container created");
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> GavelResult<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(runtime_err)
    }

    async fn wait(&self, id: &str) -> GavelResult<i64> {
        let mut stream = self
            .client
            .wait_container(id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(e)) => Err(runtime_err(e)),
            None => Err(GavelError::Runtime(format!(
                "wait stream for container {id} ended without a status"
            ))),
        }
    }

    async fn tail_logs(&self, id: &str, lines: usize) -> GavelResult<String> {
        let mut stream = self.client.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: lines.to_string(),
                ..Default::default()
            }),
        );
        let mut combined = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(runtime_err)? {
                LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
                    combined.push_str(&String::from_utf8_lossy(&message));
                }
                _ => {}
            }
        }
        Ok(combined)
    }

    async fn remove(&self, id: &str) -> GavelResult<()> {
        self.client
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(runtime_err)
    }

    async fn image_id(&self, image: &str) -> GavelResult<String> {
        let inspect = self.client.inspect_image(image).await.map_err(runtime_err)?;
        inspect
            .id
            .ok_or_else(|| GavelError::Runtime(format!("image {image} has no id")))
    }
}
