//! Docker client module using bollard.
//!
//! This module provides the shared Docker client instance and the
//! [`ContainerRuntime`] implementation backed by it.

use async_trait::async_trait;
use bollard::Docker;
use bollard::query_parameters::{
    InspectContainerOptions, InspectContainerOptionsBuilder, RemoveContainerOptions,
    RemoveContainerOptionsBuilder, RenameContainerOptions, RenameContainerOptionsBuilder,
    StartContainerOptions, StartContainerOptionsBuilder, StopContainerOptions,
    StopContainerOptionsBuilder,
};
use std::sync::OnceLock;

use super::{ContainerRuntime, ContainerState, HealthStatus, RuntimeError, normalize_name};

/// Seconds the engine waits for a graceful stop before killing the container.
const STOP_GRACE_SECONDS: i32 = 10;

static DOCKER_CLIENT: OnceLock<Docker> = OnceLock::new();

/// Get a reference to the shared Docker client.
///
/// This lazily initializes the Docker client on first use.
/// The client connects to Docker using the default connection method
/// (Unix socket on Linux/macOS, named pipe on Windows).
pub fn get_docker() -> Result<&'static Docker, RuntimeError> {
    if let Some(docker) = DOCKER_CLIENT.get() {
        return Ok(docker);
    }
    let docker = Docker::connect_with_local_defaults()
        .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
    Ok(DOCKER_CLIENT.get_or_init(|| docker))
}

/// [`ContainerRuntime`] over the local Docker engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct DockerRuntime;

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let docker = get_docker()?;
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();
        let info = docker.inspect_container(id, Some(options)).await?;

        let state = info.state.unwrap_or_default();
        let health = state
            .health
            .map(|health| health.status.map_or(HealthStatus::None, HealthStatus::from));

        Ok(ContainerState {
            id: info.id.unwrap_or_else(|| id.to_string()),
            name: normalize_name(info.name.as_deref().unwrap_or_default()).to_string(),
            running: state.running.unwrap_or(false),
            health,
        })
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let docker = get_docker()?;
        let options: StartContainerOptions = StartContainerOptionsBuilder::new().build();
        docker.start_container(id, Some(options)).await?;
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        let docker = get_docker()?;
        let options: StopContainerOptions = StopContainerOptionsBuilder::new()
            .t(STOP_GRACE_SECONDS)
            .build();
        docker.stop_container(id, Some(options)).await?;
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let docker = get_docker()?;
        let options: RemoveContainerOptions =
            RemoveContainerOptionsBuilder::new().force(force).build();
        docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn rename(&self, id: &str, new_name: &str) -> Result<(), RuntimeError> {
        let docker = get_docker()?;
        let options: RenameContainerOptions =
            RenameContainerOptionsBuilder::new().name(new_name).build();
        docker.rename_container(id, options).await?;
        Ok(())
    }
}
