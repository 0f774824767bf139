//! Capabilities the health monitor borrows to undo an update.
//!
//! The monitor decides *when* a container is rolled back. How a container is
//! found, torn down and rebuilt belongs to whoever deployed it, and is handed
//! in through [`ContainerLifecycle`].

use async_trait::async_trait;
use bollard::query_parameters::{InspectContainerOptions, InspectContainerOptionsBuilder};

use crate::runtime::docker::{DockerRuntime, get_docker};
use crate::runtime::spec::{ContainerSpec, create_from_spec};
use crate::runtime::{ContainerRef, ContainerRuntime, RuntimeError, Transition, is_already_in_state};

/// A live container found by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
}

#[async_trait]
pub trait ContainerLifecycle: Send + Sync {
    async fn current_container(
        &self,
        container: &ContainerRef,
    ) -> Result<Option<ContainerHandle>, RuntimeError>;

    async fn inspect_container(&self, handle: &ContainerHandle) -> Result<ContainerSpec, RuntimeError>;

    async fn stop_and_remove_container(
        &self,
        handle: &ContainerHandle,
        spec: &ContainerSpec,
        container: &ContainerRef,
    ) -> Result<(), RuntimeError>;

    async fn recreate_container(
        &self,
        spec: &ContainerSpec,
        image: &str,
        container: &ContainerRef,
    ) -> Result<(), RuntimeError>;
}

/// Lifecycle of plain Docker containers: recreate from the inspected spec.
#[derive(Debug, Clone, Copy, Default)]
pub struct DockerLifecycle {
    runtime: DockerRuntime,
}

#[async_trait]
impl ContainerLifecycle for DockerLifecycle {
    async fn current_container(
        &self,
        container: &ContainerRef,
    ) -> Result<Option<ContainerHandle>, RuntimeError> {
        match self.runtime.inspect(&container.name).await {
            Ok(state) => Ok(Some(ContainerHandle { id: state.id })),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn inspect_container(&self, handle: &ContainerHandle) -> Result<ContainerSpec, RuntimeError> {
        let docker = get_docker()?;
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();
        Ok(docker.inspect_container(&handle.id, Some(options)).await?)
    }

    async fn stop_and_remove_container(
        &self,
        handle: &ContainerHandle,
        _spec: &ContainerSpec,
        container: &ContainerRef,
    ) -> Result<(), RuntimeError> {
        log::info!("Stopping container {}", container.name);
        match self.runtime.stop(&handle.id).await {
            Ok(()) => {}
            Err(e) if is_already_in_state(&e, Transition::Stop) => {
                log::info!("Container {} already stopped", container.name);
            }
            Err(e) if e.is_not_found() => {
                log::warn!("Container {} not found, skipping stop", container.name);
            }
            Err(e) => return Err(e),
        }

        match self.runtime.remove(&handle.id, true).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                log::info!("Container {} not found, skipping removal", container.name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn recreate_container(
        &self,
        spec: &ContainerSpec,
        image: &str,
        container: &ContainerRef,
    ) -> Result<(), RuntimeError> {
        let id = create_from_spec(spec, image, &container.name).await?;
        self.runtime.start(&id).await?;
        log::info!("Container {} recreated from {image}", container.name);
        Ok(())
    }
}
