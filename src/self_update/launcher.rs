//! Orchestrator side of a self-update.
//!
//! The orchestrator cannot replace its own container and keep running, so it
//! only prepares the swap: the old container is renamed aside, the candidate
//! is created under the original name, and a short-lived controller container
//! is started with the environment contract. From there on the controller
//! owns the operation.

use std::time::Duration;

use async_trait::async_trait;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateContainerOptionsBuilder, InspectContainerOptions,
    InspectContainerOptionsBuilder,
};

use super::env::{AUDIT_LOG_PATH, UpdateOperation};
use crate::config::SelfUpdateSection;
use crate::runtime::docker::{DockerRuntime, get_docker};
use crate::runtime::spec::{ContainerSpec, create_from_spec};
use crate::runtime::{ContainerRef, ContainerRuntime, RuntimeError, normalize_name};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Docker API error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("container {0} has no id")]
    MissingId(String),
}

#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub self_container_name: String,
    pub start_timeout: Duration,
    pub health_timeout: Duration,
    pub poll_interval: Duration,
    pub controller_command: Vec<String>,
    pub docker_socket: String,
    pub audit_log: Option<String>,
}

impl LaunchSettings {
    pub fn new(self_container_name: &str, section: &SelfUpdateSection, audit_log: Option<String>) -> Self {
        Self {
            self_container_name: self_container_name.to_string(),
            start_timeout: Duration::from_millis(section.start_timeout_ms),
            health_timeout: Duration::from_millis(section.health_timeout_ms),
            poll_interval: Duration::from_millis(section.poll_interval_ms),
            controller_command: section.controller_command.clone(),
            docker_socket: section.docker_socket.clone(),
            audit_log,
        }
    }
}

/// Name the old container is moved to while the candidate takes its place.
pub fn parked_name(name: &str, unix_seconds: i64) -> String {
    format!("{name}-old-{unix_seconds}")
}

pub fn controller_name(name: &str, op_id: &str) -> String {
    let short: String = op_id.chars().filter(|c| *c != '-').take(12).collect();
    format!("{name}-self-update-{short}")
}

/// Creation body of the controller container.
///
/// The controller runs from the new image, sees the Docker socket, and gets
/// the old container's binds so paths such as the audit log resolve the same
/// way they do for the orchestrator.
pub fn controller_body(
    settings: &LaunchSettings,
    op: &UpdateOperation,
    image: &str,
    old_binds: &[String],
) -> ContainerCreateBody {
    let mut env = op.to_env();
    if let Some(audit_log) = &settings.audit_log {
        env.push(format!("{AUDIT_LOG_PATH}={audit_log}"));
    }
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        env.push(format!("RUST_LOG={rust_log}"));
    }

    let mut binds = vec![format!("{0}:{0}", settings.docker_socket)];
    binds.extend(
        old_binds
            .iter()
            .filter(|b| !b.starts_with(&format!("{}:", settings.docker_socket)))
            .cloned(),
    );

    ContainerCreateBody {
        image: Some(image.to_string()),
        cmd: Some(settings.controller_command.clone()),
        env: Some(env),
        labels: Some(
            [("drydock.self-update.op".to_string(), op.op_id.clone())]
                .into_iter()
                .collect(),
        ),
        host_config: Some(HostConfig {
            binds: Some(binds),
            auto_remove: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Starts a self-update on behalf of the HTTP surface.
#[async_trait]
pub trait SelfUpdateLaunch: Send + Sync {
    async fn launch(&self, op_id: &str, image: &str) -> Result<UpdateOperation, LaunchError>;
}

pub struct SelfUpdateLauncher {
    settings: LaunchSettings,
    runtime: DockerRuntime,
}

impl SelfUpdateLauncher {
    pub fn new(settings: LaunchSettings) -> Self {
        Self {
            settings,
            runtime: DockerRuntime,
        }
    }

    async fn inspect_spec(&self, name: &str) -> Result<ContainerSpec, RuntimeError> {
        let docker = get_docker()?;
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();
        Ok(docker.inspect_container(name, Some(options)).await?)
    }

    async fn start_controller(
        &self,
        op: &UpdateOperation,
        image: &str,
        spec: &ContainerSpec,
    ) -> Result<(), RuntimeError> {
        let docker = get_docker()?;
        let old_binds = spec
            .host_config
            .as_ref()
            .and_then(|h| h.binds.clone())
            .unwrap_or_default();
        let body = controller_body(&self.settings, op, image, &old_binds);

        let name = controller_name(&op.old.name, &op.op_id);
        let options: CreateContainerOptions =
            CreateContainerOptionsBuilder::new().name(&name).build();
        let created = docker.create_container(Some(options), body).await?;
        self.runtime.start(&created.id).await
    }

    async fn restore_name(&self, op_id: &str, old: &ContainerRef) {
        if let Err(e) = self.runtime.rename(&old.id, &old.name).await {
            log::error!(
                "[self-update:{op_id}] failed to restore name {} on {}: {e}",
                old.name,
                old.id
            );
        }
    }
}

#[async_trait]
impl SelfUpdateLaunch for SelfUpdateLauncher {
    /// Prepare the swap to `image` and hand it to a controller container.
    async fn launch(&self, op_id: &str, image: &str) -> Result<UpdateOperation, LaunchError> {
        let name = &self.settings.self_container_name;
        let spec = self.inspect_spec(name).await?;
        let old_id = spec
            .id
            .clone()
            .ok_or_else(|| LaunchError::MissingId(name.clone()))?;
        let old = ContainerRef::new(old_id, normalize_name(name));

        let parked = parked_name(&old.name, chrono::Utc::now().timestamp());
        log::info!("[self-update:{op_id}] parking {} as {parked}", old.name);
        self.runtime.rename(&old.id, &parked).await?;

        let candidate_id = match create_from_spec(&spec, image, &old.name).await {
            Ok(id) => id,
            Err(e) => {
                self.restore_name(op_id, &old).await;
                return Err(e.into());
            }
        };

        let op = UpdateOperation {
            op_id: op_id.to_string(),
            old,
            candidate_id,
            start_timeout: self.settings.start_timeout,
            health_timeout: self.settings.health_timeout,
            poll_interval: self.settings.poll_interval,
        };

        if let Err(e) = self.start_controller(&op, image, &spec).await {
            log::error!("[self-update:{op_id}] failed to start controller: {e}");
            if let Err(e) = self.runtime.remove(&op.candidate_id, true).await {
                log::warn!("[self-update:{op_id}] failed to remove candidate: {e}");
            }
            self.restore_name(op_id, &op.old).await;
            return Err(e.into());
        }

        log::info!(
            "[self-update:{op_id}] controller started for candidate {}",
            op.candidate_id
        );
        Ok(op)
    }
}
