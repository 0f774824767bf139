//! Recreating a container from its own inspection.
//!
//! Both the self-update launcher and the health monitor's rollback need a copy
//! of an existing container that differs only in its image.

use bollard::models::{
    ContainerCreateBody, ContainerInspectResponse, EndpointSettings, NetworkConnectRequest,
};
use bollard::query_parameters::{CreateContainerOptions, CreateContainerOptionsBuilder};

use super::RuntimeError;
use super::docker::get_docker;

/// Full inspection of a container, as returned by the engine.
pub type ContainerSpec = ContainerInspectResponse;

/// Length of the short id the engine uses for default hostnames and aliases.
const SHORT_ID_LEN: usize = 12;

fn short_id(spec: &ContainerSpec) -> Option<&str> {
    spec.id
        .as_deref()
        .map(|id| &id[..id.len().min(SHORT_ID_LEN)])
}

/// Creation body reproducing `spec` with `image`.
///
/// Values the engine derived from the old container's id (default hostname)
/// are dropped so the new container gets its own.
pub fn create_body(spec: &ContainerSpec, image: &str) -> ContainerCreateBody {
    let config = spec.config.clone().unwrap_or_default();
    let hostname = config
        .hostname
        .filter(|h| Some(h.as_str()) != short_id(spec));

    ContainerCreateBody {
        image: Some(image.to_string()),
        hostname,
        domainname: config.domainname,
        user: config.user,
        exposed_ports: config.exposed_ports,
        tty: config.tty,
        open_stdin: config.open_stdin,
        env: config.env,
        cmd: config.cmd,
        healthcheck: config.healthcheck,
        volumes: config.volumes,
        working_dir: config.working_dir,
        entrypoint: config.entrypoint,
        labels: config.labels,
        stop_signal: config.stop_signal,
        stop_timeout: config.stop_timeout,
        host_config: spec.host_config.clone(),
        ..Default::default()
    }
}

/// Networks the container was attached to besides its network mode. These
/// have to be connected after creation.
pub fn extra_networks(spec: &ContainerSpec) -> Vec<(String, EndpointSettings)> {
    let network_mode = spec
        .host_config
        .as_ref()
        .and_then(|h| h.network_mode.clone());
    let short_id = short_id(spec);

    let mut networks: Vec<(String, EndpointSettings)> = spec
        .network_settings
        .as_ref()
        .and_then(|n| n.networks.clone())
        .unwrap_or_default()
        .into_iter()
        .filter(|(name, _)| Some(name) != network_mode.as_ref())
        .map(|(name, endpoint)| {
            let aliases = endpoint
                .aliases
                .map(|aliases| {
                    aliases
                        .into_iter()
                        .filter(|a| Some(a.as_str()) != short_id)
                        .collect::<Vec<_>>()
                })
                .filter(|aliases| !aliases.is_empty());
            (
                name,
                EndpointSettings {
                    aliases,
                    ..Default::default()
                },
            )
        })
        .collect();
    networks.sort_by(|a, b| a.0.cmp(&b.0));
    networks
}

/// Create a container named `name` from `spec` with `image` and attach its
/// extra networks. Returns the new container id; the container is not started.
pub async fn create_from_spec(
    spec: &ContainerSpec,
    image: &str,
    name: &str,
) -> Result<String, RuntimeError> {
    let docker = get_docker()?;

    let options: CreateContainerOptions = CreateContainerOptionsBuilder::new().name(name).build();
    let created = docker
        .create_container(Some(options), create_body(spec, image))
        .await
        .inspect_err(|e| log::error!("Failed to create container {name} from {image}: {e}"))?;

    for (network, endpoint) in extra_networks(spec) {
        let connect_request = NetworkConnectRequest {
            container: created.id.clone(),
            endpoint_config: Some(endpoint),
        };
        docker
            .connect_network(&network, connect_request)
            .await
            .inspect_err(|e| {
                log::warn!("Failed to connect container {name} to network {network}: {e}");
            })?;
    }

    log::info!("Container {name} created from {image}");
    Ok(created.id)
}
