//! Docker implementation of [`ContainerPlatform`].
//!
//! Containers run through `testcontainers`; networks are managed directly
//! through `bollard` so a network can be adopted, kept across runs, and
//! removed only once every container on it is gone.

use std::collections::BTreeMap;
use std::time::Duration;

use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use stackup::probe::wait_for_port;
use stackup::{
    ContainerPlatform, ContainerSpec, LogStream, NetworkAlias, NetworkHandle, NetworkSpec,
    PollPolicy, PortBinding, ProvisioningError, SetupError, StartedContainer, StartupTimeoutError,
    WaitStrategy,
};
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Headroom granted to the engine-side readiness wait over the caller's own
/// startup budget, so the caller's timeout is the one that fires.
const ENGINE_WAIT_HEADROOM: Duration = Duration::from_secs(30);

const NETWORK_DRIVER: &str = "bridge";

/// The Docker engine could not be reached.
#[derive(Debug, Error)]
pub enum DockerPlatformError {
    /// No engine answered on the configured socket.
    #[error("failed to connect to the Docker engine")]
    Connect(#[source] bollard::errors::Error),
}

/// [`ContainerPlatform`] backed by the local Docker engine.
#[derive(Debug, Clone)]
pub struct DockerPlatform {
    docker: Docker,
}

impl DockerPlatform {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> Result<Self, DockerPlatformError> {
        let docker = Docker::connect_with_local_defaults().map_err(DockerPlatformError::Connect)?;
        Ok(Self { docker })
    }

    async fn network_exists(&self, spec: &NetworkSpec) -> Result<bool, ProvisioningError> {
        match self
            .docker
            .inspect_network(spec.name.as_str(), None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => Ok(true),
            Err(error) if is_not_found(&error) => Ok(false),
            Err(error) => Err(ProvisioningError::Network {
                network: spec.name.clone(),
                detail: error.to_string(),
            }),
        }
    }
}

impl ContainerPlatform for DockerPlatform {
    type Handle = ContainerAsync<GenericImage>;

    #[instrument(name = "docker.create_network", skip_all, fields(network = %spec.name))]
    async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkHandle, ProvisioningError> {
        if self.network_exists(spec).await? {
            if spec.reuse {
                info!("[docker.create_network] adopting existing network");
                return Ok(NetworkHandle::adopted(spec));
            }
            return Err(ProvisioningError::Network {
                network: spec.name.clone(),
                detail: "a network with this name already exists and reuse is off".to_string(),
            });
        }

        let options = CreateNetworkOptions {
            name: spec.name.as_str(),
            driver: NETWORK_DRIVER,
            check_duplicate: true,
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map_err(|error| ProvisioningError::Network {
                network: spec.name.clone(),
                detail: error.to_string(),
            })?;

        Ok(NetworkHandle::created(spec))
    }

    #[instrument(name = "docker.remove_network", skip_all, fields(network = %network.name()))]
    async fn remove_network(&self, network: &NetworkHandle) -> Result<(), ProvisioningError> {
        self.docker
            .remove_network(network.name().as_str())
            .await
            .map_err(|error| ProvisioningError::Disposal {
                resource: network.name().to_string(),
                detail: error.to_string(),
            })
    }

    #[instrument(
        name = "docker.start_container",
        skip_all,
        fields(alias = %spec.alias, image = %spec.image, kind = %spec.kind)
    )]
    async fn start_container(
        &self,
        network: &NetworkHandle,
        spec: &ContainerSpec,
    ) -> Result<StartedContainer<Self::Handle>, SetupError> {
        let container = container_request(network, spec)
            .start()
            .await
            .map_err(|error| ProvisioningError::ContainerStart {
                alias: spec.alias.clone(),
                image: spec.image.clone(),
                detail: error.to_string(),
            })?;

        let host = container
            .get_host()
            .await
            .map_err(|error| start_failure(spec, &error))?
            .to_string();

        let mut ports = BTreeMap::new();
        for binding in &spec.ports {
            let internal = binding.internal();
            let mapped = container
                .get_host_port_ipv4(ContainerPort::Tcp(internal))
                .await
                .map_err(|error| start_failure(spec, &error))?;
            let _ = ports.insert(internal, mapped);
        }

        if let WaitStrategy::PortOpen(internal) = spec.wait {
            let mapped = ports
                .get(&internal)
                .copied()
                .ok_or_else(|| ProvisioningError::PortNotExposed {
                    alias: spec.alias.clone(),
                    port: internal,
                })?;
            let policy = PollPolicy::with_deadline(spec.startup_timeout);
            if let Err(exhausted) = wait_for_port(&host, mapped, &policy).await {
                warn!(
                    attempts = exhausted.attempts,
                    last_error = %exhausted.last_error,
                    "[docker.start_container] port never opened"
                );
                return Err(StartupTimeoutError {
                    alias: spec.alias.clone(),
                    waited: exhausted.waited,
                    strategy: spec.wait.to_string(),
                }
                .into());
            }
        }

        info!(host = %host, ports = ?ports, "[docker.start_container] container ready");
        Ok(StartedContainer {
            handle: container,
            host,
            ports,
        })
    }

    #[instrument(name = "docker.stop_container", skip_all, fields(alias = %alias))]
    async fn stop_container(
        &self,
        alias: &NetworkAlias,
        handle: Self::Handle,
    ) -> Result<(), ProvisioningError> {
        handle
            .rm()
            .await
            .map_err(|error| ProvisioningError::Disposal {
                resource: alias.to_string(),
                detail: error.to_string(),
            })
    }
}

fn container_request(
    network: &NetworkHandle,
    spec: &ContainerSpec,
) -> testcontainers::ContainerRequest<GenericImage> {
    let mut image = GenericImage::new(spec.image.name(), spec.image.tag());
    for binding in &spec.ports {
        image = image.with_exposed_port(ContainerPort::Tcp(binding.internal()));
    }
    if let Some(wait) = engine_wait(&spec.wait) {
        image = image.with_wait_for(wait);
    }

    let mut request = image
        .with_network(network.name().as_str())
        .with_container_name(spec.alias.as_str())
        .with_startup_timeout(spec.startup_timeout + ENGINE_WAIT_HEADROOM);

    for (key, value) in &spec.env {
        request = request.with_env_var(key, value);
    }
    for (host, internal) in explicit_mappings(&spec.ports) {
        request = request.with_mapped_port(host, ContainerPort::Tcp(internal));
    }
    request
}

/// Log waits run inside the engine; port waits are polled afterwards against
/// the mapped port.
fn engine_wait(strategy: &WaitStrategy) -> Option<WaitFor> {
    match strategy {
        WaitStrategy::LogMessage {
            stream: LogStream::Stdout,
            message,
        } => Some(WaitFor::message_on_stdout(message)),
        WaitStrategy::LogMessage {
            stream: LogStream::Stderr,
            message,
        } => Some(WaitFor::message_on_stderr(message)),
        WaitStrategy::None | WaitStrategy::PortOpen(_) => None,
    }
}

/// `(host, internal)` pairs to map explicitly.
///
/// With no fixed binding every exposed port is published on an engine-chosen
/// host port. Once one port is mapped explicitly the engine publishes only
/// mapped ports, so ephemeral ones are mapped to host port 0.
fn explicit_mappings(ports: &[PortBinding]) -> Vec<(u16, u16)> {
    let any_fixed = ports
        .iter()
        .any(|binding| matches!(binding, PortBinding::Fixed { .. }));
    if !any_fixed {
        return Vec::new();
    }

    ports
        .iter()
        .map(|binding| match *binding {
            PortBinding::Ephemeral(internal) => (0, internal),
            PortBinding::Fixed { internal, host } => (host, internal),
        })
        .collect()
}

fn start_failure(spec: &ContainerSpec, error: &testcontainers::TestcontainersError) -> SetupError {
    ProvisioningError::ContainerStart {
        alias: spec.alias.clone(),
        image: spec.image.clone(),
        detail: error.to_string(),
    }
    .into()
}

const fn is_not_found(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_ports_rely_on_publish_all() {
        let ports = [PortBinding::Ephemeral(5672), PortBinding::Ephemeral(15672)];

        assert!(explicit_mappings(&ports).is_empty());
    }

    #[test]
    fn one_fixed_port_maps_every_port_explicitly() {
        let ports = [
            PortBinding::Fixed {
                internal: 5432,
                host: 15432,
            },
            PortBinding::Ephemeral(8080),
        ];

        assert_eq!(explicit_mappings(&ports), vec![(15432, 5432), (0, 8080)]);
    }

    #[test]
    fn port_waits_are_not_delegated_to_the_engine() {
        assert!(engine_wait(&WaitStrategy::PortOpen(5672)).is_none());
        assert!(engine_wait(&WaitStrategy::None).is_none());
    }

    #[test]
    fn log_waits_are_delegated_to_the_engine() {
        let strategy = WaitStrategy::LogMessage {
            stream: LogStream::Stderr,
            message: "ready to accept connections".to_string(),
        };

        assert!(engine_wait(&strategy).is_some());
    }

    #[test]
    fn only_404_means_missing_network() {
        let missing = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "network test-network not found".to_string(),
        };
        let conflict = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "conflict".to_string(),
        };

        assert!(is_not_found(&missing));
        assert!(!is_not_found(&conflict));
    }
}
