//! Broker provisioning.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::instrument;

use crate::errors::{ProvisioningError, SetupError};
use crate::instance::{launch, ServiceInstance};
use crate::network::NetworkHandle;
use crate::platform::ContainerPlatform;
use crate::publisher::AmqpTarget;
use crate::types::{
    ContainerSpec, Credentials, ImageRef, InstanceKind, NetworkAlias, PortBinding, WaitStrategy,
};

/// AMQP listener inside the broker image.
pub const AMQP_PORT: u16 = 5672;
/// Management UI inside the `-management` broker images.
pub const MANAGEMENT_PORT: u16 = 15672;

/// Requested broker.
#[derive(Debug, Clone)]
pub struct BrokerSpec {
    /// Broker image.
    pub image: ImageRef,
    /// Network alias and container name.
    pub alias: NetworkAlias,
    /// Default user created on first boot.
    pub credentials: Credentials,
    /// Published ports; must include the AMQP port.
    pub ports: Vec<PortBinding>,
    /// Readiness policy.
    pub wait: WaitStrategy,
    /// Start plus readiness budget.
    pub startup_timeout: Duration,
}

impl BrokerSpec {
    pub(crate) fn container_spec(&self) -> ContainerSpec {
        let env = BTreeMap::from([
            (
                "RABBITMQ_DEFAULT_USER".to_string(),
                self.credentials.username().to_string(),
            ),
            (
                "RABBITMQ_DEFAULT_PASS".to_string(),
                self.credentials.password().to_string(),
            ),
        ]);

        ContainerSpec {
            kind: InstanceKind::Broker,
            image: self.image.clone(),
            alias: self.alias.clone(),
            env,
            ports: self.ports.clone(),
            wait: self.wait.clone(),
            startup_timeout: self.startup_timeout,
        }
    }
}

/// What a service needs to reach the broker from inside the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerCoordinates {
    /// Network alias of the broker.
    pub host: NetworkAlias,
    /// Broker credentials.
    pub credentials: Credentials,
}

/// A running broker.
#[derive(Debug)]
pub struct BrokerInstance<H> {
    instance: ServiceInstance<H>,
    credentials: Credentials,
    amqp_host_port: u16,
}

impl<H> BrokerInstance<H> {
    /// The underlying container.
    pub const fn instance(&self) -> &ServiceInstance<H> {
        &self.instance
    }

    /// Alias and credentials for services on the network.
    pub fn coordinates(&self) -> BrokerCoordinates {
        BrokerCoordinates {
            host: self.instance.alias().clone(),
            credentials: self.credentials.clone(),
        }
    }

    /// Mapped AMQP endpoint for the test process.
    pub fn amqp_target(&self) -> AmqpTarget {
        AmqpTarget::new(
            self.instance.host(),
            self.amqp_host_port,
            self.credentials.clone(),
        )
    }

    pub(crate) fn into_instance(self) -> ServiceInstance<H> {
        self.instance
    }
}

/// Start the broker and resolve its mapped AMQP port.
#[instrument(name = "broker.start", skip_all, fields(alias = %spec.alias))]
pub async fn start_broker<P: ContainerPlatform>(
    platform: &P,
    network: &NetworkHandle,
    spec: &BrokerSpec,
) -> Result<BrokerInstance<P::Handle>, SetupError> {
    if !spec.ports.iter().any(|binding| binding.internal() == AMQP_PORT) {
        return Err(ProvisioningError::PortNotExposed {
            alias: spec.alias.clone(),
            port: AMQP_PORT,
        }
        .into());
    }

    let instance = launch(platform, network, &spec.container_spec()).await?;
    let amqp_host_port = instance.mapped_port(AMQP_PORT)?;

    Ok(BrokerInstance {
        instance,
        credentials: spec.credentials.clone(),
        amqp_host_port,
    })
}
