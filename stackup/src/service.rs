//! Application service provisioning.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::instrument;

use crate::broker::BrokerCoordinates;
use crate::descriptor::{ConnectionDescriptor, HostMode};
use crate::errors::{ProvisioningError, SetupError};
use crate::instance::{launch, ServiceInstance};
use crate::network::NetworkHandle;
use crate::platform::ContainerPlatform;
use crate::types::{
    ContainerSpec, ImageRef, InstanceKind, LogicalDatabase, NetworkAlias, PortBinding,
    WaitStrategy,
};

/// An application service under test.
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    /// Service image.
    pub image: ImageRef,
    /// Network alias and container name.
    pub alias: NetworkAlias,
    /// HTTP port inside the container; published ephemerally and waited on.
    pub http_port: u16,
    /// Database the service owns.
    pub database: LogicalDatabase,
    /// Name under `ConnectionStrings__`, e.g. `ArticleDB`.
    pub connection_setting: String,
    /// Value of `ASPNETCORE_ENVIRONMENT`.
    pub environment: String,
    /// Sets `DISABLE_AUTH=true`.
    pub disable_auth: bool,
    /// Additional variables, applied last.
    pub extra_env: BTreeMap<String, String>,
    /// Start plus readiness budget.
    pub startup_timeout: Duration,
}

/// Broker and database coordinates handed to one service.
#[derive(Debug, Clone)]
pub struct ServiceWiring {
    /// Broker reachable from inside the network.
    pub broker: BrokerCoordinates,
    /// Internal descriptor for the service's database.
    pub database: ConnectionDescriptor,
}

/// Environment variables a service is started with.
pub fn service_environment(
    definition: &ServiceDefinition,
    wiring: &ServiceWiring,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([
        (
            "ASPNETCORE_ENVIRONMENT".to_string(),
            definition.environment.clone(),
        ),
        (
            "RabbitMQ__HostName".to_string(),
            wiring.broker.host.to_string(),
        ),
        (
            "RabbitMQ__UserName".to_string(),
            wiring.broker.credentials.username().to_string(),
        ),
        (
            "RabbitMQ__Password".to_string(),
            wiring.broker.credentials.password().to_string(),
        ),
        (
            format!("ConnectionStrings__{}", definition.connection_setting),
            wiring.database.service_setting(),
        ),
    ]);

    if definition.disable_auth {
        let _ = env.insert("DISABLE_AUTH".to_string(), "true".to_string());
    }

    env.extend(definition.extra_env.clone());
    env
}

impl ServiceDefinition {
    fn container_spec(&self, wiring: &ServiceWiring) -> ContainerSpec {
        ContainerSpec {
            kind: InstanceKind::Application,
            image: self.image.clone(),
            alias: self.alias.clone(),
            env: service_environment(self, wiring),
            ports: vec![PortBinding::Ephemeral(self.http_port)],
            wait: WaitStrategy::PortOpen(self.http_port),
            startup_timeout: self.startup_timeout,
        }
    }
}

/// Start a service wired to the broker and its database.
///
/// The database descriptor must be the internal form; the service resolves
/// it from inside the network.
#[instrument(name = "service.start", skip_all, fields(alias = %definition.alias))]
pub async fn start_service<P: ContainerPlatform>(
    platform: &P,
    network: &NetworkHandle,
    definition: &ServiceDefinition,
    wiring: &ServiceWiring,
) -> Result<ServiceInstance<P::Handle>, SetupError> {
    if wiring.database.mode() != HostMode::Internal {
        return Err(ProvisioningError::ExternalDescriptor {
            service: definition.alias.clone(),
            database: wiring.database.database().clone(),
        }
        .into());
    }

    launch(platform, network, &definition.container_spec(wiring)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Credentials;

    fn definition(disable_auth: bool) -> ServiceDefinition {
        ServiceDefinition {
            image: ImageRef::parse("casgoorman/articleservice:latest").expect("valid image"),
            alias: NetworkAlias::try_new("articleservice").expect("valid alias"),
            http_port: 8080,
            database: LogicalDatabase::try_new("articles").expect("valid database"),
            connection_setting: "ArticleDB".to_string(),
            environment: "Production".to_string(),
            disable_auth,
            extra_env: BTreeMap::new(),
            startup_timeout: Duration::from_secs(120),
        }
    }

    fn wiring() -> ServiceWiring {
        ServiceWiring {
            broker: BrokerCoordinates {
                host: NetworkAlias::try_new("rabbitmq").expect("valid alias"),
                credentials: Credentials::new("testuser", "testpassword")
                    .expect("valid credentials"),
            },
            database: ConnectionDescriptor::new(
                HostMode::Internal,
                "postgres".to_string(),
                5432,
                Credentials::new("postgres", "postgres").expect("valid credentials"),
                LogicalDatabase::try_new("articles").expect("valid database"),
            ),
        }
    }

    #[test]
    fn environment_points_the_service_at_broker_and_database_aliases() {
        let env = service_environment(&definition(true), &wiring());

        assert_eq!(env["RabbitMQ__HostName"], "rabbitmq");
        assert_eq!(env["RabbitMQ__UserName"], "testuser");
        assert_eq!(env["RabbitMQ__Password"], "testpassword");
        assert_eq!(env["ASPNETCORE_ENVIRONMENT"], "Production");
        assert_eq!(
            env["ConnectionStrings__ArticleDB"],
            "Server=postgres;Port=5432;Database=articles;User Id=postgres;Password=postgres;"
        );
        assert_eq!(env["DISABLE_AUTH"], "true");
    }

    #[test]
    fn auth_stays_enabled_unless_disabled() {
        let env = service_environment(&definition(false), &wiring());

        assert!(!env.contains_key("DISABLE_AUTH"));
    }

    #[test]
    fn extra_variables_override_defaults() {
        let mut definition = definition(false);
        let _ = definition
            .extra_env
            .insert("ASPNETCORE_ENVIRONMENT".to_string(), "Development".to_string());

        let env = service_environment(&definition, &wiring());

        assert_eq!(env["ASPNETCORE_ENVIRONMENT"], "Development");
    }

    #[test]
    fn services_wait_for_their_http_port() {
        let spec = definition(false).container_spec(&wiring());

        assert_eq!(spec.wait, WaitStrategy::PortOpen(8080));
        assert_eq!(spec.ports, vec![PortBinding::Ephemeral(8080)]);
    }
}
