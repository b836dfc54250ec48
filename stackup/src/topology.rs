//! What to provision, declared up front and validated before any container
//! starts.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use thiserror::Error;

use crate::broker::{BrokerSpec, AMQP_PORT, MANAGEMENT_PORT};
use crate::config::EnvironmentConfig;
use crate::database::{DatabaseSpec, POSTGRES_READY_MESSAGE};
use crate::errors::ProvisioningError;
use crate::network::NetworkSpec;
use crate::service::ServiceDefinition;
use crate::types::{
    Credentials, CredentialsError, LogStream, LogicalDatabase, NetworkAlias, PortBinding,
    WaitStrategy,
};

const SERVICE_HTTP_PORT: u16 = 8080;
const POSTGRES_PORT: u16 = 5432;

/// A hard-coded topology name did not pass validation.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// An alias or database name was rejected.
    #[error("invalid name `{name}`: {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Validation message.
        reason: String,
    },

    /// Credentials were rejected.
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
}

/// Network, broker, database, and services for one run.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Network every container joins.
    pub network: NetworkSpec,
    /// Message broker.
    pub broker: BrokerSpec,
    /// Database engine and the logical databases to bootstrap.
    pub database: DatabaseSpec,
    /// Application services, in start order.
    pub services: Vec<ServiceDefinition>,
    /// Start services concurrently.
    pub parallel_services: bool,
}

impl Topology {
    /// Organization, article, and order services sharing one broker and one
    /// PostgreSQL engine.
    pub fn organization_suite(config: &EnvironmentConfig) -> Result<Self, TopologyError> {
        let startup_timeout = config.startup_timeout();

        let broker = BrokerSpec {
            image: config.broker_image.clone(),
            alias: alias("rabbitmq")?,
            credentials: Credentials::new("testuser", "testpassword")?,
            ports: vec![
                PortBinding::Ephemeral(AMQP_PORT),
                PortBinding::Ephemeral(MANAGEMENT_PORT),
            ],
            wait: WaitStrategy::PortOpen(AMQP_PORT),
            startup_timeout,
        };

        let database = DatabaseSpec {
            image: config.postgres_image.clone(),
            alias: alias("postgres")?,
            credentials: Credentials::new("postgres", "postgres")?,
            admin_database: database("organizations")?,
            port: PortBinding::Ephemeral(POSTGRES_PORT),
            wait: WaitStrategy::LogMessage {
                stream: LogStream::Stderr,
                message: POSTGRES_READY_MESSAGE.to_string(),
            },
            startup_timeout,
            bootstrap: vec![database("orders")?, database("articles")?],
        };

        let services = vec![
            service(
                config,
                "organizationservice",
                "organizations",
                "OrganizationsDB",
                false,
                startup_timeout,
            )?,
            service(
                config,
                "articleservice",
                "articles",
                "ArticleDB",
                true,
                startup_timeout,
            )?,
            service(
                config,
                "orderservice",
                "orders",
                "OrderDB",
                true,
                startup_timeout,
            )?,
        ];

        Ok(Self {
            network: NetworkSpec {
                name: config.network.clone(),
                reuse: config.reuse_network,
            },
            broker,
            database,
            services,
            parallel_services: config.parallel_services,
        })
    }

    /// Look up a service by alias.
    pub fn service(&self, alias: &str) -> Option<&ServiceDefinition> {
        self.services
            .iter()
            .find(|service| service.alias.as_str() == alias)
    }

    /// Reject topologies that could never come up: services referencing
    /// databases nothing creates, and aliases used twice on the network.
    pub fn validate(&self) -> Result<(), ProvisioningError> {
        for service in &self.services {
            if !self.database.provides(&service.database) {
                return Err(ProvisioningError::UndeclaredDatabase {
                    service: service.alias.clone(),
                    database: service.database.clone(),
                });
            }
        }

        let mut seen = BTreeSet::new();
        let aliases = [&self.broker.alias, &self.database.alias]
            .into_iter()
            .chain(self.services.iter().map(|service| &service.alias));
        for alias in aliases {
            if !seen.insert(alias) {
                return Err(ProvisioningError::DuplicateAlias {
                    alias: alias.clone(),
                });
            }
        }

        Ok(())
    }
}

fn alias(name: &str) -> Result<NetworkAlias, TopologyError> {
    NetworkAlias::try_new(name).map_err(|error| TopologyError::InvalidName {
        name: name.to_string(),
        reason: error.to_string(),
    })
}

fn database(name: &str) -> Result<LogicalDatabase, TopologyError> {
    LogicalDatabase::try_new(name).map_err(|error| TopologyError::InvalidName {
        name: name.to_string(),
        reason: error.to_string(),
    })
}

fn service(
    config: &EnvironmentConfig,
    name: &str,
    owned_database: &str,
    connection_setting: &str,
    disable_auth: bool,
    startup_timeout: Duration,
) -> Result<ServiceDefinition, TopologyError> {
    Ok(ServiceDefinition {
        image: config.service_image(name),
        alias: alias(name)?,
        http_port: SERVICE_HTTP_PORT,
        database: database(owned_database)?,
        connection_setting: connection_setting.to_string(),
        environment: "Production".to_string(),
        disable_auth,
        extra_env: BTreeMap::new(),
        startup_timeout,
    })
}
