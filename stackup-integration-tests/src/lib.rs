//! Fixtures for the Docker-backed end-to-end tests.
//!
//! [`OrganizationSuite::start`] brings up the full organization topology on
//! the local Docker engine. Tests publish through the broker, then observe the
//! services through their mapped ports and the databases through external
//! descriptors.

use std::sync::Arc;

use stackup::{
    AmqpTarget, BootstrapError, BringUpError, ConfigError, ConnectionDescriptor, Environment,
    EnvironmentConfig, EventPublisher, HostMode, HttpProbe, LogicalDatabase, PollPolicy,
    PostgresAdmin, PublishError, Sequencer, TeardownReport, Topology, TopologyError,
};
use stackup_testcontainers::{DockerPlatform, DockerPlatformError};
use thiserror::Error;
use tracing::info;

/// Queue the publisher declares and binds to the organization-created key.
///
/// The services consume from their own queues on the same exchange; this one
/// only keeps the published message routable.
pub const ORGANIZATION_QUEUE: &str = "example_queue";

/// Queue bound to keys no service listens for. Kept apart from
/// [`ORGANIZATION_QUEUE`] so a stray binding never reaches a consumer.
pub const UNROUTED_QUEUE: &str = "stackup_unrouted_events";

/// Port every service listens on inside its container.
pub const SERVICE_HTTP_PORT: u16 = 8080;

/// The suite could not be brought up.
#[derive(Debug, Error)]
pub enum SuiteError {
    /// Environment variables were invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The topology could not be assembled.
    #[error(transparent)]
    Topology(#[from] TopologyError),
    /// Docker was not reachable.
    #[error(transparent)]
    Docker(#[from] DockerPlatformError),
    /// Bring-up failed; whatever had started was already released.
    #[error(transparent)]
    BringUp(#[from] BringUpError),
    /// Bring-up reported success without the named component.
    #[error("environment came up without a {0}")]
    Incomplete(&'static str),
}

/// A running organization environment and the settings it was built from.
#[derive(Debug)]
pub struct OrganizationSuite {
    config: EnvironmentConfig,
    environment: Environment<DockerPlatform>,
    amqp: AmqpTarget,
}

impl OrganizationSuite {
    /// Bring up network, broker, database and services from the process
    /// environment.
    pub async fn start() -> Result<Self, SuiteError> {
        stackup::telemetry::init_tracing();

        let config = EnvironmentConfig::from_env()?;
        let topology = Topology::organization_suite(&config)?;
        let platform = DockerPlatform::connect()?;
        let sequencer = Sequencer::new(
            Arc::new(platform),
            PostgresAdmin::default(),
        );

        let mut environment = sequencer.bring_up(&topology).await?;
        let Some(amqp) = environment.broker().map(stackup::BrokerInstance::amqp_target) else {
            environment.teardown().await;
            return Err(SuiteError::Incomplete("broker"));
        };

        info!(phase = %environment.phase(), "[suite.start] organization suite ready");
        Ok(Self {
            config,
            environment,
            amqp,
        })
    }

    /// Settings the suite was started with.
    pub const fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    /// The running environment.
    pub const fn environment(&self) -> &Environment<DockerPlatform> {
        &self.environment
    }

    /// Polling schedule for business-level checks.
    pub fn settle_policy(&self) -> PollPolicy {
        PollPolicy::with_deadline(self.config.settle_deadline())
    }

    /// Publisher connected to the broker's mapped AMQP port.
    pub async fn publisher(&self) -> Result<EventPublisher, PublishError> {
        EventPublisher::connect(&self.amqp).await
    }

    /// Descriptor for `database` reachable from the test process.
    pub fn external_descriptor(
        &self,
        database: &LogicalDatabase,
    ) -> Result<ConnectionDescriptor, BootstrapError> {
        let engine = self
            .environment
            .database()
            .ok_or_else(|| BootstrapError::NotBootstrapped {
                database: database.clone(),
            })?;
        engine.connection_string_for(database, HostMode::External)
    }

    /// Base URL of `service` on its mapped HTTP port, while it runs.
    pub fn service_url(&self, service: &str) -> Option<String> {
        self.environment
            .service(service)
            .and_then(|instance| instance.base_url(SERVICE_HTTP_PORT).ok())
    }

    /// HTTP probe carrying the configured bearer token.
    pub fn http_probe(&self) -> HttpProbe {
        HttpProbe::new(self.config.bearer_token.clone())
    }

    /// Tear everything down.
    pub async fn stop(&mut self) -> TeardownReport {
        self.environment.teardown().await
    }
}
