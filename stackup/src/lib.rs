//! `stackup` - ordered bring-up of containerized test environments
//!
//! Provisions a network, a message broker, a database engine with its
//! logical databases, and a set of application services wired to both, in
//! that order, then tears everything down in reverse. Provisioning goes
//! through the [`ContainerPlatform`] and [`DatabaseAdmin`] traits so the
//! sequencing can be exercised without Docker.
//!
//! ```no_run
//! use std::sync::Arc;
//! # use stackup::{ContainerPlatform, EnvironmentConfig, PostgresAdmin, Sequencer, Topology};
//! # async fn run<P: ContainerPlatform>(platform: P) -> Result<(), Box<dyn std::error::Error>> {
//! let config = EnvironmentConfig::from_env()?;
//! let topology = Topology::organization_suite(&config)?;
//! let sequencer = Sequencer::new(Arc::new(platform), PostgresAdmin::default());
//!
//! let mut environment = sequencer.bring_up(&topology).await?;
//! // ... exercise the services ...
//! let report = environment.teardown().await;
//! assert!(report.is_clean());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod config;
pub mod database;
pub mod descriptor;
pub mod errors;
pub mod event;
pub mod instance;
pub mod lifecycle;
pub mod network;
pub mod platform;
pub mod postgres;
pub mod probe;
pub mod publisher;
pub mod retry;
pub mod sequencer;
pub mod service;
pub mod telemetry;
pub mod topology;
pub mod types;
mod validation;

pub use broker::{start_broker, BrokerCoordinates, BrokerInstance, BrokerSpec};
pub use config::{ConfigError, EnvironmentConfig, SettleDeadlineSecs, StartupTimeoutSecs};
pub use database::{start_database, DatabaseInstance, DatabaseSpec};
pub use descriptor::{ConnectionDescriptor, HostMode};
pub use errors::{
    AssertionFailure, BootstrapError, ProvisioningError, PublishError, SetupError,
    StartupTimeoutError,
};
pub use event::{AdminEvent, RoutingKey};
pub use instance::ServiceInstance;
pub use lifecycle::{Lifecycle, LifecycleError, Phase};
pub use network::{provision_network, NetworkHandle, NetworkSpec};
pub use platform::{ContainerPlatform, DatabaseAdmin, StartedContainer};
pub use postgres::PostgresAdmin;
pub use probe::{eventually, stays_false, HttpProbe, ProbeError};
pub use publisher::{AmqpTarget, EventPublisher, PublishOutcome, PublishRequest};
pub use retry::PollPolicy;
pub use sequencer::{BringUpError, Environment, Sequencer, TeardownReport};
pub use service::{start_service, ServiceDefinition, ServiceWiring};
pub use topology::{Topology, TopologyError};
pub use types::{
    ContainerSpec, Credentials, ImageRef, InstanceKind, LogStream, LogicalDatabase, NetworkAlias,
    NetworkName, PortBinding, WaitStrategy,
};
