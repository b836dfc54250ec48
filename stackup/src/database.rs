//! Database provisioning and bootstrap.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::{info, instrument};

use crate::descriptor::{ConnectionDescriptor, HostMode};
use crate::errors::{BootstrapError, ProvisioningError, SetupError};
use crate::instance::{launch, ServiceInstance};
use crate::network::NetworkHandle;
use crate::platform::{ContainerPlatform, DatabaseAdmin};
use crate::types::{
    ContainerSpec, Credentials, ImageRef, InstanceKind, LogicalDatabase, NetworkAlias,
    PortBinding, WaitStrategy,
};

/// Marker the PostgreSQL image logs once it accepts connections.
pub const POSTGRES_READY_MESSAGE: &str = "database system is ready to accept connections";

/// Requested database engine.
#[derive(Debug, Clone)]
pub struct DatabaseSpec {
    /// Engine image.
    pub image: ImageRef,
    /// Network alias and container name.
    pub alias: NetworkAlias,
    /// Superuser created on first boot.
    pub credentials: Credentials,
    /// Database created by the image itself; the bootstrap session connects to it.
    pub admin_database: LogicalDatabase,
    /// Published engine port.
    pub port: PortBinding,
    /// Readiness policy.
    pub wait: WaitStrategy,
    /// Start plus readiness budget.
    pub startup_timeout: Duration,
    /// Logical databases to create, in order, once the engine is up.
    pub bootstrap: Vec<LogicalDatabase>,
}

impl DatabaseSpec {
    pub(crate) fn container_spec(&self) -> ContainerSpec {
        let env = BTreeMap::from([
            (
                "POSTGRES_USER".to_string(),
                self.credentials.username().to_string(),
            ),
            (
                "POSTGRES_PASSWORD".to_string(),
                self.credentials.password().to_string(),
            ),
            ("POSTGRES_DB".to_string(), self.admin_database.to_string()),
        ]);

        ContainerSpec {
            kind: InstanceKind::Database,
            image: self.image.clone(),
            alias: self.alias.clone(),
            env,
            ports: vec![self.port],
            wait: self.wait.clone(),
            startup_timeout: self.startup_timeout,
        }
    }

    /// Whether `database` exists once bootstrap has run.
    pub fn provides(&self, database: &LogicalDatabase) -> bool {
        *database == self.admin_database || self.bootstrap.contains(database)
    }
}

/// A running database engine.
#[derive(Debug)]
pub struct DatabaseInstance<H> {
    instance: ServiceInstance<H>,
    credentials: Credentials,
    admin_database: LogicalDatabase,
    internal_port: u16,
    external_port: u16,
    bootstrapped: BTreeSet<LogicalDatabase>,
}

impl<H> DatabaseInstance<H> {
    fn new(instance: ServiceInstance<H>, spec: &DatabaseSpec) -> Result<Self, ProvisioningError> {
        let internal_port = spec.port.internal();
        let external_port = instance.mapped_port(internal_port)?;
        Ok(Self {
            instance,
            credentials: spec.credentials.clone(),
            admin_database: spec.admin_database.clone(),
            internal_port,
            external_port,
            bootstrapped: BTreeSet::new(),
        })
    }

    /// The underlying container.
    pub const fn instance(&self) -> &ServiceInstance<H> {
        &self.instance
    }

    /// Databases created by bootstrap so far.
    pub fn bootstrapped(&self) -> impl Iterator<Item = &LogicalDatabase> {
        self.bootstrapped.iter()
    }

    fn descriptor(&self, database: LogicalDatabase, mode: HostMode) -> ConnectionDescriptor {
        let (host, port) = match mode {
            HostMode::Internal => (self.instance.alias().to_string(), self.internal_port),
            HostMode::External => (self.instance.host().to_string(), self.external_port),
        };
        ConnectionDescriptor::new(mode, host, port, self.credentials.clone(), database)
    }

    /// Descriptor for the database the image created itself.
    pub fn admin_descriptor(&self, mode: HostMode) -> ConnectionDescriptor {
        self.descriptor(self.admin_database.clone(), mode)
    }

    /// Create `databases` in one admin session.
    ///
    /// Rejects the whole request without touching the engine when a name is
    /// repeated or already present; otherwise any engine-side failure fails
    /// the call and the instance must be treated as unusable.
    #[instrument(name = "database.bootstrap", skip_all, fields(alias = %self.instance.alias()))]
    pub async fn bootstrap<A: DatabaseAdmin>(
        &mut self,
        admin: &A,
        databases: &[LogicalDatabase],
    ) -> Result<(), BootstrapError> {
        let mut requested = BTreeSet::new();
        for database in databases {
            if *database == self.admin_database || self.bootstrapped.contains(database) {
                return Err(BootstrapError::AlreadyExists {
                    database: database.clone(),
                });
            }
            if !requested.insert(database.clone()) {
                return Err(BootstrapError::DuplicateRequest {
                    database: database.clone(),
                });
            }
        }

        admin
            .create_databases(&self.admin_descriptor(HostMode::External), databases)
            .await?;

        info!(
            databases = ?databases.iter().map(AsRef::as_ref).collect::<Vec<&str>>(),
            "[database.bootstrap] logical databases created"
        );
        self.bootstrapped.extend(requested);
        Ok(())
    }

    /// Descriptor for `database` as seen from `mode`.
    ///
    /// Internal descriptors carry the network alias and container port;
    /// external ones carry the engine host and mapped port.
    pub fn connection_string_for(
        &self,
        database: &LogicalDatabase,
        mode: HostMode,
    ) -> Result<ConnectionDescriptor, BootstrapError> {
        if *database != self.admin_database && !self.bootstrapped.contains(database) {
            return Err(BootstrapError::NotBootstrapped {
                database: database.clone(),
            });
        }
        Ok(self.descriptor(database.clone(), mode))
    }

    pub(crate) fn into_instance(self) -> ServiceInstance<H> {
        self.instance
    }
}

/// Start the engine and resolve its mapped port. Bootstrap is a separate step.
#[instrument(name = "database.start", skip_all, fields(alias = %spec.alias))]
pub async fn start_database<P: ContainerPlatform>(
    platform: &P,
    network: &NetworkHandle,
    spec: &DatabaseSpec,
) -> Result<DatabaseInstance<P::Handle>, SetupError> {
    let instance = launch(platform, network, &spec.container_spec()).await?;
    Ok(DatabaseInstance::new(instance, spec)?)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::platform::StartedContainer;

    fn spec() -> DatabaseSpec {
        DatabaseSpec {
            image: ImageRef::parse("postgres:16-alpine").expect("valid image"),
            alias: NetworkAlias::try_new("postgres").expect("valid alias"),
            credentials: Credentials::new("postgres", "postgres").expect("valid credentials"),
            admin_database: LogicalDatabase::try_new("organizations").expect("valid database"),
            port: PortBinding::Ephemeral(5432),
            wait: WaitStrategy::LogMessage {
                stream: crate::types::LogStream::Stderr,
                message: POSTGRES_READY_MESSAGE.to_string(),
            },
            startup_timeout: Duration::from_secs(60),
            bootstrap: vec![
                LogicalDatabase::try_new("orders").expect("valid database"),
                LogicalDatabase::try_new("articles").expect("valid database"),
            ],
        }
    }

    fn instance(host_port: u16) -> DatabaseInstance<()> {
        let spec = spec();
        let started = StartedContainer {
            handle: (),
            host: "localhost".to_string(),
            ports: BTreeMap::from([(5432, host_port)]),
        };
        DatabaseInstance::new(ServiceInstance::from_started(&spec.container_spec(), started), &spec)
            .expect("engine port is published")
    }

    fn database(name: &str) -> LogicalDatabase {
        LogicalDatabase::try_new(name).expect("valid database")
    }

    #[test]
    fn container_spec_passes_admin_database_to_the_image() {
        let container = spec().container_spec();

        assert_eq!(
            container.env.get("POSTGRES_DB").map(String::as_str),
            Some("organizations")
        );
        assert_eq!(container.kind, InstanceKind::Database);
    }

    #[test]
    fn admin_database_is_available_before_bootstrap() {
        let instance = instance(55432);

        let descriptor = instance
            .connection_string_for(&database("organizations"), HostMode::Internal)
            .expect("admin database always exists");

        assert_eq!(
            descriptor.service_setting(),
            "Server=postgres;Port=5432;Database=organizations;User Id=postgres;Password=postgres;"
        );
    }

    #[test]
    fn descriptors_for_unbootstrapped_databases_are_refused() {
        let instance = instance(55432);

        let error = instance
            .connection_string_for(&database("orders"), HostMode::Internal)
            .expect_err("orders was never created");

        assert!(matches!(error, BootstrapError::NotBootstrapped { .. }));
    }

    #[test]
    fn spec_reports_which_databases_it_provides() {
        let spec = spec();

        assert!(spec.provides(&database("organizations")));
        assert!(spec.provides(&database("articles")));
        assert!(!spec.provides(&database("invoices")));
    }

    proptest! {
        #[test]
        fn internal_descriptors_never_leak_the_mapped_port(host_port in 1024u16..=65535) {
            prop_assume!(host_port != 5432);
            let instance = instance(host_port);

            let descriptor = instance.admin_descriptor(HostMode::Internal);

            prop_assert_eq!(descriptor.host(), "postgres");
            prop_assert_eq!(descriptor.port(), 5432);
            prop_assert!(!descriptor.service_setting().contains(&host_port.to_string()));
        }

        #[test]
        fn external_descriptors_never_use_the_alias(host_port in 1024u16..=65535) {
            let instance = instance(host_port);

            let descriptor = instance.admin_descriptor(HostMode::External);

            prop_assert_eq!(descriptor.host(), "localhost");
            prop_assert_eq!(descriptor.port(), host_port);
            prop_assert!(!descriptor.url().contains("@postgres:"));
        }
    }
}
