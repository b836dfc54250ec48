//! In-memory container platform for `stackup`
//!
//! Implements [`ContainerPlatform`] and [`DatabaseAdmin`] without Docker so
//! the sequencer's ordering, failure handling, and teardown can be tested
//! quickly. Every call is recorded in a journal; failures are injected per
//! alias.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use stackup::{
    BootstrapError, ConnectionDescriptor, ContainerPlatform, ContainerSpec, DatabaseAdmin,
    LogicalDatabase, NetworkAlias, NetworkHandle, NetworkSpec, PortBinding, ProvisioningError,
    SetupError, StartedContainer, StartupTimeoutError,
};
use tracing::debug;

/// First host port handed out for ephemeral bindings, the start of the
/// IANA dynamic range.
pub const FIRST_EPHEMERAL_PORT: u16 = 49152;

/// Host every in-memory container is reachable on.
pub const HOST: &str = "127.0.0.1";

/// One platform or admin call, in the order it was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    /// `create_network(name)`
    CreateNetwork(String),
    /// `remove_network(name)`
    RemoveNetwork(String),
    /// `start_container(alias)`
    Start(String),
    /// `stop_container(alias)`
    Stop(String),
    /// `create_databases(names)`
    CreateDatabases(Vec<String>),
}

/// How an injected start failure manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFailure {
    /// The platform itself reports a readiness timeout.
    Timeout,
    /// The platform refuses to create the container.
    Provisioning,
    /// The start never completes; only the caller's deadline ends it.
    Stall,
}

/// Handle to an in-memory container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryHandle {
    /// Alias the container was started under.
    pub alias: String,
    /// Sequence number of the start.
    pub id: u64,
}

#[derive(Debug)]
struct Container {
    network: String,
    ports: BTreeMap<u16, u16>,
}

#[derive(Debug)]
struct State {
    journal: Vec<PlatformCall>,
    networks: BTreeSet<String>,
    running: BTreeMap<String, Container>,
    started_env: BTreeMap<String, BTreeMap<String, String>>,
    databases: BTreeSet<String>,
    start_failures: BTreeMap<String, StartFailure>,
    start_delays: BTreeMap<String, Duration>,
    stop_failures: BTreeSet<String>,
    fail_network: bool,
    fail_network_removal: bool,
    next_port: u16,
    next_id: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            journal: Vec::new(),
            networks: BTreeSet::new(),
            running: BTreeMap::new(),
            started_env: BTreeMap::new(),
            databases: BTreeSet::new(),
            start_failures: BTreeMap::new(),
            start_delays: BTreeMap::new(),
            stop_failures: BTreeSet::new(),
            fail_network: false,
            fail_network_removal: false,
            next_port: FIRST_EPHEMERAL_PORT,
            next_id: 0,
        }
    }
}

/// Thread-safe in-memory container platform.
///
/// Clones share state, so a clone kept by the test observes everything the
/// sequencer's copy does.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPlatform {
    state: Arc<Mutex<State>>,
}

impl InMemoryPlatform {
    /// Platform with no networks, containers, or injected failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make starting `alias` fail as described.
    #[must_use]
    pub fn fail_start(self, alias: &str, failure: StartFailure) -> Self {
        let _ = self
            .state
            .lock()
            .start_failures
            .insert(alias.to_string(), failure);
        self
    }

    /// Make starting `alias` take `delay` before it succeeds or fails.
    #[must_use]
    pub fn delay_start(self, alias: &str, delay: Duration) -> Self {
        let _ = self
            .state
            .lock()
            .start_delays
            .insert(alias.to_string(), delay);
        self
    }

    /// Make stopping `alias` fail; the container stays running.
    #[must_use]
    pub fn fail_stop(self, alias: &str) -> Self {
        let _ = self.state.lock().stop_failures.insert(alias.to_string());
        self
    }

    /// Make every network creation fail.
    #[must_use]
    pub fn fail_network(self) -> Self {
        self.state.lock().fail_network = true;
        self
    }

    /// Make network removal fail.
    #[must_use]
    pub fn fail_network_removal(self) -> Self {
        self.state.lock().fail_network_removal = true;
        self
    }

    /// Pretend a network called `name` already exists.
    #[must_use]
    pub fn with_existing_network(self, name: &str) -> Self {
        let _ = self.state.lock().networks.insert(name.to_string());
        self
    }

    /// Pretend the engine already holds a database called `name`.
    #[must_use]
    pub fn with_existing_database(self, name: &str) -> Self {
        let _ = self.state.lock().databases.insert(name.to_string());
        self
    }

    /// Admin sharing this platform's state.
    pub fn admin(&self) -> InMemoryDatabaseAdmin {
        InMemoryDatabaseAdmin {
            state: Arc::clone(&self.state),
        }
    }

    /// Every call made so far.
    pub fn journal(&self) -> Vec<PlatformCall> {
        self.state.lock().journal.clone()
    }

    /// Aliases of containers currently running.
    pub fn running(&self) -> Vec<String> {
        self.state.lock().running.keys().cloned().collect()
    }

    /// Networks currently present.
    pub fn networks(&self) -> Vec<String> {
        self.state.lock().networks.iter().cloned().collect()
    }

    /// Databases created through the admin.
    pub fn databases(&self) -> Vec<String> {
        self.state.lock().databases.iter().cloned().collect()
    }

    /// Environment `alias` was last started with.
    pub fn started_env(&self, alias: &str) -> Option<BTreeMap<String, String>> {
        self.state.lock().started_env.get(alias).cloned()
    }

    /// Network `alias` is attached to, while running.
    pub fn network_of(&self, alias: &str) -> Option<String> {
        self.state
            .lock()
            .running
            .get(alias)
            .map(|container| container.network.clone())
    }

    /// Host port bound to `internal` on running container `alias`.
    pub fn host_port(&self, alias: &str, internal: u16) -> Option<u16> {
        self.state
            .lock()
            .running
            .get(alias)
            .and_then(|container| container.ports.get(&internal).copied())
    }
}

impl ContainerPlatform for InMemoryPlatform {
    type Handle = MemoryHandle;

    async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkHandle, ProvisioningError> {
        let name = spec.name.to_string();
        let mut state = self.state.lock();
        state.journal.push(PlatformCall::CreateNetwork(name.clone()));

        if state.fail_network {
            return Err(ProvisioningError::Network {
                network: spec.name.clone(),
                detail: "injected network failure".to_string(),
            });
        }

        if state.networks.contains(&name) {
            if spec.reuse {
                debug!(network = %name, "[memory.network] adopting existing network");
                return Ok(NetworkHandle::adopted(spec));
            }
            return Err(ProvisioningError::Network {
                network: spec.name.clone(),
                detail: "network already exists".to_string(),
            });
        }

        let _ = state.networks.insert(name);
        Ok(NetworkHandle::created(spec))
    }

    async fn remove_network(&self, network: &NetworkHandle) -> Result<(), ProvisioningError> {
        let name = network.name().to_string();
        let mut state = self.state.lock();
        state.journal.push(PlatformCall::RemoveNetwork(name.clone()));

        if state.fail_network_removal {
            return Err(ProvisioningError::Disposal {
                resource: name,
                detail: "injected network removal failure".to_string(),
            });
        }
        if state.running.values().any(|container| container.network == name) {
            return Err(ProvisioningError::Disposal {
                resource: name,
                detail: "network has active endpoints".to_string(),
            });
        }

        let _ = state.networks.remove(&name);
        Ok(())
    }

    async fn start_container(
        &self,
        network: &NetworkHandle,
        spec: &ContainerSpec,
    ) -> Result<StartedContainer<MemoryHandle>, SetupError> {
        let alias = spec.alias.to_string();
        let (delay, failure) = {
            let mut state = self.state.lock();
            state.journal.push(PlatformCall::Start(alias.clone()));
            (
                state.start_delays.get(&alias).copied(),
                state.start_failures.get(&alias).copied(),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match failure {
            Some(StartFailure::Timeout) => {
                return Err(StartupTimeoutError {
                    alias: spec.alias.clone(),
                    waited: spec.startup_timeout,
                    strategy: spec.wait.to_string(),
                }
                .into());
            }
            Some(StartFailure::Provisioning) => {
                return Err(ProvisioningError::ContainerStart {
                    alias: spec.alias.clone(),
                    image: spec.image.clone(),
                    detail: "injected start failure".to_string(),
                }
                .into());
            }
            Some(StartFailure::Stall) => match std::future::pending::<Infallible>().await {},
            None => {}
        }

        let mut state = self.state.lock();
        let network_name = network.name().to_string();
        if !state.networks.contains(&network_name) {
            return Err(ProvisioningError::ContainerStart {
                alias: spec.alias.clone(),
                image: spec.image.clone(),
                detail: format!("network {network_name} not found"),
            }
            .into());
        }
        if state.running.contains_key(&alias) {
            return Err(ProvisioningError::ContainerStart {
                alias: spec.alias.clone(),
                image: spec.image.clone(),
                detail: "container name already in use".to_string(),
            }
            .into());
        }

        let mut ports = BTreeMap::new();
        for binding in &spec.ports {
            let host = match *binding {
                PortBinding::Ephemeral(_) => {
                    let port = state.next_port;
                    state.next_port = state.next_port.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);
                    port
                }
                PortBinding::Fixed { host, .. } => host,
            };
            let _ = ports.insert(binding.internal(), host);
        }

        state.next_id += 1;
        let handle = MemoryHandle {
            alias: alias.clone(),
            id: state.next_id,
        };
        let _ = state.started_env.insert(alias.clone(), spec.env.clone());
        let _ = state.running.insert(
            alias.clone(),
            Container {
                network: network_name,
                ports: ports.clone(),
            },
        );
        debug!(alias = %alias, ports = ?ports, "[memory.start] container running");

        Ok(StartedContainer {
            handle,
            host: HOST.to_string(),
            ports,
        })
    }

    async fn stop_container(
        &self,
        alias: &NetworkAlias,
        handle: MemoryHandle,
    ) -> Result<(), ProvisioningError> {
        let mut state = self.state.lock();
        state.journal.push(PlatformCall::Stop(alias.to_string()));

        if state.stop_failures.contains(alias.as_str()) {
            return Err(ProvisioningError::Disposal {
                resource: alias.to_string(),
                detail: "injected stop failure".to_string(),
            });
        }

        match state.running.get(alias.as_str()) {
            Some(_) if handle.alias == alias.as_str() => {
                let _ = state.running.remove(alias.as_str());
                Ok(())
            }
            _ => Err(ProvisioningError::Disposal {
                resource: alias.to_string(),
                detail: format!("no running container for handle {}", handle.id),
            }),
        }
    }
}

/// In-memory [`DatabaseAdmin`]; obtained from [`InMemoryPlatform::admin`].
#[derive(Debug, Clone)]
pub struct InMemoryDatabaseAdmin {
    state: Arc<Mutex<State>>,
}

impl DatabaseAdmin for InMemoryDatabaseAdmin {
    async fn create_databases(
        &self,
        admin: &ConnectionDescriptor,
        databases: &[LogicalDatabase],
    ) -> Result<(), BootstrapError> {
        let mut state = self.state.lock();
        state.journal.push(PlatformCall::CreateDatabases(
            databases.iter().map(ToString::to_string).collect(),
        ));

        debug!(
            host = %admin.host(),
            port = admin.port(),
            "[memory.bootstrap] creating databases"
        );
        for database in databases {
            if !state.databases.insert(database.to_string()) {
                return Err(BootstrapError::AlreadyExists {
                    database: database.clone(),
                });
            }
        }
        Ok(())
    }
}
