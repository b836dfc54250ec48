//! Ordered bring-up and symmetric teardown.
//!
//! `bring_up` walks network → broker → database (+ bootstrap) → services.
//! Each step hands its result to the next; the [`Environment`] only keeps
//! what it will have to release. On any failure the resources created so far
//! are released in reverse order before the error is returned, so a failed
//! run leaves nothing behind.

use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::broker::{start_broker, BrokerInstance};
use crate::database::{start_database, DatabaseInstance};
use crate::descriptor::HostMode;
use crate::errors::{ProvisioningError, SetupError};
use crate::instance::ServiceInstance;
use crate::lifecycle::{Lifecycle, Phase};
use crate::network::{provision_network, NetworkHandle};
use crate::platform::{ContainerPlatform, DatabaseAdmin};
use crate::service::{start_service, ServiceWiring};
use crate::topology::Topology;
use crate::types::NetworkAlias;

/// What teardown released, kept, and failed to release.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Resources released, in release order.
    pub disposed: Vec<String>,
    /// Resources deliberately kept, i.e. a reused network.
    pub retained: Vec<String>,
    /// Resources that could not be released.
    pub failures: Vec<ProvisioningError>,
}

impl TeardownReport {
    /// No release failed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Nothing was released, kept, or attempted.
    pub fn is_empty(&self) -> bool {
        self.disposed.is_empty() && self.retained.is_empty() && self.failures.is_empty()
    }
}

/// Bring-up failed; partial resources have already been released.
#[derive(Debug, Error)]
#[error("environment bring-up failed after reaching {reached}")]
pub struct BringUpError {
    /// The failure that aborted bring-up.
    #[source]
    pub source: SetupError,
    /// Last phase completed before the failure.
    pub reached: Phase,
    /// Outcome of releasing what had been created.
    pub teardown: TeardownReport,
}

/// Brings topologies up on a platform.
#[derive(Debug)]
pub struct Sequencer<P, D> {
    platform: Arc<P>,
    admin: D,
}

impl<P, D> Sequencer<P, D>
where
    P: ContainerPlatform,
    D: DatabaseAdmin,
{
    /// Sequencer using `platform` for containers and `admin` for bootstrap DDL.
    pub const fn new(platform: Arc<P>, admin: D) -> Self {
        Self { platform, admin }
    }

    /// Provision every part of `topology` in dependency order.
    #[instrument(
        name = "sequencer.bring_up",
        skip_all,
        fields(network = %topology.network.name, services = topology.services.len())
    )]
    pub async fn bring_up(&self, topology: &Topology) -> Result<Environment<P>, BringUpError> {
        let mut environment = Environment::new(Arc::clone(&self.platform));

        if let Err(source) = topology.validate() {
            return Err(environment.fail(source.into()).await);
        }

        let platform = self.platform.as_ref();

        let network = match provision_network(platform, &topology.network).await {
            Ok(network) => network,
            Err(source) => return Err(environment.fail(source.into()).await),
        };
        environment.network = Some(network.clone());
        if let Err(source) = environment.lifecycle.advance(Phase::NetworkReady) {
            return Err(environment.fail(source.into()).await);
        }

        let broker = match start_broker(platform, &network, &topology.broker).await {
            Ok(broker) => broker,
            Err(source) => return Err(environment.fail(source).await),
        };
        let broker_coordinates = broker.coordinates();
        environment.broker = Some(broker);
        if let Err(source) = environment.lifecycle.advance(Phase::BrokerReady) {
            return Err(environment.fail(source.into()).await);
        }

        let mut database = match start_database(platform, &network, &topology.database).await {
            Ok(database) => database,
            Err(source) => return Err(environment.fail(source).await),
        };
        let bootstrapped = database
            .bootstrap(&self.admin, &topology.database.bootstrap)
            .await;
        let wirings = bootstrapped.and_then(|()| {
            topology
                .services
                .iter()
                .map(|definition| {
                    database
                        .connection_string_for(&definition.database, HostMode::Internal)
                        .map(|descriptor| ServiceWiring {
                            broker: broker_coordinates.clone(),
                            database: descriptor,
                        })
                })
                .collect::<Result<Vec<_>, _>>()
        });
        environment.database = Some(database);
        let wirings = match wirings {
            Ok(wirings) => wirings,
            Err(source) => return Err(environment.fail(source.into()).await),
        };
        if let Err(source) = environment.lifecycle.advance(Phase::DatabaseReady) {
            return Err(environment.fail(source.into()).await);
        }

        let pairs = topology.services.iter().zip(&wirings);
        if topology.parallel_services {
            let results = join_all(pairs.map(|(definition, wiring)| {
                start_service(platform, &network, definition, wiring)
            }))
            .await;

            let mut first_failure = None;
            for result in results {
                match result {
                    Ok(service) => environment.services.push(service),
                    Err(source) => {
                        if first_failure.is_none() {
                            first_failure = Some(source);
                        } else {
                            warn!(error = %source, "[sequencer.bring_up] additional service failure");
                        }
                    }
                }
            }
            if let Some(source) = first_failure {
                return Err(environment.fail(source).await);
            }
        } else {
            for (definition, wiring) in pairs {
                match start_service(platform, &network, definition, wiring).await {
                    Ok(service) => environment.services.push(service),
                    Err(source) => return Err(environment.fail(source).await),
                }
            }
        }

        if let Err(source) = environment.lifecycle.advance(Phase::ServicesReady) {
            return Err(environment.fail(source.into()).await);
        }

        info!(
            services = environment.services.len(),
            "[sequencer.bring_up] environment ready"
        );
        Ok(environment)
    }
}

/// Everything a successful bring-up created.
pub struct Environment<P: ContainerPlatform> {
    platform: Arc<P>,
    lifecycle: Lifecycle,
    network: Option<NetworkHandle>,
    broker: Option<BrokerInstance<P::Handle>>,
    database: Option<DatabaseInstance<P::Handle>>,
    services: Vec<ServiceInstance<P::Handle>>,
}

impl<P: ContainerPlatform> std::fmt::Debug for Environment<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("phase", &self.lifecycle.phase())
            .field("network", &self.network)
            .field("broker", &self.broker.as_ref().map(|b| b.instance().alias()))
            .field(
                "database",
                &self.database.as_ref().map(|d| d.instance().alias()),
            )
            .field(
                "services",
                &self.services.iter().map(ServiceInstance::alias).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<P: ContainerPlatform> Environment<P> {
    fn new(platform: Arc<P>) -> Self {
        Self {
            platform,
            lifecycle: Lifecycle::new(),
            network: None,
            broker: None,
            database: None,
            services: Vec::new(),
        }
    }

    /// Current phase.
    pub const fn phase(&self) -> Phase {
        self.lifecycle.phase()
    }

    /// Phases passed through, oldest first.
    pub fn history(&self) -> &[Phase] {
        self.lifecycle.history()
    }

    /// The run's network, until teardown.
    pub const fn network(&self) -> Option<&NetworkHandle> {
        self.network.as_ref()
    }

    /// The broker, until teardown.
    pub const fn broker(&self) -> Option<&BrokerInstance<P::Handle>> {
        self.broker.as_ref()
    }

    /// The database engine, until teardown.
    pub const fn database(&self) -> Option<&DatabaseInstance<P::Handle>> {
        self.database.as_ref()
    }

    /// Application services in start order, until teardown.
    pub fn services(&self) -> &[ServiceInstance<P::Handle>] {
        &self.services
    }

    /// Service with the given alias.
    pub fn service(&self, alias: &str) -> Option<&ServiceInstance<P::Handle>> {
        self.services
            .iter()
            .find(|service| service.alias().as_str() == alias)
    }

    /// Release everything and enter `Stopped`.
    ///
    /// Never fails; release errors are logged and reported. A second call
    /// releases nothing and returns an empty report.
    #[instrument(name = "sequencer.teardown", skip(self), fields(phase = %self.lifecycle.phase()))]
    pub async fn teardown(&mut self) -> TeardownReport {
        let report = self.release_all().await;
        if self.lifecycle.phase() == Phase::ServicesReady {
            if let Err(transition) = self.lifecycle.advance(Phase::Stopped) {
                error!(error = %transition, "[sequencer.teardown] could not enter stopped");
            }
        }
        report
    }

    async fn fail(mut self, source: SetupError) -> BringUpError {
        let reached = self.lifecycle.phase();
        error!(
            reached = %reached,
            error = %source,
            "[sequencer.bring_up] bring-up failed, releasing partial environment"
        );
        if let Err(transition) = self.lifecycle.advance(Phase::Failed) {
            error!(error = %transition, "[sequencer.bring_up] could not enter failed");
        }
        let teardown = self.release_all().await;
        BringUpError {
            source,
            reached,
            teardown,
        }
    }

    async fn release_all(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        let platform = self.platform.as_ref();

        let services: Vec<_> = self.services.drain(..).rev().collect();
        for service in services {
            let alias = service.alias().clone();
            release(platform, &alias, service.into_handle(), &mut report).await;
        }

        if let Some(database) = self.database.take() {
            let instance = database.into_instance();
            let alias = instance.alias().clone();
            release(platform, &alias, instance.into_handle(), &mut report).await;
        }

        if let Some(broker) = self.broker.take() {
            let instance = broker.into_instance();
            let alias = instance.alias().clone();
            release(platform, &alias, instance.into_handle(), &mut report).await;
        }

        if let Some(network) = self.network.take() {
            let name = network.name().to_string();
            if network.should_remove() {
                match platform.remove_network(&network).await {
                    Ok(()) => {
                        info!(network = %name, "[sequencer.teardown] network removed");
                        report.disposed.push(name);
                    }
                    Err(failure) => {
                        warn!(network = %name, error = %failure, "[sequencer.teardown] failed to remove network");
                        report.failures.push(failure);
                    }
                }
            } else {
                info!(network = %name, "[sequencer.teardown] network retained");
                report.retained.push(name);
            }
        }

        report
    }
}

impl<P: ContainerPlatform> Drop for Environment<P> {
    fn drop(&mut self) {
        if self.network.is_some()
            || self.broker.is_some()
            || self.database.is_some()
            || !self.services.is_empty()
        {
            warn!(
                phase = %self.lifecycle.phase(),
                "[sequencer.drop] environment dropped without teardown"
            );
        }
    }
}

async fn release<P: ContainerPlatform>(
    platform: &P,
    alias: &NetworkAlias,
    handle: P::Handle,
    report: &mut TeardownReport,
) {
    match platform.stop_container(alias, handle).await {
        Ok(()) => {
            info!(alias = %alias, "[sequencer.teardown] container released");
            report.disposed.push(alias.to_string());
        }
        Err(failure) => {
            warn!(alias = %alias, error = %failure, "[sequencer.teardown] failed to release container");
            report.failures.push(failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report_is_clean() {
        let report = TeardownReport::default();

        assert!(report.is_empty());
        assert!(report.is_clean());
    }

    #[test]
    fn report_with_failures_is_not_clean() {
        let report = TeardownReport {
            disposed: vec!["rabbitmq".to_string()],
            retained: Vec::new(),
            failures: vec![ProvisioningError::Disposal {
                resource: "postgres".to_string(),
                detail: "container is paused".to_string(),
            }],
        };

        assert!(!report.is_clean());
        assert!(!report.is_empty());
    }

    #[test]
    fn bring_up_error_names_the_phase_reached() {
        let error = BringUpError {
            source: SetupError::Provisioning(ProvisioningError::Disposal {
                resource: "x".to_string(),
                detail: "y".to_string(),
            }),
            reached: Phase::BrokerReady,
            teardown: TeardownReport::default(),
        };

        assert_eq!(
            error.to_string(),
            "environment bring-up failed after reaching broker_ready"
        );
    }
}
