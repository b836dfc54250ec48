//! The seam between the sequencer and whatever actually runs containers.
//!
//! Implementations:
//! - `stackup-testcontainers`: Docker, through `testcontainers` and `bollard`
//! - `stackup-memory`: in-memory fake with failure injection, for tests

use std::collections::BTreeMap;
use std::future::Future;

use crate::descriptor::ConnectionDescriptor;
use crate::errors::{BootstrapError, ProvisioningError, SetupError};
use crate::network::{NetworkHandle, NetworkSpec};
use crate::types::{ContainerSpec, LogicalDatabase, NetworkAlias};

/// A container the platform reports as started and ready.
///
/// Host ports are resolved before this value exists, which is what makes a
/// mapped-port lookup before start impossible.
#[derive(Debug)]
pub struct StartedContainer<H> {
    /// Platform handle used later to stop the container.
    pub handle: H,
    /// Host on which mapped ports are reachable from the test process.
    pub host: String,
    /// Container port to host port, one entry per published port.
    pub ports: BTreeMap<u16, u16>,
}

/// Container engine operations the provisioners need.
pub trait ContainerPlatform: Send + Sync {
    /// Handle identifying a running container.
    type Handle: Send + Sync;

    /// Create the network, or adopt an existing one when `spec.reuse` is set.
    fn create_network(
        &self,
        spec: &NetworkSpec,
    ) -> impl Future<Output = Result<NetworkHandle, ProvisioningError>> + Send;

    /// Remove a network this run created.
    fn remove_network(
        &self,
        network: &NetworkHandle,
    ) -> impl Future<Output = Result<(), ProvisioningError>> + Send;

    /// Start a container on `network` and block until `spec.wait` is met.
    ///
    /// Implementations may report their own readiness timeout; the caller
    /// additionally bounds the whole call by `spec.startup_timeout`.
    fn start_container(
        &self,
        network: &NetworkHandle,
        spec: &ContainerSpec,
    ) -> impl Future<Output = Result<StartedContainer<Self::Handle>, SetupError>> + Send;

    /// Stop and remove a container.
    fn stop_container(
        &self,
        alias: &NetworkAlias,
        handle: Self::Handle,
    ) -> impl Future<Output = Result<(), ProvisioningError>> + Send;
}

/// Runs bootstrap DDL against the database engine.
pub trait DatabaseAdmin: Send + Sync {
    /// Create every database in `databases`, in order, within one admin
    /// session opened with `admin` and closed before returning.
    fn create_databases(
        &self,
        admin: &ConnectionDescriptor,
        databases: &[LogicalDatabase],
    ) -> impl Future<Output = Result<(), BootstrapError>> + Send;
}
