//! Started containers and the shared start routine.

use std::collections::BTreeMap;

use tokio::time::timeout;
use tracing::{info, instrument, warn};

use crate::errors::{ProvisioningError, SetupError, StartupTimeoutError};
use crate::network::NetworkHandle;
use crate::platform::{ContainerPlatform, StartedContainer};
use crate::types::{ContainerSpec, ImageRef, InstanceKind, NetworkAlias};

/// A container that started and passed its readiness wait.
#[derive(Debug)]
pub struct ServiceInstance<H> {
    kind: InstanceKind,
    image: ImageRef,
    alias: NetworkAlias,
    host: String,
    ports: BTreeMap<u16, u16>,
    handle: H,
}

impl<H> ServiceInstance<H> {
    pub(crate) fn from_started(spec: &ContainerSpec, started: StartedContainer<H>) -> Self {
        Self {
            kind: spec.kind,
            image: spec.image.clone(),
            alias: spec.alias.clone(),
            host: started.host,
            ports: started.ports,
            handle: started.handle,
        }
    }

    /// Role of the container.
    pub const fn kind(&self) -> InstanceKind {
        self.kind
    }

    /// Image the container runs.
    pub const fn image(&self) -> &ImageRef {
        &self.image
    }

    /// Name other containers use to reach this one.
    pub const fn alias(&self) -> &NetworkAlias {
        &self.alias
    }

    /// Host on which mapped ports are reachable from the test process.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Host port bound to `internal`.
    pub fn mapped_port(&self, internal: u16) -> Result<u16, ProvisioningError> {
        self.ports
            .get(&internal)
            .copied()
            .ok_or_else(|| ProvisioningError::PortNotExposed {
                alias: self.alias.clone(),
                port: internal,
            })
    }

    /// `http://host:mapped` for the container port `internal`.
    pub fn base_url(&self, internal: u16) -> Result<String, ProvisioningError> {
        Ok(format!("http://{}:{}", self.host, self.mapped_port(internal)?))
    }

    pub(crate) fn into_handle(self) -> H {
        self.handle
    }
}

/// Start `spec` on `network`, bounding start plus readiness by
/// `spec.startup_timeout`.
#[instrument(
    name = "container.start",
    skip(platform, network, spec),
    fields(alias = %spec.alias, image = %spec.image, kind = %spec.kind)
)]
pub(crate) async fn launch<P: ContainerPlatform>(
    platform: &P,
    network: &NetworkHandle,
    spec: &ContainerSpec,
) -> Result<ServiceInstance<P::Handle>, SetupError> {
    info!(
        wait = %spec.wait,
        timeout = ?spec.startup_timeout,
        "[container.start] starting container"
    );

    let started = match timeout(spec.startup_timeout, platform.start_container(network, spec)).await
    {
        Ok(result) => result?,
        Err(_elapsed) => {
            warn!(
                timeout = ?spec.startup_timeout,
                "[container.start] readiness deadline exceeded"
            );
            return Err(StartupTimeoutError {
                alias: spec.alias.clone(),
                waited: spec.startup_timeout,
                strategy: spec.wait.to_string(),
            }
            .into());
        }
    };

    let instance = ServiceInstance::from_started(spec, started);
    info!(
        host = %instance.host(),
        ports = ?instance.ports,
        "[container.start] container ready"
    );
    Ok(instance)
}
