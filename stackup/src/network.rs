//! Network provisioning.

use tracing::{info, instrument};

use crate::errors::ProvisioningError;
use crate::platform::ContainerPlatform;
use crate::types::NetworkName;

/// Requested network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    /// Network name.
    pub name: NetworkName,
    /// Adopt an existing network of this name and keep it after teardown.
    pub reuse: bool,
}

/// A network that exists for the duration of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandle {
    name: NetworkName,
    reuse: bool,
    created: bool,
}

impl NetworkHandle {
    /// Handle for a network this run created.
    pub fn created(spec: &NetworkSpec) -> Self {
        Self {
            name: spec.name.clone(),
            reuse: spec.reuse,
            created: true,
        }
    }

    /// Handle for a pre-existing network adopted under `spec.reuse`.
    pub fn adopted(spec: &NetworkSpec) -> Self {
        Self {
            name: spec.name.clone(),
            reuse: spec.reuse,
            created: false,
        }
    }

    /// Network name.
    pub const fn name(&self) -> &NetworkName {
        &self.name
    }

    /// Whether the network is meant to outlive this run.
    pub const fn reuse(&self) -> bool {
        self.reuse
    }

    /// Whether this run created the network.
    pub const fn was_created(&self) -> bool {
        self.created
    }

    /// Teardown removes the network only when this run created it and it is
    /// not marked for reuse.
    pub const fn should_remove(&self) -> bool {
        self.created && !self.reuse
    }
}

/// Create or adopt the network. No retries: a failure aborts the run.
#[instrument(name = "network.provision", skip(platform, spec), fields(network = %spec.name))]
pub async fn provision_network<P: ContainerPlatform>(
    platform: &P,
    spec: &NetworkSpec,
) -> Result<NetworkHandle, ProvisioningError> {
    let handle = platform.create_network(spec).await?;
    info!(
        network = %handle.name(),
        created = handle.was_created(),
        reuse = handle.reuse(),
        "[network.provision] network ready"
    );
    Ok(handle)
}
