//! Error types for environment bring-up, publishing, and assertions.
//!
//! Each concern has its own enum so callers can tell a container that never
//! came up (`StartupTimeoutError`) from a database that refused bootstrap DDL
//! (`BootstrapError`) or a broker that refused a message (`PublishError`).
//! The sequencer folds the provisioning-side errors into [`SetupError`].
//!
//! Teardown has no error type: disposal failures are logged and collected in
//! a [`crate::TeardownReport`] so one stuck container never blocks the rest.

use std::time::Duration;

use thiserror::Error;

use crate::types::{ImageRef, LogicalDatabase, NetworkAlias, NetworkName};

/// Creating or attaching a resource on the container platform failed.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// The network could not be created or attached.
    #[error("failed to provision network {network}: {detail}")]
    Network {
        /// Network being provisioned.
        network: NetworkName,
        /// Platform-reported reason.
        detail: String,
    },

    /// The container could not be created or started.
    #[error("failed to start {alias} from image {image}: {detail}")]
    ContainerStart {
        /// Alias of the container.
        alias: NetworkAlias,
        /// Image it was started from.
        image: ImageRef,
        /// Platform-reported reason.
        detail: String,
    },

    /// A mapped port was requested for a port the container does not publish.
    #[error("{alias} does not publish container port {port}")]
    PortNotExposed {
        /// Alias of the container.
        alias: NetworkAlias,
        /// Container-side port that was requested.
        port: u16,
    },

    /// A service was declared against a database nothing creates.
    #[error("service {service} needs database {database}, which the topology never creates")]
    UndeclaredDatabase {
        /// Alias of the service.
        service: NetworkAlias,
        /// Database it references.
        database: LogicalDatabase,
    },

    /// Two containers in one topology share an alias.
    #[error("alias {alias} is used by more than one container")]
    DuplicateAlias {
        /// The repeated alias.
        alias: NetworkAlias,
    },

    /// A service was handed a descriptor meant for the test process.
    #[error("service {service} was wired with an external descriptor for {database}")]
    ExternalDescriptor {
        /// Alias of the service.
        service: NetworkAlias,
        /// Database the descriptor points at.
        database: LogicalDatabase,
    },

    /// Releasing a resource failed.
    #[error("failed to dispose {resource}: {detail}")]
    Disposal {
        /// Name of the resource.
        resource: String,
        /// Platform-reported reason.
        detail: String,
    },
}

/// A container did not become ready within its startup budget.
///
/// Always fatal: the sequencer never retries a start.
#[derive(Debug, Error)]
#[error("{alias} was not ready after {waited:?} waiting for {strategy}")]
pub struct StartupTimeoutError {
    /// Alias of the container.
    pub alias: NetworkAlias,
    /// Budget that was exhausted.
    pub waited: Duration,
    /// Human readable readiness condition.
    pub strategy: String,
}

/// Creating logical databases failed; the database is unusable for this run.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The admin session could not be opened.
    #[error("failed to open admin session on {host}:{port} after {attempts} attempts")]
    Connection {
        /// Host that was dialled.
        host: String,
        /// Port that was dialled.
        port: u16,
        /// Connection attempts made.
        attempts: u32,
        /// Last driver error.
        #[source]
        source: sqlx::Error,
    },

    /// The engine already has a database with this name.
    #[error("logical database {database} already exists")]
    AlreadyExists {
        /// The duplicate database.
        database: LogicalDatabase,
    },

    /// The same name appeared twice in one bootstrap request.
    #[error("logical database {database} requested more than once")]
    DuplicateRequest {
        /// The repeated database.
        database: LogicalDatabase,
    },

    /// A DDL statement failed for another reason.
    #[error("`{statement}` failed")]
    Statement {
        /// The statement that failed.
        statement: String,
        /// Driver error.
        #[source]
        source: sqlx::Error,
    },

    /// A descriptor was requested for a database that bootstrap never created.
    #[error("logical database {database} has not been bootstrapped")]
    NotBootstrapped {
        /// The missing database.
        database: LogicalDatabase,
    },
}

/// Publishing to the broker failed outright.
///
/// An unroutable mandatory message is not an error; it comes back as
/// [`crate::PublishOutcome::Returned`].
#[derive(Debug, Error)]
pub enum PublishError {
    /// The AMQP connection could not be established.
    #[error("failed to connect to broker at {host}:{port}")]
    Connection {
        /// Broker host.
        host: String,
        /// Broker port.
        port: u16,
        /// Client error.
        #[source]
        source: lapin::Error,
    },

    /// A channel-level operation failed.
    #[error("broker operation `{operation}` failed")]
    Channel {
        /// Operation that failed.
        operation: &'static str,
        /// Client error.
        #[source]
        source: lapin::Error,
    },

    /// The broker negatively acknowledged the message.
    #[error("broker rejected message for exchange {exchange} with routing key {routing_key}")]
    Rejected {
        /// Target exchange.
        exchange: String,
        /// Routing key used.
        routing_key: String,
    },

    /// No consumer subscribed to the queue before the deadline.
    #[error("no consumer attached to queue {queue} within {waited:?}")]
    NoConsumer {
        /// Queue that was watched.
        queue: String,
        /// How long it was watched.
        waited: Duration,
    },
}

/// A business-level check did not hold.
#[derive(Debug, Error)]
pub enum AssertionFailure {
    /// The condition never became true before the deadline.
    #[error("{check} did not hold within {waited:?} after {attempts} attempts{}", last_error_suffix(.last_error.as_deref()))]
    Deadline {
        /// Description of the check.
        check: String,
        /// Time spent polling.
        waited: Duration,
        /// Number of probe invocations.
        attempts: u32,
        /// Last probe error, if the probe was failing rather than returning false.
        last_error: Option<String>,
    },

    /// A condition that must stay false became true.
    #[error("{check} unexpectedly held after {waited:?}")]
    UnexpectedlyHeld {
        /// Description of the check.
        check: String,
        /// Time until it held.
        waited: Duration,
    },
}

fn last_error_suffix(last_error: Option<&str>) -> String {
    last_error.map_or_else(String::new, |error| format!(" (last error: {error})"))
}

/// Any failure that aborts environment bring-up.
#[derive(Debug, Error)]
pub enum SetupError {
    /// A platform operation failed.
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    /// A container missed its readiness deadline.
    #[error(transparent)]
    StartupTimeout(#[from] StartupTimeoutError),

    /// Logical database creation failed.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    /// The sequencer attempted an out-of-order transition.
    #[error(transparent)]
    Lifecycle(#[from] crate::lifecycle::LifecycleError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_message_mentions_last_probe_error() {
        let failure = AssertionFailure::Deadline {
            check: "schema_testorganization exists".to_string(),
            waited: Duration::from_secs(3),
            attempts: 4,
            last_error: Some("connection refused".to_string()),
        };

        let message = failure.to_string();

        assert!(message.contains("schema_testorganization exists"));
        assert!(message.contains("4 attempts"));
        assert!(message.ends_with("(last error: connection refused)"));
    }

    #[test]
    fn deadline_message_without_probe_error_has_no_suffix() {
        let failure = AssertionFailure::Deadline {
            check: "article api responds".to_string(),
            waited: Duration::from_secs(1),
            attempts: 2,
            last_error: None,
        };

        assert!(failure.to_string().ends_with("2 attempts"));
    }

    #[test]
    fn setup_error_is_transparent_over_startup_timeout() {
        let alias = NetworkAlias::try_new("postgres").expect("valid alias");
        let error = SetupError::from(StartupTimeoutError {
            alias,
            waited: Duration::from_secs(60),
            strategy: "port 5432 open".to_string(),
        });

        assert_eq!(
            error.to_string(),
            "postgres was not ready after 60s waiting for port 5432 open"
        );
    }
}
