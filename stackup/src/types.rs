//! Vocabulary shared by every provisioner.
//!
//! Names that end up in container-engine calls or SQL are validated at
//! construction with `nutype`, so an invalid alias or database name never
//! reaches Docker or PostgreSQL.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use nutype::nutype;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validation::{is_container_name, is_sql_identifier, is_uri_safe};

/// Name of a container network.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 63, predicate = is_container_name),
    default = "test-network",
    derive(
        Debug,
        Default,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct NetworkName(String);

/// Hostname under which a container is reachable from the other containers
/// on the same network.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 63, predicate = is_container_name),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct NetworkAlias(String);

/// A database hosted inside the database engine, created by bootstrap DDL.
///
/// Restricted to lowercase identifiers so the name never needs escaping
/// beyond plain double quotes and survives PostgreSQL case folding.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 63, predicate = is_sql_identifier),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct LogicalDatabase(String);

/// Errors raised while parsing an image reference.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageRefError {
    /// The reference was empty or had an empty repository or tag part.
    #[error("invalid image reference `{0}`")]
    Malformed(String),
}

/// A container image, `repository:tag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    name: String,
    tag: String,
}

impl ImageRef {
    /// Parse `name[:tag]`; the tag defaults to `latest`.
    ///
    /// A colon that belongs to a registry port (`localhost:5000/app`) is not
    /// mistaken for the tag separator.
    pub fn parse(reference: &str) -> Result<Self, ImageRefError> {
        let reference = reference.trim();
        let last_segment_start = reference.rfind('/').map_or(0, |index| index + 1);
        let (name, tag) = match reference[last_segment_start..].rfind(':') {
            Some(offset) => {
                let split = last_segment_start + offset;
                (&reference[..split], &reference[split + 1..])
            }
            None => (reference, "latest"),
        };

        if name.is_empty() || tag.is_empty() || name.ends_with('/') {
            return Err(ImageRefError::Malformed(reference.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Image from already-split parts. Neither part may be empty.
    pub(crate) fn from_parts(name: &str, tag: &str) -> Self {
        Self {
            name: name.to_string(),
            tag: tag.to_string(),
        }
    }

    /// Repository part, including any registry prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tag part.
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// Errors raised while constructing [`Credentials`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialsError {
    /// Username was empty or contained characters that would need URI escaping.
    #[error("username must be non-empty and URI-safe")]
    InvalidUsername,
    /// Password was empty or contained characters that would need URI escaping.
    #[error("password must be non-empty and URI-safe")]
    InvalidPassword,
}

/// Username/password pair for the broker or the database engine.
///
/// Both parts are restricted to URI-unreserved characters so they can be
/// embedded in `amqp://` and `postgres://` URIs verbatim.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Validate and build a credential pair.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, CredentialsError> {
        let username = username.into();
        let password = password.into();
        if !is_uri_safe(&username) {
            return Err(CredentialsError::InvalidUsername);
        }
        if !is_uri_safe(&password) {
            return Err(CredentialsError::InvalidPassword);
        }
        Ok(Self { username, password })
    }

    /// The username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The password.
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How a container port is published on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortBinding {
    /// Published on a host port chosen by the engine at start time.
    Ephemeral(u16),
    /// Published on a fixed host port.
    Fixed {
        /// Port inside the container.
        internal: u16,
        /// Port on the host.
        host: u16,
    },
}

impl PortBinding {
    /// Port inside the container.
    pub const fn internal(self) -> u16 {
        match self {
            Self::Ephemeral(port) | Self::Fixed { internal: port, .. } => port,
        }
    }
}

/// Output stream a readiness message is expected on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Readiness policy applied after a container starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Return as soon as the engine reports the container running.
    None,
    /// Block until the given container port accepts TCP connections.
    PortOpen(u16),
    /// Block until the container logs the message.
    LogMessage {
        /// Stream to watch.
        stream: LogStream,
        /// Text to wait for.
        message: String,
    },
}

impl fmt::Display for WaitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "no readiness wait"),
            Self::PortOpen(port) => write!(f, "port {port} open"),
            Self::LogMessage { message, .. } => write!(f, "log message `{message}`"),
        }
    }
}

/// What role a started container plays in the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceKind {
    /// The message broker.
    Broker,
    /// The relational database engine.
    Database,
    /// An application service under test.
    Application,
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broker => write!(f, "broker"),
            Self::Database => write!(f, "database"),
            Self::Application => write!(f, "application"),
        }
    }
}

/// Everything a platform needs to start one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Role of the container.
    pub kind: InstanceKind,
    /// Image to run.
    pub image: ImageRef,
    /// Container name and network alias.
    pub alias: NetworkAlias,
    /// Environment variables passed to the container.
    pub env: BTreeMap<String, String>,
    /// Ports to publish.
    pub ports: Vec<PortBinding>,
    /// Readiness policy.
    pub wait: WaitStrategy,
    /// Upper bound on start plus readiness wait.
    pub startup_timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_reference_defaults_tag_to_latest() {
        let image = ImageRef::parse("casgoorman/articleservice").expect("valid image");

        assert_eq!(image.name(), "casgoorman/articleservice");
        assert_eq!(image.tag(), "latest");
    }

    #[test]
    fn image_reference_keeps_registry_port_in_name() {
        let image = ImageRef::parse("localhost:5000/orders:1.2").expect("valid image");

        assert_eq!(image.name(), "localhost:5000/orders");
        assert_eq!(image.tag(), "1.2");
        assert_eq!(image.to_string(), "localhost:5000/orders:1.2");
    }

    #[test]
    fn image_reference_rejects_empty_tag() {
        assert!(ImageRef::parse("rabbitmq:").is_err());
        assert!(ImageRef::parse("   ").is_err());
    }

    #[test]
    fn credentials_reject_uri_delimiters() {
        assert_eq!(
            Credentials::new("test@user", "secret").unwrap_err(),
            CredentialsError::InvalidUsername
        );
        assert_eq!(
            Credentials::new("testuser", "pa:ss").unwrap_err(),
            CredentialsError::InvalidPassword
        );
    }

    #[test]
    fn credentials_debug_output_hides_password() {
        let credentials = Credentials::new("testuser", "testpassword").expect("valid credentials");

        let rendered = format!("{credentials:?}");

        assert!(rendered.contains("testuser"));
        assert!(!rendered.contains("testpassword"));
    }

    #[test]
    fn logical_database_rejects_mixed_case_and_quotes() {
        assert!(LogicalDatabase::try_new("orders").is_ok());
        assert!(LogicalDatabase::try_new("Orders").is_err());
        assert!(LogicalDatabase::try_new("orders\"; DROP").is_err());
        assert!(LogicalDatabase::try_new("1orders").is_err());
    }

    #[test]
    fn port_binding_reports_container_side_port() {
        assert_eq!(PortBinding::Ephemeral(5672).internal(), 5672);
        assert_eq!(
            PortBinding::Fixed {
                internal: 15672,
                host: 15673
            }
            .internal(),
            15672
        );
    }
}
