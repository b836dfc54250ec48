//! Run configuration, read from `STACKUP_*` environment variables.
//!
//! | variable | default |
//! |---|---|
//! | `STACKUP_NETWORK` | `test-network` |
//! | `STACKUP_REUSE_NETWORK` | `false` |
//! | `STACKUP_BROKER_IMAGE` | `rabbitmq:3-management` |
//! | `STACKUP_POSTGRES_IMAGE` | `postgres:16-alpine` |
//! | `STACKUP_SERVICE_REGISTRY` | `casgoorman` |
//! | `STACKUP_SERVICE_TAG` | `latest` |
//! | `STACKUP_STARTUP_TIMEOUT_SECS` | `120` (1..=900) |
//! | `STACKUP_SETTLE_DEADLINE_SECS` | `60` (1..=1800) |
//! | `STACKUP_PARALLEL_SERVICES` | `true` |
//! | `STACKUP_BEARER_TOKEN` | unset |

use std::time::Duration;

use nutype::nutype;
use thiserror::Error;

use crate::types::{ImageRef, NetworkName};

/// Start plus readiness budget per container, in seconds.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 900),
    default = 120,
    derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Into)
)]
pub struct StartupTimeoutSecs(u64);

/// How long business-level checks may poll before failing, in seconds.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1800),
    default = 60,
    derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Into)
)]
pub struct SettleDeadlineSecs(u64);

/// A configuration variable held a value that could not be used.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{variable}={value:?} is invalid: {reason}")]
pub struct ConfigError {
    /// Variable name.
    pub variable: &'static str,
    /// Offending value.
    pub value: String,
    /// What is wrong with it.
    pub reason: String,
}

/// Everything about a run that may vary between machines.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Network all containers join.
    pub network: NetworkName,
    /// Adopt an existing network of that name and keep it afterwards.
    pub reuse_network: bool,
    /// Broker image.
    pub broker_image: ImageRef,
    /// Database engine image.
    pub postgres_image: ImageRef,
    /// Registry or namespace the service images live under.
    pub service_registry: String,
    /// Tag applied to every service image.
    pub service_tag: String,
    /// Per-container startup budget.
    pub startup_timeout: StartupTimeoutSecs,
    /// Budget for eventually-consistent checks.
    pub settle_deadline: SettleDeadlineSecs,
    /// Start application services concurrently.
    pub parallel_services: bool,
    /// Token sent with authenticated HTTP checks.
    pub bearer_token: Option<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            network: NetworkName::default(),
            reuse_network: false,
            broker_image: ImageRef::from_parts("rabbitmq", "3-management"),
            postgres_image: ImageRef::from_parts("postgres", "16-alpine"),
            service_registry: "casgoorman".to_string(),
            service_tag: "latest".to_string(),
            startup_timeout: StartupTimeoutSecs::default(),
            settle_deadline: SettleDeadlineSecs::default(),
            parallel_services: true,
            bearer_token: None,
        }
    }
}

impl EnvironmentConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|variable| std::env::var(variable).ok())
    }

    /// Read variables through `lookup`; unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("STACKUP_NETWORK") {
            config.network = NetworkName::try_new(value.clone())
                .map_err(|error| invalid("STACKUP_NETWORK", value, error))?;
        }
        if let Some(value) = lookup("STACKUP_REUSE_NETWORK") {
            config.reuse_network = parse_flag("STACKUP_REUSE_NETWORK", value)?;
        }
        if let Some(value) = lookup("STACKUP_BROKER_IMAGE") {
            config.broker_image = ImageRef::parse(&value)
                .map_err(|error| invalid("STACKUP_BROKER_IMAGE", value, error))?;
        }
        if let Some(value) = lookup("STACKUP_POSTGRES_IMAGE") {
            config.postgres_image = ImageRef::parse(&value)
                .map_err(|error| invalid("STACKUP_POSTGRES_IMAGE", value, error))?;
        }
        if let Some(value) = lookup("STACKUP_SERVICE_REGISTRY") {
            config.service_registry = non_empty("STACKUP_SERVICE_REGISTRY", value)?;
        }
        if let Some(value) = lookup("STACKUP_SERVICE_TAG") {
            config.service_tag = non_empty("STACKUP_SERVICE_TAG", value)?;
        }
        if let Some(value) = lookup("STACKUP_STARTUP_TIMEOUT_SECS") {
            let seconds = parse_seconds("STACKUP_STARTUP_TIMEOUT_SECS", &value)?;
            config.startup_timeout = StartupTimeoutSecs::try_new(seconds)
                .map_err(|error| invalid("STACKUP_STARTUP_TIMEOUT_SECS", value, error))?;
        }
        if let Some(value) = lookup("STACKUP_SETTLE_DEADLINE_SECS") {
            let seconds = parse_seconds("STACKUP_SETTLE_DEADLINE_SECS", &value)?;
            config.settle_deadline = SettleDeadlineSecs::try_new(seconds)
                .map_err(|error| invalid("STACKUP_SETTLE_DEADLINE_SECS", value, error))?;
        }
        if let Some(value) = lookup("STACKUP_PARALLEL_SERVICES") {
            config.parallel_services = parse_flag("STACKUP_PARALLEL_SERVICES", value)?;
        }
        config.bearer_token = lookup("STACKUP_BEARER_TOKEN").filter(|token| !token.is_empty());

        Ok(config)
    }

    /// Per-container startup budget.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout.into_inner())
    }

    /// Budget for eventually-consistent checks.
    pub fn settle_deadline(&self) -> Duration {
        Duration::from_secs(self.settle_deadline.into_inner())
    }

    /// `<registry>/<service>:<tag>`
    pub fn service_image(&self, service: &str) -> ImageRef {
        ImageRef::from_parts(
            &format!("{}/{service}", self.service_registry),
            &self.service_tag,
        )
    }
}

fn invalid(variable: &'static str, value: String, reason: impl ToString) -> ConfigError {
    ConfigError {
        variable,
        value,
        reason: reason.to_string(),
    }
}

fn parse_flag(variable: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(variable, value, "expected true or false")),
    }
}

fn parse_seconds(variable: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|error| invalid(variable, value.to_string(), error))
}

fn non_empty(variable: &'static str, value: String) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid(variable, value, "must not be empty"));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn unset_environment_yields_defaults() {
        let config = EnvironmentConfig::from_lookup(lookup(&[])).expect("defaults are valid");

        assert_eq!(config.network.to_string(), "test-network");
        assert_eq!(config.broker_image.to_string(), "rabbitmq:3-management");
        assert_eq!(config.postgres_image.to_string(), "postgres:16-alpine");
        assert_eq!(config.startup_timeout(), Duration::from_secs(120));
        assert_eq!(config.settle_deadline(), Duration::from_secs(60));
        assert!(config.parallel_services);
        assert!(!config.reuse_network);
        assert!(config.bearer_token.is_none());
    }

    #[test]
    fn variables_override_defaults() {
        let config = EnvironmentConfig::from_lookup(lookup(&[
            ("STACKUP_NETWORK", "ci-net"),
            ("STACKUP_REUSE_NETWORK", "yes"),
            ("STACKUP_SERVICE_REGISTRY", "registry.local:5000/erp"),
            ("STACKUP_SERVICE_TAG", "pr-42"),
            ("STACKUP_STARTUP_TIMEOUT_SECS", "300"),
            ("STACKUP_PARALLEL_SERVICES", "false"),
            ("STACKUP_BEARER_TOKEN", "abc.def.ghi"),
        ]))
        .expect("valid overrides");

        assert_eq!(config.network.to_string(), "ci-net");
        assert!(config.reuse_network);
        assert_eq!(config.startup_timeout(), Duration::from_secs(300));
        assert!(!config.parallel_services);
        assert_eq!(config.bearer_token.as_deref(), Some("abc.def.ghi"));
        assert_eq!(
            config.service_image("articleservice").to_string(),
            "registry.local:5000/erp/articleservice:pr-42"
        );
    }

    #[test]
    fn out_of_range_timeout_is_rejected() {
        let error = EnvironmentConfig::from_lookup(lookup(&[(
            "STACKUP_STARTUP_TIMEOUT_SECS",
            "0",
        )]))
        .expect_err("zero is below the minimum");

        assert_eq!(error.variable, "STACKUP_STARTUP_TIMEOUT_SECS");
    }

    #[test]
    fn non_numeric_deadline_is_rejected() {
        let error = EnvironmentConfig::from_lookup(lookup(&[(
            "STACKUP_SETTLE_DEADLINE_SECS",
            "soon",
        )]))
        .expect_err("not a number");

        assert_eq!(error.variable, "STACKUP_SETTLE_DEADLINE_SECS");
        assert_eq!(error.value, "soon");
    }

    #[test]
    fn unrecognised_flag_is_rejected() {
        let error = EnvironmentConfig::from_lookup(lookup(&[("STACKUP_REUSE_NETWORK", "maybe")]))
            .expect_err("not a flag");

        assert!(error.to_string().contains("expected true or false"));
    }

    #[test]
    fn invalid_network_name_is_rejected() {
        let error = EnvironmentConfig::from_lookup(lookup(&[("STACKUP_NETWORK", "has space")]))
            .expect_err("spaces are not allowed");

        assert_eq!(error.variable, "STACKUP_NETWORK");
    }

    #[test]
    fn empty_bearer_token_counts_as_unset() {
        let config = EnvironmentConfig::from_lookup(lookup(&[("STACKUP_BEARER_TOKEN", "")]))
            .expect("valid");

        assert!(config.bearer_token.is_none());
    }
}
