//! Observations made from the test process: TCP reachability, schema
//! existence, HTTP status, and bounded polling over any of them.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use sqlx::{Connection, PgConnection};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, instrument};

use crate::descriptor::ConnectionDescriptor;
use crate::errors::AssertionFailure;
use crate::retry::{retry_until_deadline, Exhausted, PollPolicy};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const LINGER: Duration = Duration::from_millis(200);

struct Pending(Option<String>);

impl Display for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.as_deref().unwrap_or("condition not met"))
    }
}

/// A probe could not be evaluated.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Database query or connection failed.
    #[error("database probe failed")]
    Database(#[from] sqlx::Error),

    /// HTTP request failed before a status arrived.
    #[error("http probe failed")]
    Http(#[from] reqwest::Error),
}

/// Whether something is listening behind `host:port`.
///
/// A published Docker port accepts connections even when nothing listens
/// inside the container; the proxy then closes the socket straight away. A
/// connection that stays open for a short linger, or that yields data, counts
/// as open.
pub async fn is_port_open(host: &str, port: u16) -> bool {
    let Ok(Ok(mut stream)) = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await
    else {
        return false;
    };

    let mut buffer = [0_u8; 1];
    match timeout(LINGER, stream.read(&mut buffer)).await {
        Err(_still_open) => true,
        Ok(Ok(read)) => read > 0,
        Ok(Err(_)) => false,
    }
}

/// Poll [`is_port_open`] until it holds or `policy.deadline` passes.
#[instrument(name = "probe.port", skip(policy))]
pub async fn wait_for_port(
    host: &str,
    port: u16,
    policy: &PollPolicy,
) -> Result<(), Exhausted<String>> {
    retry_until_deadline(policy, "port open", || async {
        if is_port_open(host, port).await {
            Ok(())
        } else {
            Err(format!("{host}:{port} not accepting connections"))
        }
    })
    .await
}

/// `schema_<lowercased name>`, the schema a tenant-aware service creates
/// for an organization.
pub fn tenant_schema_name(organization: &str) -> String {
    format!("schema_{}", organization.to_lowercase())
}

/// Whether `schema` exists in the database behind `descriptor`.
pub async fn schema_exists(
    descriptor: &ConnectionDescriptor,
    schema: &str,
) -> Result<bool, ProbeError> {
    let mut connection = PgConnection::connect_with(&descriptor.pg_options()).await?;
    let exists = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
    )
    .bind(schema)
    .fetch_one(&mut connection)
    .await?;
    connection.close().await?;
    Ok(exists)
}

/// Number of tables in the `public` schema of the database behind `descriptor`.
pub async fn public_table_count(descriptor: &ConnectionDescriptor) -> Result<i64, ProbeError> {
    let mut connection = PgConnection::connect_with(&descriptor.pg_options()).await?;
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'public'",
    )
    .fetch_one(&mut connection)
    .await?;
    connection.close().await?;
    Ok(count)
}

/// HTTP GET probe, optionally authenticated with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl HttpProbe {
    /// Probe sending `Authorization: Bearer <token>` when a token is given.
    pub fn new(bearer_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            bearer_token,
        }
    }

    /// Status returned for `GET url`.
    pub async fn status(&self, url: &str) -> Result<StatusCode, ProbeError> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        debug!(url, status = %response.status(), "[probe.http] response received");
        Ok(response.status())
    }

    /// Whether `GET url` answers with a 2xx status.
    pub async fn succeeds(&self, url: &str) -> Result<bool, ProbeError> {
        Ok(self.status(url).await?.is_success())
    }
}

/// Poll `probe` under `policy` until it reports `true`.
///
/// Probe errors count as "not yet"; the last one is carried in the failure.
#[instrument(name = "probe.eventually", skip(policy, probe))]
pub async fn eventually<F, Fut, E>(
    check: &str,
    policy: &PollPolicy,
    mut probe: F,
) -> Result<(), AssertionFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: Display,
{
    let outcome = retry_until_deadline(policy, check, || {
        let observation = probe();
        async move {
            match observation.await {
                Ok(true) => Ok(()),
                Ok(false) => Err(Pending(None)),
                Err(error) => Err(Pending(Some(error.to_string()))),
            }
        }
    })
    .await;

    match outcome {
        Ok(()) => {
            info!(check, "[probe.eventually] condition held");
            Ok(())
        }
        Err(exhausted) => Err(AssertionFailure::Deadline {
            check: check.to_string(),
            waited: exhausted.waited,
            attempts: exhausted.attempts,
            last_error: exhausted.last_error.0,
        }),
    }
}

/// Poll `probe` every `interval` for `window` and fail as soon as it reports
/// `true`. Probe errors count as "still false".
#[instrument(name = "probe.stays_false", skip(probe))]
pub async fn stays_false<F, Fut, E>(
    check: &str,
    window: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<(), AssertionFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: Display,
{
    let started = Instant::now();
    loop {
        match probe().await {
            Ok(true) => {
                return Err(AssertionFailure::UnexpectedlyHeld {
                    check: check.to_string(),
                    waited: started.elapsed(),
                });
            }
            Ok(false) => {}
            Err(error) => debug!(check, error = %error, "[probe.stays_false] probe failed"),
        }

        let remaining = window.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            info!(check, "[probe.stays_false] condition stayed false");
            return Ok(());
        }
        sleep(interval.min(remaining)).await;
    }
}
