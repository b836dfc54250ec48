//! Bootstrap DDL against a live PostgreSQL engine.

use sqlx::{Connection, PgConnection};
use tracing::{info, instrument, warn};

use crate::descriptor::ConnectionDescriptor;
use crate::errors::BootstrapError;
use crate::platform::DatabaseAdmin;
use crate::retry::{retry_until_deadline, PollPolicy};
use crate::types::LogicalDatabase;

/// SQLSTATE for `duplicate_database`.
const DUPLICATE_DATABASE: &str = "42P04";

/// [`DatabaseAdmin`] over a single `sqlx` connection.
///
/// `CREATE DATABASE` cannot run inside a transaction block, so statements are
/// issued one at a time on the same session.
#[derive(Debug, Clone)]
pub struct PostgresAdmin {
    connect_policy: PollPolicy,
}

impl Default for PostgresAdmin {
    fn default() -> Self {
        Self::new(PollPolicy::connection())
    }
}

impl PostgresAdmin {
    /// Admin that retries the initial connection under `connect_policy`.
    pub const fn new(connect_policy: PollPolicy) -> Self {
        Self { connect_policy }
    }

    async fn connect(&self, admin: &ConnectionDescriptor) -> Result<PgConnection, BootstrapError> {
        let options = admin.pg_options();
        retry_until_deadline(&self.connect_policy, "admin connect", || {
            PgConnection::connect_with(&options)
        })
        .await
        .map_err(|exhausted| BootstrapError::Connection {
            host: admin.host().to_string(),
            port: admin.port(),
            attempts: exhausted.attempts,
            source: exhausted.last_error,
        })
    }
}

impl DatabaseAdmin for PostgresAdmin {
    #[instrument(
        name = "postgres.create_databases",
        skip_all,
        fields(host = %admin.host(), port = admin.port(), count = databases.len())
    )]
    async fn create_databases(
        &self,
        admin: &ConnectionDescriptor,
        databases: &[LogicalDatabase],
    ) -> Result<(), BootstrapError> {
        let mut connection = self.connect(admin).await?;

        for database in databases {
            let statement = format!("CREATE DATABASE \"{database}\"");
            if let Err(source) = sqlx::query(&statement).execute(&mut connection).await {
                let _ = connection.close().await;
                return Err(classify(database, statement, source));
            }
            info!(database = %database, "[postgres.create_databases] database created");
        }

        if let Err(error) = connection.close().await {
            warn!(error = %error, "[postgres.create_databases] admin session did not close cleanly");
        }
        Ok(())
    }
}

fn classify(database: &LogicalDatabase, statement: String, source: sqlx::Error) -> BootstrapError {
    let duplicate = source
        .as_database_error()
        .and_then(|error| error.code())
        .is_some_and(|code| code == DUPLICATE_DATABASE);

    if duplicate {
        BootstrapError::AlreadyExists {
            database: database.clone(),
        }
    } else {
        BootstrapError::Statement { statement, source }
    }
}
