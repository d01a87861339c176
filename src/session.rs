//! Connection scopes.
//!
//! [`with_connection`] opens one session per unit of work, configured with
//! the endpoint's credentials and a per-session search path, and closes it
//! exactly once however the work ends.

use crate::error::HarnessError;
use crate::identifier::SchemaName;
use crate::result::ResultSet;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use pg_session_harness_container::DatabaseEndpoint;
use std::panic::AssertUnwindSafe;
use tokio_postgres::error::SqlState;
use tokio_postgres::Config as PostgresConfig;
use tracing::{debug, warn};

/// `application_name` reported to the server for every harness session
pub const APPLICATION_NAME: &str = "pg-session-harness";

/// Error type of a [`Session`] implementation.
pub trait SessionError: std::error::Error + Send + Sync + 'static {
    /// SQLSTATE of a server-reported error, if any.
    fn sql_state(&self) -> Option<&SqlState>;
}

/// A live client connection.
///
/// Statements are prepared explicitly so the sequencer controls when
/// statement-level resources are released (by dropping the statement).
#[async_trait]
pub trait Session: Send {
    type Statement: Send + Sync;
    type Error: SessionError;

    async fn prepare(&mut self, sql: &str) -> Result<Self::Statement, Self::Error>;

    /// Runs a statement that produces no result set.
    async fn execute(&mut self, statement: &Self::Statement) -> Result<u64, Self::Error>;

    async fn query(&mut self, statement: &Self::Statement) -> Result<ResultSet, Self::Error>;

    /// Terminates the connection. Consumes the session so it cannot be reused.
    async fn close(self) -> Result<(), Self::Error>;
}

/// Opens sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Session;

    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Self::Session, <Self::Session as Session>::Error>;
}

/// What a single connection request needs: where to connect and which
/// schema unqualified names resolve to.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    endpoint: DatabaseEndpoint,
    schema: SchemaName,
}

impl ConnectionConfig {
    pub fn new(endpoint: &DatabaseEndpoint, schema: SchemaName) -> Self {
        Self {
            endpoint: endpoint.clone(),
            schema,
        }
    }

    pub fn endpoint(&self) -> &DatabaseEndpoint {
        &self.endpoint
    }

    pub fn schema(&self) -> &SchemaName {
        &self.schema
    }

    /// tokio-postgres config with the session search path set to the schema.
    pub fn to_pg_config(&self) -> PostgresConfig {
        let mut config = self.endpoint.to_pg_config();
        config
            .options(&format!("-c search_path={}", self.schema))
            .application_name(APPLICATION_NAME);
        config
    }
}

/// Runs `work` on a fresh session and closes the session afterwards.
///
/// The session is closed exactly once whether `work` returns `Ok`, returns
/// `Err`, or panics; a panic is resumed after the close. A connect failure
/// is returned as [`HarnessError::Connect`] without retrying. When both the
/// work and the close fail, the work's error is returned.
pub async fn with_connection<C, T, F>(
    connector: &C,
    endpoint: &DatabaseEndpoint,
    schema: &SchemaName,
    work: F,
) -> Result<T, HarnessError>
where
    C: Connector,
    F: for<'s> FnOnce(&'s mut C::Session) -> BoxFuture<'s, Result<T, HarnessError>>,
{
    let config = ConnectionConfig::new(endpoint, schema.clone());
    let mut session = connector
        .connect(&config)
        .await
        .map_err(|e| HarnessError::Connect {
            target: endpoint.to_string(),
            code: e.sql_state().cloned(),
            source: Box::new(e),
        })?;
    debug!("Opened session to {} (search_path={})", endpoint, schema);

    let outcome = AssertUnwindSafe(work(&mut session)).catch_unwind().await;
    let closed = session.close().await;
    debug!("Closed session to {}", endpoint);

    match outcome {
        Ok(Ok(value)) => {
            closed.map_err(|e| HarnessError::Close(Box::new(e)))?;
            Ok(value)
        }
        Ok(Err(err)) => {
            if let Err(e) = closed {
                warn!("Failed to close session after error: {}", e);
            }
            Err(err)
        }
        Err(panic) => {
            if let Err(e) = closed {
                warn!("Failed to close session after panic: {}", e);
            }
            std::panic::resume_unwind(panic)
        }
    }
}
