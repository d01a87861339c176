//! tokio-postgres backed sessions.

use crate::error::HarnessError;
use crate::identifier::SchemaName;
use crate::result::ResultSet;
use crate::session::{with_connection, ConnectionConfig, Connector, Session, SessionError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use pg_session_harness_container::DatabaseEndpoint;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::Type;
use tokio_postgres::{Client, NoTls, Row, Statement};
use tracing::error;

/// Errors raised by [`PgSession`].
#[derive(Error, Debug)]
pub enum PgSessionError {
    /// PostgreSQL connection or query error.
    #[error("PostgreSQL error: {0}")]
    PostgreSQL(#[from] tokio_postgres::Error),

    /// The background connection task panicked or was cancelled.
    #[error("Connection task failed: {0}")]
    Driver(#[from] tokio::task::JoinError),

    /// A column type the text conversion does not handle.
    #[error("Unsupported type {type_name} for column '{column}'")]
    UnsupportedColumn { column: String, type_name: String },
}

impl SessionError for PgSessionError {
    fn sql_state(&self) -> Option<&SqlState> {
        match self {
            PgSessionError::PostgreSQL(e) => e.code(),
            _ => None,
        }
    }
}

/// Opens plain-TCP sessions with tokio-postgres.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

#[async_trait]
impl Connector for PgConnector {
    type Session = PgSession;

    async fn connect(&self, config: &ConnectionConfig) -> Result<PgSession, PgSessionError> {
        let (client, connection) = config.to_pg_config().connect(NoTls).await?;

        // The connection object performs the socket I/O and finishes once the
        // client is dropped.
        let driver = tokio::spawn(async move {
            let result = connection.await;
            if let Err(e) = &result {
                error!("PostgreSQL connection error: {}", e);
            }
            result
        });

        Ok(PgSession { client, driver })
    }
}

/// A single tokio-postgres connection and its driver task.
pub struct PgSession {
    client: Client,
    driver: JoinHandle<Result<(), tokio_postgres::Error>>,
}

#[async_trait]
impl Session for PgSession {
    type Statement = Statement;
    type Error = PgSessionError;

    async fn prepare(&mut self, sql: &str) -> Result<Statement, PgSessionError> {
        Ok(self.client.prepare(sql).await?)
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64, PgSessionError> {
        Ok(self.client.execute(statement, &[]).await?)
    }

    async fn query(&mut self, statement: &Statement) -> Result<ResultSet, PgSessionError> {
        let rows = self.client.query(statement, &[]).await?;
        let columns = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let rows = rows.iter().map(row_to_text).collect::<Result<_, _>>()?;
        Ok(ResultSet::new(columns, rows))
    }

    async fn close(self) -> Result<(), PgSessionError> {
        let PgSession { client, driver } = self;
        drop(client);
        driver.await??;
        Ok(())
    }
}

/// [`with_connection`] over a real PostgreSQL connection.
pub async fn with_pg_connection<T, F>(
    endpoint: &DatabaseEndpoint,
    schema: &SchemaName,
    work: F,
) -> Result<T, HarnessError>
where
    F: for<'s> FnOnce(&'s mut PgSession) -> BoxFuture<'s, Result<T, HarnessError>>,
{
    with_connection(&PgConnector, endpoint, schema, work).await
}

fn row_to_text(row: &Row) -> Result<Vec<Option<String>>, PgSessionError> {
    (0..row.len()).map(|idx| cell_to_text(row, idx)).collect()
}

/// Renders a cell the way psql would print it.
fn cell_to_text(row: &Row, idx: usize) -> Result<Option<String>, PgSessionError> {
    let column = &row.columns()[idx];
    let ty = column.type_();

    let text = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?
            .map(|b| if b { "t" } else { "f" }.to_string())
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?.map(|v| v.to_string())
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?.map(|v| v.to_string())
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(|v| v.to_string())
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?.map(|v| v.to_string())
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?.map(|v| v.to_string())
    } else if *ty == Type::OID {
        row.try_get::<_, Option<u32>>(idx)?.map(|v| v.to_string())
    } else if [Type::TEXT, Type::VARCHAR, Type::BPCHAR, Type::NAME, Type::UNKNOWN].contains(ty) {
        row.try_get::<_, Option<String>>(idx)?
    } else {
        return Err(PgSessionError::UnsupportedColumn {
            column: column.name().to_string(),
            type_name: ty.name().to_string(),
        });
    };

    Ok(text)
}
