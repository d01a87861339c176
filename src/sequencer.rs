//! Ordered statement execution over one session.

use crate::error::HarnessError;
use crate::result::ResultSet;
use crate::session::{Session, SessionError};
use tracing::debug;

/// One SQL statement and whether it yields a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlOperation {
    sql: String,
    expects_rows: bool,
}

impl SqlOperation {
    /// A statement whose result set the caller inspects.
    pub fn query(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            expects_rows: true,
        }
    }

    /// A statement without a result set, such as DDL.
    pub fn statement(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            expects_rows: false,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn expects_rows(&self) -> bool {
        self.expects_rows
    }
}

/// What an operation produced, handed to the inspector before the
/// statement is released.
#[derive(Debug)]
pub enum Outcome<'a> {
    Rows(&'a ResultSet),
    Completed { rows_affected: u64 },
}

/// Executes `operations` in order on `session`.
///
/// Each outcome is passed to `inspect` together with the operation's
/// position. The prepared statement and its rows are dropped before the
/// next operation starts, including when `inspect` fails or panics. The
/// first failure stops the run and later operations are not prepared.
///
/// Returns the number of operations executed.
pub async fn run_sequence<S, F>(
    session: &mut S,
    operations: &[SqlOperation],
    mut inspect: F,
) -> Result<usize, HarnessError>
where
    S: Session,
    F: FnMut(usize, Outcome<'_>) -> Result<(), HarnessError>,
{
    for (position, operation) in operations.iter().enumerate() {
        debug!("Executing statement #{}: {}", position, operation.sql());
        let failed = |e: S::Error| HarnessError::Statement {
            position,
            sql: operation.sql().to_string(),
            code: e.sql_state().cloned(),
            source: Box::new(e),
        };

        let statement = session.prepare(operation.sql()).await.map_err(failed)?;
        if operation.expects_rows() {
            let rows = session.query(&statement).await.map_err(failed)?;
            debug!("Statement #{} returned {} row(s)", position, rows.len());
            inspect(position, Outcome::Rows(&rows))?;
        } else {
            let rows_affected = session.execute(&statement).await.map_err(failed)?;
            inspect(position, Outcome::Completed { rows_affected })?;
        }
    }

    Ok(operations.len())
}
