//! Error types for the session harness.

use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Boxed error from a database driver or session implementation.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while provisioning, connecting, or running statements.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// The database instance never became ready. Fatal to the whole suite.
    #[error("Provisioning failed: {0:#}")]
    Provision(anyhow::Error),

    /// Opening a client connection failed (network or authentication).
    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: String,
        code: Option<SqlState>,
        #[source]
        source: BoxError,
    },

    /// A statement failed; the remaining operations of the sequence were skipped.
    #[error("Statement #{position} failed: {sql}: {source}")]
    Statement {
        position: usize,
        sql: String,
        code: Option<SqlState>,
        #[source]
        source: BoxError,
    },

    /// An observed value did not match the expected one.
    #[error("Expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },

    /// Closing the connection failed after the work itself succeeded.
    #[error("Failed to close connection: {0}")]
    Close(#[source] BoxError),

    /// An identifier was rejected before being placed into SQL text.
    #[error("Invalid identifier '{0}'")]
    InvalidIdentifier(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl HarnessError {
    pub(crate) fn mismatch(expected: impl ToString, actual: impl ToString) -> Self {
        HarnessError::Mismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// SQLSTATE reported by the server for connect and statement failures.
    pub fn sql_state(&self) -> Option<&SqlState> {
        match self {
            HarnessError::Connect { code, .. } | HarnessError::Statement { code, .. } => {
                code.as_ref()
            }
            _ => None,
        }
    }

    /// True when a statement referenced a relation that does not exist.
    pub fn is_undefined_table(&self) -> bool {
        self.sql_state() == Some(&SqlState::UNDEFINED_TABLE)
    }
}
