//! pg-session-harness
//!
//! Scoped PostgreSQL sessions for integration tests against a disposable
//! database instance.
//!
//! # Pieces
//!
//! - [`provision`]: starts a PostgreSQL container (or adopts an external
//!   server) and yields its [`DatabaseEndpoint`]
//! - [`with_connection`]: opens one session with a per-session current
//!   schema, runs a unit of work on it, and always closes it
//! - [`run_sequence`]: runs SQL operations in order on one session,
//!   stopping at the first failure
//! - [`scenarios`]: the database-name check and the custom-schema workflow
//!
//! # Example
//!
//! ```ignore
//! use pg_session_harness::{provision, scenarios, with_pg_connection, HarnessConfig};
//!
//! let config = HarnessConfig::default();
//! let instance = provision(&config).await?;
//! let name = with_pg_connection(instance.endpoint(), &config.schema, |session| {
//!     Box::pin(async move { scenarios::check_database_name(session, "mydb").await })
//! })
//! .await?;
//! ```

pub mod args;
pub mod config;
pub mod error;
pub mod identifier;
pub mod postgres;
pub mod provision;
pub mod result;
pub mod scenarios;
pub mod sequencer;
pub mod session;

// Make testing module available for integration tests
#[doc(hidden)]
pub mod testing;

pub use args::HarnessArgs;
pub use config::HarnessConfig;
pub use error::{BoxError, HarnessError};
pub use identifier::SchemaName;
pub use pg_session_harness_container::DatabaseEndpoint;
pub use postgres::{with_pg_connection, PgConnector, PgSession, PgSessionError};
pub use provision::{provision, ProvisionedInstance};
pub use result::ResultSet;
pub use scenarios::{run_scenario, Scenario};
pub use sequencer::{run_sequence, Outcome, SqlOperation};
pub use session::{with_connection, ConnectionConfig, Connector, Session, SessionError};
