//! Disposable PostgreSQL instances for integration tests.
//!
//! A [`PostgresContainer`] drives the Docker CLI to run a throwaway
//! PostgreSQL server and hands out a [`DatabaseEndpoint`] once the server
//! accepts connections:
//!
//! ```ignore
//! use pg_session_harness_container::PostgresContainer;
//!
//! let mut container = PostgresContainer::new("orders-it").with_database_name("mydb");
//! container.start()?;
//! let endpoint = container.wait_until_ready(Duration::from_secs(60)).await?;
//! ```

mod container;
mod endpoint;

pub use container::{parse_port_output, PostgresContainer, DEFAULT_IMAGE, POSTGRES_PORT};
pub use endpoint::DatabaseEndpoint;
