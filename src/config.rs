//! Harness configuration.

use crate::identifier::SchemaName;
use pg_session_harness_container::DEFAULT_IMAGE;
use std::time::Duration;

pub const DEFAULT_DATABASE_NAME: &str = "mydb";
pub const DEFAULT_SCHEMA: &str = "myschema";
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything needed to provision an instance and run the scenarios.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Docker image for the disposable instance
    pub image: String,

    /// Docker container name (default includes the process id)
    pub container_name: String,

    /// Database created in the instance; `current_database()` must return it
    pub database_name: String,

    /// Schema the sessions use as their current schema
    pub schema: SchemaName,

    pub username: String,
    pub password: String,

    /// Host port to publish, 0 for an ephemeral port
    pub host_port: u16,

    /// How long to wait for the instance to accept connections
    pub ready_timeout: Duration,

    /// Use an already running server instead of starting a container
    pub connection_string: Option<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            container_name: format!("pg-session-harness-{}", std::process::id()),
            database_name: DEFAULT_DATABASE_NAME.to_string(),
            schema: SchemaName::new(DEFAULT_SCHEMA).expect("Default schema name should be valid"),
            username: "test".to_string(),
            password: "test".to_string(),
            host_port: 0,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            connection_string: None,
        }
    }
}
