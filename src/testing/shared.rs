//! One database instance per test binary.
//!
//! The first test to call [`shared_endpoint`] provisions the instance from
//! [`HarnessConfig::from_env`]; every later call gets the same endpoint, or
//! the same provisioning error. A started container is removed when the
//! test process exits.

use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::identifier::SchemaName;
use crate::postgres::with_pg_connection;
use crate::provision::{provision, ProvisionedInstance};
use crate::sequencer::{run_sequence, SqlOperation};
use pg_session_harness_container::DatabaseEndpoint;
use std::sync::Mutex;
use tokio::sync::OnceCell;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct SharedEndpoint {
    endpoint: DatabaseEndpoint,
    external: bool,
}

static SHARED: OnceCell<Result<SharedEndpoint, String>> = OnceCell::const_new();
static INSTANCE: Mutex<Option<ProvisionedInstance>> = Mutex::new(None);

/// Initialize logging for tests
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pg_session_harness=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Endpoint of the suite's database instance, provisioned on first use.
pub async fn shared_endpoint() -> Result<&'static DatabaseEndpoint, HarnessError> {
    let shared = SHARED
        .get_or_init(|| async {
            start_shared_instance()
                .await
                .map_err(|e| e.to_string())
        })
        .await;

    match shared {
        Ok(shared) => Ok(&shared.endpoint),
        Err(message) => Err(HarnessError::Provision(anyhow::anyhow!(
            "shared instance unavailable: {message}"
        ))),
    }
}

/// True when the shared endpoint points at a server this process did not start.
pub fn is_external() -> bool {
    matches!(SHARED.get(), Some(Ok(shared)) if shared.external)
}

async fn start_shared_instance() -> Result<SharedEndpoint, HarnessError> {
    let config = HarnessConfig::from_env()?;
    let instance = provision(&config).await?;
    let shared = SharedEndpoint {
        endpoint: instance.endpoint().clone(),
        external: instance.is_external(),
    };

    if !shared.external {
        if let Err(e) = instance.remove_on_process_exit() {
            warn!("Container will outlive the test process: {}", e);
        }
        // Statics are never dropped; the reaper removes the container.
        *INSTANCE.lock().unwrap_or_else(|e| e.into_inner()) = Some(instance);
    }

    info!("Shared PostgreSQL instance at {}", shared.endpoint);
    Ok(shared)
}

/// Drops `schema` and everything in it.
///
/// A reused external server keeps schemas from earlier runs; calling this
/// first makes `CREATE SCHEMA` deterministic again.
pub async fn reset_schema(
    endpoint: &DatabaseEndpoint,
    schema: &SchemaName,
) -> Result<(), HarnessError> {
    let drop_schema = SqlOperation::statement(format!("DROP SCHEMA IF EXISTS {schema} CASCADE"));
    with_pg_connection(endpoint, schema, move |session| {
        Box::pin(async move { run_sequence(session, &[drop_schema], |_, _| Ok(())).await })
    })
    .await?;
    Ok(())
}
