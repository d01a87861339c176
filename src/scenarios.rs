//! The two session scenarios: checking the current database name and
//! resolving a table through a per-session default schema.

use crate::error::HarnessError;
use crate::identifier::SchemaName;
use crate::sequencer::{run_sequence, Outcome, SqlOperation};
use crate::session::{with_connection, Connector, Session};
use pg_session_harness_container::DatabaseEndpoint;
use std::fmt;
use tracing::info;

pub const CURRENT_DATABASE_SQL: &str = "SELECT current_database()";
pub const CREATE_TABLE_SQL: &str = "CREATE TABLE test(ID INT PRIMARY KEY)";
pub const SELECT_UNQUALIFIED_SQL: &str = "SELECT * FROM test";

pub fn create_schema_sql(schema: &SchemaName) -> String {
    format!("CREATE SCHEMA {schema}")
}

pub fn select_qualified_sql(schema: &SchemaName) -> String {
    format!("SELECT * FROM {schema}.test")
}

/// Creates the schema, creates `test` in the session's current schema, then
/// reads it back by qualified and by unqualified name.
pub fn custom_schema_operations(schema: &SchemaName) -> Vec<SqlOperation> {
    vec![
        SqlOperation::statement(create_schema_sql(schema)),
        SqlOperation::statement(CREATE_TABLE_SQL),
        SqlOperation::query(select_qualified_sql(schema)),
        SqlOperation::query(SELECT_UNQUALIFIED_SQL),
    ]
}

/// Asserts that `current_database()` yields exactly one row equal to `expected`.
pub async fn check_database_name<S: Session>(
    session: &mut S,
    expected: &str,
) -> Result<String, HarnessError> {
    let mut observed = None;
    run_sequence(
        session,
        &[SqlOperation::query(CURRENT_DATABASE_SQL)],
        |_, outcome| {
            let Outcome::Rows(rows) = outcome else {
                return Err(HarnessError::mismatch("a result set", "no result set"));
            };
            let value = match rows.single_value() {
                Some(Some(value)) => value,
                Some(None) => return Err(HarnessError::mismatch(expected, "NULL")),
                None => {
                    return Err(HarnessError::mismatch(
                        "exactly one row with one column",
                        format!("{} row(s)", rows.len()),
                    ))
                }
            };
            if value != expected {
                return Err(HarnessError::mismatch(expected, value));
            }
            observed = Some(value.to_string());
            Ok(())
        },
    )
    .await?;

    observed.ok_or_else(|| HarnessError::mismatch(expected, "nothing"))
}

/// What one step of the custom-schema workflow produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub sql: String,
    /// Row count for queries, `None` for statements without a result set.
    pub rows: Option<usize>,
}

/// Runs the four custom-schema operations on one session.
pub async fn work_with_custom_schema<S: Session>(
    session: &mut S,
    schema: &SchemaName,
) -> Result<Vec<StepReport>, HarnessError> {
    let operations = custom_schema_operations(schema);
    let mut reports = Vec::with_capacity(operations.len());

    run_sequence(session, &operations, |position, outcome| {
        let rows = match outcome {
            Outcome::Rows(rows) => Some(rows.len()),
            Outcome::Completed { .. } => None,
        };
        reports.push(StepReport {
            sql: operations[position].sql().to_string(),
            rows,
        });
        Ok(())
    })
    .await?;

    Ok(reports)
}

/// Scenario selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    CheckDatabaseName,
    CustomSchema,
}

impl Scenario {
    pub const ALL: [Scenario; 2] = [Scenario::CheckDatabaseName, Scenario::CustomSchema];

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::CheckDatabaseName => "check_database_name",
            Scenario::CustomSchema => "work_with_custom_schema",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Runs one scenario in its own connection scope.
pub async fn run_scenario<C: Connector>(
    connector: &C,
    endpoint: &DatabaseEndpoint,
    schema: &SchemaName,
    scenario: Scenario,
) -> Result<(), HarnessError> {
    info!("Running scenario {}", scenario);
    match scenario {
        Scenario::CheckDatabaseName => {
            let expected = endpoint.database_name().to_string();
            let name = with_connection(connector, endpoint, schema, move |session| {
                Box::pin(async move { check_database_name(session, &expected).await })
            })
            .await?;
            info!("current_database() returned {}", name);
        }
        Scenario::CustomSchema => {
            let owned = schema.clone();
            let reports = with_connection(connector, endpoint, schema, move |session| {
                Box::pin(async move { work_with_custom_schema(session, &owned).await })
            })
            .await?;
            for report in &reports {
                match report.rows {
                    Some(rows) => info!("{} -> {} row(s)", report.sql, rows),
                    None => info!("{} -> ok", report.sql),
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fake::FakeDatabase;
    use tokio_test::assert_err;

    fn schema() -> SchemaName {
        SchemaName::new("myschema").unwrap()
    }

    fn endpoint() -> DatabaseEndpoint {
        DatabaseEndpoint::new("localhost", 5432, "test", "test", "mydb")
    }

    #[test]
    fn test_statement_text() {
        let ops = custom_schema_operations(&schema());
        let sql: Vec<_> = ops.iter().map(SqlOperation::sql).collect();

        assert_eq!(
            sql,
            vec![
                "CREATE SCHEMA myschema",
                "CREATE TABLE test(ID INT PRIMARY KEY)",
                "SELECT * FROM myschema.test",
                "SELECT * FROM test",
            ]
        );
        let expects: Vec<_> = ops.iter().map(SqlOperation::expects_rows).collect();
        assert_eq!(expects, vec![false, false, true, true]);
    }

    #[tokio::test]
    async fn test_check_database_name() {
        let db = FakeDatabase::new();
        let mut session = db.open_session("mydb", "myschema");

        let name = check_database_name(&mut session, "mydb").await.unwrap();
        assert_eq!(name, "mydb");

        let err = assert_err!(check_database_name(&mut session, "otherdb").await);
        match err {
            HarnessError::Mismatch { expected, actual } => {
                assert_eq!(expected, "otherdb");
                assert_eq!(actual, "mydb");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_custom_schema_workflow() {
        let db = FakeDatabase::new();
        let mut session = db.open_session("mydb", "myschema");

        let reports = work_with_custom_schema(&mut session, &schema()).await.unwrap();

        let rows: Vec<_> = reports.iter().map(|r| r.rows).collect();
        assert_eq!(rows, vec![None, None, Some(0), Some(0)]);
        // The unqualified CREATE TABLE landed in the session schema, not public
        assert!(db.table_exists("myschema", "test"));
        assert!(!db.table_exists("public", "test"));
    }

    #[tokio::test]
    async fn test_unqualified_lookup_ignores_other_schemas() {
        let db = FakeDatabase::new();
        let mut session = db.open_session("mydb", "public");

        let reports = work_with_custom_schema(&mut session, &schema()).await;

        // With public first on the path the table is created there, so the
        // qualified lookup in myschema fails.
        let err = assert_err!(reports);
        assert!(err.is_undefined_table());
        assert!(db.table_exists("public", "test"));
    }

    #[tokio::test]
    async fn test_run_all_scenarios() {
        let db = FakeDatabase::new();
        let connector = db.connector();

        for scenario in Scenario::ALL {
            run_scenario(&connector, &endpoint(), &schema(), scenario)
                .await
                .unwrap();
        }

        assert_eq!(db.connections_opened(), 2);
        assert_eq!(db.connections_closed(), 2);
        assert_eq!(db.statements_open(), 0);
        assert!(db.schema_exists("myschema"));
    }

    #[tokio::test]
    async fn test_rerun_of_custom_schema_fails_on_existing_schema() {
        let db = FakeDatabase::new();
        let connector = db.connector();

        run_scenario(&connector, &endpoint(), &schema(), Scenario::CustomSchema)
            .await
            .unwrap();
        let err = assert_err!(
            run_scenario(&connector, &endpoint(), &schema(), Scenario::CustomSchema).await
        );

        assert_eq!(
            err.sql_state(),
            Some(&tokio_postgres::error::SqlState::DUPLICATE_SCHEMA)
        );
        assert_eq!(db.connections_closed(), 2);
    }
}
