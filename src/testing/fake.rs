//! In-memory stand-in for a PostgreSQL server.
//!
//! Understands exactly the statements the harness issues, resolves names
//! through the session search path the way PostgreSQL does, and counts
//! connections and open statements so cleanup can be asserted on.

use crate::result::ResultSet;
use crate::session::{ConnectionConfig, Connector, Session, SessionError};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio_postgres::error::SqlState;

/// A server-style error carrying its SQLSTATE.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct FakeError {
    code: SqlState,
    message: String,
}

impl FakeError {
    fn new(code: SqlState, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn syntax(sql: &str) -> Self {
        let near = sql.split_whitespace().next().unwrap_or_default();
        Self::new(
            SqlState::SYNTAX_ERROR,
            format!("syntax error at or near \"{near}\""),
        )
    }

    pub fn code(&self) -> &SqlState {
        &self.code
    }
}

impl SessionError for FakeError {
    fn sql_state(&self) -> Option<&SqlState> {
        Some(&self.code)
    }
}

#[derive(Default)]
struct Catalog {
    schemas: BTreeSet<String>,
    tables: BTreeSet<(String, String)>,
    refuse_connections: bool,
}

#[derive(Default)]
struct Counters {
    connect_attempts: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    leaked: AtomicUsize,
    prepare_calls: AtomicUsize,
    statements_open: AtomicUsize,
}

/// Shared state of the fake server. Clones observe the same catalog.
#[derive(Clone)]
pub struct FakeDatabase {
    catalog: Arc<Mutex<Catalog>>,
    counters: Arc<Counters>,
}

impl Default for FakeDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDatabase {
    /// A server with only the `public` schema.
    pub fn new() -> Self {
        let mut catalog = Catalog::default();
        catalog.schemas.insert("public".to_string());
        Self {
            catalog: Arc::new(Mutex::new(catalog)),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector { db: self.clone() }
    }

    /// Opens a session directly, bypassing the connector.
    pub fn open_session(&self, database_name: &str, search_path: &str) -> FakeSession {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        FakeSession {
            db: self.clone(),
            database_name: database_name.to_string(),
            search_path: search_path
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .collect(),
            closed: false,
        }
    }

    /// Makes every following connect attempt fail.
    pub fn refuse_connections(&self) {
        self.catalog().refuse_connections = true;
    }

    pub fn schema_exists(&self, schema: &str) -> bool {
        self.catalog().schemas.contains(schema)
    }

    pub fn table_exists(&self, schema: &str, table: &str) -> bool {
        self.catalog()
            .tables
            .contains(&(schema.to_string(), table.to_string()))
    }

    pub fn connect_attempts(&self) -> usize {
        self.counters.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn connections_opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    /// Sessions dropped without being closed.
    pub fn connections_leaked(&self) -> usize {
        self.counters.leaked.load(Ordering::SeqCst)
    }

    pub fn prepare_calls(&self) -> usize {
        self.counters.prepare_calls.load(Ordering::SeqCst)
    }

    /// Prepared statements not yet released.
    pub fn statements_open(&self) -> usize {
        self.counters.statements_open.load(Ordering::SeqCst)
    }

    fn catalog(&self) -> MutexGuard<'_, Catalog> {
        // A panicking test may poison the lock; the catalog itself stays usable.
        self.catalog.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Connector handing out [`FakeSession`]s.
#[derive(Clone)]
pub struct FakeConnector {
    db: FakeDatabase,
}

#[async_trait]
impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self, config: &ConnectionConfig) -> Result<FakeSession, FakeError> {
        self.db
            .counters
            .connect_attempts
            .fetch_add(1, Ordering::SeqCst);
        if self.db.catalog().refuse_connections {
            return Err(FakeError::new(
                SqlState::CONNECTION_EXCEPTION,
                format!("connection to {} refused", config.endpoint()),
            ));
        }
        Ok(self
            .db
            .open_session(config.endpoint().database_name(), config.schema().as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Parsed {
    CurrentDatabase,
    CreateSchema(String),
    CreateTable {
        schema: Option<String>,
        table: String,
    },
    Select {
        schema: Option<String>,
        table: String,
    },
}

/// A prepared statement. Dropping it releases it.
pub struct FakeStatement {
    parsed: Parsed,
    counters: Arc<Counters>,
}

impl Drop for FakeStatement {
    fn drop(&mut self) {
        self.counters.statements_open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One fake client connection.
pub struct FakeSession {
    db: FakeDatabase,
    database_name: String,
    search_path: Vec<String>,
    closed: bool,
}

impl FakeSession {
    fn resolve_table(&self, schema: Option<&str>, table: &str) -> Result<(), FakeError> {
        let catalog = self.db.catalog();
        match schema {
            Some(schema) => {
                if !catalog.schemas.contains(schema) {
                    return Err(FakeError::new(
                        SqlState::INVALID_SCHEMA_NAME,
                        format!("schema \"{schema}\" does not exist"),
                    ));
                }
                if catalog
                    .tables
                    .contains(&(schema.to_string(), table.to_string()))
                {
                    return Ok(());
                }
                Err(FakeError::new(
                    SqlState::UNDEFINED_TABLE,
                    format!("relation \"{schema}.{table}\" does not exist"),
                ))
            }
            None => {
                let found = self
                    .search_path
                    .iter()
                    .any(|s| catalog.tables.contains(&(s.clone(), table.to_string())));
                if found {
                    Ok(())
                } else {
                    Err(FakeError::new(
                        SqlState::UNDEFINED_TABLE,
                        format!("relation \"{table}\" does not exist"),
                    ))
                }
            }
        }
    }

    fn creation_schema(&self, catalog: &Catalog, schema: Option<&str>) -> Result<String, FakeError> {
        match schema {
            Some(schema) if catalog.schemas.contains(schema) => Ok(schema.to_string()),
            Some(schema) => Err(FakeError::new(
                SqlState::INVALID_SCHEMA_NAME,
                format!("schema \"{schema}\" does not exist"),
            )),
            // The first search path entry that exists receives new objects
            None => self
                .search_path
                .iter()
                .find(|s| catalog.schemas.contains(*s))
                .cloned()
                .ok_or_else(|| {
                    FakeError::new(
                        SqlState::INVALID_SCHEMA_NAME,
                        "no schema has been selected to create in",
                    )
                }),
        }
    }

    fn apply(&self, parsed: &Parsed) -> Result<ResultSet, FakeError> {
        match parsed {
            Parsed::CurrentDatabase => Ok(ResultSet::new(
                vec!["current_database".to_string()],
                vec![vec![Some(self.database_name.clone())]],
            )),
            Parsed::CreateSchema(schema) => {
                let mut catalog = self.db.catalog();
                if !catalog.schemas.insert(schema.clone()) {
                    return Err(FakeError::new(
                        SqlState::DUPLICATE_SCHEMA,
                        format!("schema \"{schema}\" already exists"),
                    ));
                }
                Ok(ResultSet::default())
            }
            Parsed::CreateTable { schema, table } => {
                let mut catalog = self.db.catalog();
                let target = self.creation_schema(&catalog, schema.as_deref())?;
                if !catalog.tables.insert((target, table.clone())) {
                    return Err(FakeError::new(
                        SqlState::DUPLICATE_TABLE,
                        format!("relation \"{table}\" already exists"),
                    ));
                }
                Ok(ResultSet::default())
            }
            Parsed::Select { schema, table } => {
                self.resolve_table(schema.as_deref(), table)?;
                Ok(ResultSet::new(vec!["id".to_string()], vec![]))
            }
        }
    }
}

#[async_trait]
impl Session for FakeSession {
    type Statement = FakeStatement;
    type Error = FakeError;

    async fn prepare(&mut self, sql: &str) -> Result<FakeStatement, FakeError> {
        self.db
            .counters
            .prepare_calls
            .fetch_add(1, Ordering::SeqCst);
        let parsed = parse(sql)?;
        // Like the server, name resolution for queries happens at parse time
        if let Parsed::Select { schema, table } = &parsed {
            self.resolve_table(schema.as_deref(), table)?;
        }
        self.db
            .counters
            .statements_open
            .fetch_add(1, Ordering::SeqCst);
        Ok(FakeStatement {
            parsed,
            counters: self.db.counters.clone(),
        })
    }

    async fn execute(&mut self, statement: &FakeStatement) -> Result<u64, FakeError> {
        let rows = self.apply(&statement.parsed)?;
        Ok(rows.len() as u64)
    }

    async fn query(&mut self, statement: &FakeStatement) -> Result<ResultSet, FakeError> {
        self.apply(&statement.parsed)
    }

    async fn close(mut self) -> Result<(), FakeError> {
        self.closed = true;
        self.db.counters.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        if !self.closed {
            self.db.counters.leaked.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn parse(sql: &str) -> Result<Parsed, FakeError> {
    let sql = sql.trim().trim_end_matches(';').trim_end();

    if sql.eq_ignore_ascii_case("SELECT current_database()") {
        return Ok(Parsed::CurrentDatabase);
    }
    if let Some(rest) = strip_keyword(sql, "CREATE SCHEMA ") {
        return identifier(rest.trim())
            .map(Parsed::CreateSchema)
            .ok_or_else(|| FakeError::syntax(rest));
    }
    if let Some(rest) = strip_keyword(sql, "CREATE TABLE ") {
        let (name, columns) = rest.split_once('(').ok_or_else(|| FakeError::syntax(rest))?;
        if !columns.ends_with(')') {
            return Err(FakeError::syntax(columns));
        }
        let (schema, table) = qualified_name(name.trim()).ok_or_else(|| FakeError::syntax(name))?;
        return Ok(Parsed::CreateTable { schema, table });
    }
    if let Some(rest) = strip_keyword(sql, "SELECT * FROM ") {
        let (schema, table) = qualified_name(rest.trim()).ok_or_else(|| FakeError::syntax(rest))?;
        return Ok(Parsed::Select { schema, table });
    }

    Err(FakeError::syntax(sql))
}

fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword)
        .then(|| &sql[keyword.len()..])
}

/// Unquoted identifiers fold to lower case.
fn identifier(text: &str) -> Option<String> {
    let valid = !text.is_empty() && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then(|| text.to_ascii_lowercase())
}

fn qualified_name(text: &str) -> Option<(Option<String>, String)> {
    match text.split_once('.') {
        Some((schema, table)) => Some((Some(identifier(schema)?), identifier(table)?)),
        None => Some((None, identifier(text)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_harness_statements() {
        assert_eq!(parse("SELECT current_database()").unwrap(), Parsed::CurrentDatabase);
        assert_eq!(
            parse("CREATE SCHEMA MySchema").unwrap(),
            Parsed::CreateSchema("myschema".to_string())
        );
        assert_eq!(
            parse("CREATE TABLE test(ID INT PRIMARY KEY)").unwrap(),
            Parsed::CreateTable {
                schema: None,
                table: "test".to_string()
            }
        );
        assert_eq!(
            parse("SELECT * FROM myschema.test").unwrap(),
            Parsed::Select {
                schema: Some("myschema".to_string()),
                table: "test".to_string()
            }
        );
    }

    #[test]
    fn test_parse_rejects_malformed_sql() {
        let err = parse("CREAT TABLE test(ID INT PRIMARY KEY)").unwrap_err();
        assert_eq!(err.code(), &SqlState::SYNTAX_ERROR);
        assert_eq!(err.to_string(), "syntax error at or near \"CREAT\"");

        assert!(parse("CREATE TABLE test").is_err());
        assert!(parse("SELECT * FROM my-schema.test").is_err());
    }

    #[tokio::test]
    async fn test_create_table_without_existing_schema_on_path() {
        let db = FakeDatabase::new();
        let mut session = db.open_session("mydb", "myschema");

        let statement = session.prepare("CREATE TABLE test(ID INT PRIMARY KEY)").await.unwrap();
        let err = session.execute(&statement).await.unwrap_err();
        assert_eq!(err.code(), &SqlState::INVALID_SCHEMA_NAME);
        drop(statement);

        session.close().await.unwrap();
        assert_eq!(db.statements_open(), 0);
        assert_eq!(db.connections_leaked(), 0);
    }

    #[tokio::test]
    async fn test_unclosed_session_counts_as_leak() {
        let db = FakeDatabase::new();
        drop(db.open_session("mydb", "public"));
        assert_eq!(db.connections_leaked(), 1);
        assert_eq!(db.connections_closed(), 0);
    }
}
