//! Outbound store protocol.
//!
//! A [`Store`] opens [`Connection`]s; a connection executes statements and
//! fetches rows. Transactions are plain statements on a connection
//! (`START TRANSACTION` / `COMMIT` / `ROLLBACK`), so the same protocol serves
//! PostgreSQL and the in-memory store used by tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use crate::error::SinkError;

pub const BEGIN_STATEMENT: &str = "START TRANSACTION;";
/// Issued right after `BEGIN` so tables can be filled in any order within one transaction.
pub const DEFER_CONSTRAINTS_STATEMENT: &str = "SET CONSTRAINTS ALL DEFERRED;";
pub const COMMIT_STATEMENT: &str = "COMMIT;";
pub const ROLLBACK_STATEMENT: &str = "ROLLBACK;";

// ─── Rows ────────────────────────────────────────────────────────────────────

/// A single column value as fetched from the store.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        Self::Int(v.into())
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// A fetched row: named columns in select-list order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, SqlValue)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column (builder style).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.columns.push((name.into(), value.into()));
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: SqlValue) {
        self.columns.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Integer column; a missing, NULL or non-integer value is an error.
    pub fn get_i64(&self, name: &str) -> Result<i64, SinkError> {
        match self.get(name) {
            Some(SqlValue::Int(v)) => Ok(*v),
            Some(SqlValue::Text(s)) => s
                .parse()
                .map_err(|e| SinkError::Store(format!("column `{name}` is not an integer: {e}"))),
            Some(other) => Err(SinkError::Store(format!(
                "column `{name}` is not an integer: {other:?}"
            ))),
            None => Err(SinkError::Store(format!("missing column `{name}`"))),
        }
    }

    pub fn get_str(&self, name: &str) -> Result<&str, SinkError> {
        match self.get(name) {
            Some(SqlValue::Text(s)) => Ok(s),
            Some(other) => Err(SinkError::Store(format!(
                "column `{name}` is not text: {other:?}"
            ))),
            None => Err(SinkError::Store(format!("missing column `{name}`"))),
        }
    }
}

// ─── Store / Connection ──────────────────────────────────────────────────────

/// Factory for connections to one database.
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a new, dedicated connection.
    async fn connect(&self) -> Result<Box<dyn Connection>, SinkError>;
}

/// One open connection to the store.
#[async_trait]
pub trait Connection: Send {
    /// Execute a statement, returning the number of rows it affected.
    async fn execute(&mut self, sql: &str) -> Result<u64, SinkError>;

    /// Execute a query and return every row it produced.
    async fn fetch(&mut self, sql: &str) -> Result<Vec<Row>, SinkError>;

    async fn close(&mut self) -> Result<(), SinkError>;
}

/// Start a transaction with deferred constraints on `conn`.
pub async fn begin_transaction(conn: &mut dyn Connection) -> Result<(), SinkError> {
    conn.execute(BEGIN_STATEMENT).await?;
    conn.execute(DEFER_CONSTRAINTS_STATEMENT).await?;
    Ok(())
}

/// Run a single statement in its own connection and transaction.
///
/// Used for bootstrap and maintenance statements outside the worker pipeline.
pub async fn execute_in_transaction(store: &dyn Store, sql: &str) -> Result<Vec<Row>, SinkError> {
    let mut conn = store.connect().await?;
    let result = async {
        begin_transaction(conn.as_mut()).await?;
        let rows = conn.fetch(sql).await?;
        conn.execute(COMMIT_STATEMENT).await?;
        Ok::<_, SinkError>(rows)
    }
    .await;

    if let Err(e) = &result {
        if let Err(rollback_err) = conn.execute(ROLLBACK_STATEMENT).await {
            warn!(error = %e, rollback_error = %rollback_err, "rollback after failed statement failed");
        }
    }
    conn.close().await?;
    result
}

// ─── In-memory store ─────────────────────────────────────────────────────────

/// Transaction-aware in-memory store for tests and dry runs.
///
/// Statements executed inside a transaction become visible in
/// [`committed_statements`](Self::committed_statements) only after `COMMIT`;
/// bulk inserts are tallied per table. Queries are answered from canned
/// responses registered with [`respond`](Self::respond), and statements
/// containing a registered pattern fail on demand.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    committed: Vec<String>,
    rows_per_table: HashMap<String, u64>,
    responses: Vec<(String, Vec<Row>)>,
    failures: Vec<String>,
    connections_opened: usize,
    connections_closed: usize,
    commits: usize,
    rollbacks: usize,
}

impl MemoryState {
    fn commit(&mut self, statements: Vec<String>) {
        for sql in statements {
            if let Some((table, tuples)) = parse_bulk_insert(&sql) {
                *self.rows_per_table.entry(table).or_default() += tuples;
            }
            self.committed.push(sql);
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.state)
    }

    /// Answer every query containing `pattern` with `rows`.
    pub fn respond(&self, pattern: impl Into<String>, rows: Vec<Row>) {
        self.lock().responses.push((pattern.into(), rows));
    }

    /// Make every statement containing `pattern` fail with a store error.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.lock().failures.push(pattern.into());
    }

    pub fn committed_statements(&self) -> Vec<String> {
        self.lock().committed.clone()
    }

    /// Committed statements containing `pattern`.
    pub fn statements_containing(&self, pattern: &str) -> Vec<String> {
        self.lock()
            .committed
            .iter()
            .filter(|sql| sql.contains(pattern))
            .cloned()
            .collect()
    }

    /// Committed bulk inserts into `table`.
    pub fn inserts_into(&self, table: &str) -> Vec<String> {
        let prefix = format!("INSERT INTO {table}(");
        self.lock()
            .committed
            .iter()
            .filter(|sql| sql.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Number of committed tuples inserted into `table`.
    pub fn committed_rows(&self, table: &str) -> u64 {
        self.lock().rows_per_table.get(table).copied().unwrap_or(0)
    }

    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.lock().rollbacks
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        let state = self.lock();
        state.connections_opened - state.connections_closed
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn connect(&self) -> Result<Box<dyn Connection>, SinkError> {
        self.lock().connections_opened += 1;
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            pending: Vec::new(),
            in_transaction: false,
            closed: false,
        }))
    }
}

/// Connection handed out by [`MemoryStore`].
pub struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
    pending: Vec<String>,
    in_transaction: bool,
    closed: bool,
}

impl MemoryConnection {
    fn run(&mut self, sql: &str) -> Result<u64, SinkError> {
        if self.closed {
            return Err(SinkError::Store("connection is closed".into()));
        }

        let statement = sql.trim();
        let upper = statement.to_ascii_uppercase();
        let mut state = lock_state(&self.state);

        if let Some(pattern) = state.failures.iter().find(|p| statement.contains(p.as_str())) {
            return Err(SinkError::Store(format!(
                "injected failure for statement matching `{pattern}`"
            )));
        }

        if upper.starts_with("START TRANSACTION") || upper.starts_with("BEGIN") {
            if self.in_transaction {
                return Err(SinkError::Store("transaction already in progress".into()));
            }
            self.in_transaction = true;
            self.pending.clear();
            return Ok(0);
        }
        if upper.starts_with("COMMIT") {
            state.commits += 1;
            state.commit(std::mem::take(&mut self.pending));
            self.in_transaction = false;
            return Ok(0);
        }
        if upper.starts_with("ROLLBACK") {
            state.rollbacks += 1;
            self.pending.clear();
            self.in_transaction = false;
            return Ok(0);
        }
        if upper.starts_with("SET ") {
            return Ok(0);
        }

        let affected = parse_bulk_insert(statement).map(|(_, n)| n).unwrap_or(0);
        if self.in_transaction {
            self.pending.push(statement.to_string());
        } else {
            state.commit(vec![statement.to_string()]);
        }
        Ok(affected)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&mut self, sql: &str) -> Result<u64, SinkError> {
        self.run(sql)
    }

    async fn fetch(&mut self, sql: &str) -> Result<Vec<Row>, SinkError> {
        self.run(sql)?;
        let state = lock_state(&self.state);
        Ok(state
            .responses
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if !self.closed {
            self.closed = true;
            let mut state = lock_state(&self.state);
            if self.in_transaction {
                state.rollbacks += 1;
                self.pending.clear();
                self.in_transaction = false;
            }
            state.connections_closed += 1;
        }
        Ok(())
    }
}

fn lock_state(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `(table, tuple count)` of a generated bulk insert; one tuple per line.
fn parse_bulk_insert(sql: &str) -> Option<(String, u64)> {
    let rest = sql.strip_prefix("INSERT INTO ")?;
    let table = rest.split('(').next()?.trim().to_string();
    let tuples = sql
        .lines()
        .filter(|line| line.starts_with('(') || line.starts_with(",("))
        .count() as u64;
    Some((table, tuples))
}
