//! In-memory relational database resource manager
//!
//! Tables hold rows keyed by their first column (the primary key). A
//! `DbConnection` is both the handle callers execute statements on and the
//! `ResourceAdapter` the coordinator drives.
//!
//! # Transaction Semantics
//!
//! - Outside a transaction every statement autocommits.
//! - Inside a transaction `Insert`/`Delete` are staged on the connection;
//!   `Select` on the same connection sees its own staged writes, other
//!   connections do not.
//! - `CreateTable`/`DropTable` always apply immediately.
//! - `prepare` replays the staged writes against committed state, then locks
//!   every touched row until commit or rollback. A duplicate key or a row
//!   locked by another prepared transaction is a ROLLBACK vote.
//! - A one-phase commit validates and applies in one step; a failed
//!   validation is reported as `AdapterError::RolledBack`.
//! - Once its transaction ends (commit, or a rollback the coordinator may
//!   have driven on its own) the connection refuses statements with
//!   `DatabaseError::TransactionEnded` until it is `reset` or enlisted
//!   again, so late work is never silently autocommitted.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use xact_core::{
    AdapterError, AdapterResult, Capability, ResourceAdapter, ResourceId, TransactionId, Vote,
};

/// One table row; the first value is the primary key
pub type Row = Vec<Value>;

/// Statements understood by `DbConnection::execute`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// Create a table; the first column is the primary key
    CreateTable {
        /// Table name
        name: String,
        /// Column names
        columns: Vec<String>,
    },
    /// Drop a table
    DropTable {
        /// Table name
        name: String,
        /// Succeed silently when the table does not exist
        if_exists: bool,
    },
    /// Insert one row
    Insert {
        /// Target table
        table: String,
        /// One value per column
        values: Row,
    },
    /// Delete the row with the given primary key
    Delete {
        /// Target table
        table: String,
        /// Primary key value
        key: Value,
    },
    /// Read rows in primary-key order, optionally a single key
    Select {
        /// Source table
        table: String,
        /// Primary key filter
        key: Option<Value>,
    },
}

impl Statement {
    /// `CREATE TABLE name (columns...)`
    pub fn create_table(name: &str, columns: &[&str]) -> Self {
        Statement::CreateTable {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// `DROP TABLE IF EXISTS name`
    pub fn drop_table_if_exists(name: &str) -> Self {
        Statement::DropTable {
            name: name.to_string(),
            if_exists: true,
        }
    }

    /// `INSERT INTO table VALUES (values...)`
    pub fn insert(table: &str, values: Row) -> Self {
        Statement::Insert {
            table: table.to_string(),
            values,
        }
    }

    /// `DELETE FROM table WHERE pk = key`
    pub fn delete(table: &str, key: Value) -> Self {
        Statement::Delete {
            table: table.to_string(),
            key,
        }
    }

    /// `SELECT * FROM table`
    pub fn select_all(table: &str) -> Self {
        Statement::Select {
            table: table.to_string(),
            key: None,
        }
    }

    /// `SELECT * FROM table WHERE pk = key`
    pub fn select(table: &str, key: Value) -> Self {
        Statement::Select {
            table: table.to_string(),
            key: Some(key),
        }
    }
}

/// Result of executing a statement
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// DDL completed
    Done,
    /// Rows inserted or deleted
    Affected(usize),
    /// Rows selected
    Rows(Vec<Row>),
}

impl QueryResult {
    /// Selected rows; empty for non-queries
    pub fn rows(&self) -> &[Row] {
        match self {
            QueryResult::Rows(rows) => rows,
            _ => &[],
        }
    }

    /// Affected row count; zero for queries and DDL
    pub fn affected(&self) -> usize {
        match self {
            QueryResult::Affected(n) => *n,
            _ => 0,
        }
    }
}

/// Statement execution errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DatabaseError {
    /// No table with this name
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// A table with this name already exists
    #[error("Table already exists: {0}")]
    TableExists(String),

    /// A table needs at least its primary key column
    #[error("Table {0} must have at least one column")]
    NoColumns(String),

    /// Row width does not match the table
    #[error("Table {table} has {expected} columns, got {actual} values")]
    ColumnCount {
        /// Target table
        table: String,
        /// Column count of the table
        expected: usize,
        /// Values supplied
        actual: usize,
    },

    /// Primary key already present
    #[error("Duplicate primary key {key} in table {table}")]
    DuplicateKey {
        /// Target table
        table: String,
        /// Offending key
        key: String,
    },

    /// Row is locked by a prepared transaction
    #[error("Row {key} in table {table} is locked by transaction {holder}")]
    Locked {
        /// Target table
        table: String,
        /// Locked key
        key: String,
        /// Transaction holding the lock
        holder: TransactionId,
    },

    /// The connection's transaction is prepared; no further statements
    #[error("Connection {0} is prepared and accepts no further statements")]
    Prepared(ResourceId),

    /// The connection's transaction already ended
    #[error("Connection {resource} belongs to ended transaction {txn}")]
    TransactionEnded {
        /// Connection
        resource: ResourceId,
        /// Transaction that ended
        txn: TransactionId,
    },
}

/// Result type for statement execution
pub type DbResult<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug)]
struct Table {
    columns: Vec<String>,
    rows: BTreeMap<String, Row>,
}

#[derive(Debug, Default)]
struct Tables {
    tables: HashMap<String, Table>,
    /// (table, key) → prepared transaction holding the row
    locks: HashMap<(String, String), TransactionId>,
}

impl Tables {
    fn table(&self, name: &str) -> DbResult<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| DatabaseError::TableNotFound(name.to_string()))
    }

    fn lock_holder(&self, table: &str, key: &str) -> Option<TransactionId> {
        self.locks
            .get(&(table.to_string(), key.to_string()))
            .copied()
    }

    fn release_locks(&mut self, txn: TransactionId) {
        self.locks.retain(|_, holder| *holder != txn);
    }
}

struct DatabaseInner {
    name: String,
    state: RwLock<Tables>,
    next_connection: AtomicU64,
}

/// In-memory database shared by any number of connections
///
/// Cheap to clone; clones share the same tables.
#[derive(Clone)]
pub struct InMemoryDatabase {
    inner: Arc<DatabaseInner>,
}

impl InMemoryDatabase {
    /// Create an empty database
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                name: name.to_string(),
                state: RwLock::new(Tables::default()),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Database name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Open a connection with a generated resource id (`<db>/conn-<n>`)
    pub fn open_connection(&self) -> DbConnection {
        let n = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        self.open_named_connection(format!("{}/conn-{}", self.inner.name, n))
    }

    /// Open a connection with an explicit unique resource id
    pub fn open_named_connection(&self, resource: impl Into<ResourceId>) -> DbConnection {
        DbConnection {
            id: resource.into(),
            db: Arc::clone(&self.inner),
            session: Mutex::new(Session::default()),
        }
    }

    /// Committed row count of a table
    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.inner
            .state
            .read()
            .tables
            .get(table)
            .map(|t| t.rows.len())
    }

    /// Number of rows currently locked by prepared transactions
    pub fn locked_rows(&self) -> usize {
        self.inner.state.read().locks.len()
    }
}

#[derive(Debug, Clone)]
enum Write {
    Insert { table: String, key: String, row: Row },
    Delete { table: String, key: String },
}

impl Write {
    fn table(&self) -> &str {
        match self {
            Write::Insert { table, .. } | Write::Delete { table, .. } => table,
        }
    }

    fn key(&self) -> &str {
        match self {
            Write::Insert { key, .. } | Write::Delete { key, .. } => key,
        }
    }
}

#[derive(Debug, Default)]
struct Session {
    txn: Option<TransactionId>,
    pending: Vec<Write>,
    /// Vote cast by `prepare`, repeated on later calls
    vote: Option<Vote>,
    /// Last transaction this session ended in, until reset or re-enlist
    ended: Option<TransactionId>,
}

impl Session {
    fn ended(txn: TransactionId) -> Self {
        Session {
            ended: Some(txn),
            ..Session::default()
        }
    }

    fn holds_locks(&self) -> bool {
        self.vote == Some(Vote::Commit)
    }
}

/// Primary-key encoding used for row lookup and locking
fn primary_key(value: &Value) -> String {
    value.to_string()
}

/// Row visible under `key` once `pending` is applied over committed state
fn visible_row<'a>(
    tables: &'a Tables,
    pending: &'a [Write],
    table: &str,
    key: &str,
) -> Option<&'a Row> {
    let mut row = tables.tables.get(table).and_then(|t| t.rows.get(key));
    for write in pending
        .iter()
        .filter(|w| w.table() == table && w.key() == key)
    {
        row = match write {
            Write::Insert { row, .. } => Some(row),
            Write::Delete { .. } => None,
        };
    }
    row
}

/// Replay `pending` against committed state.
///
/// Fails on a duplicate key, a dropped table, or a row locked by another
/// transaction.
fn validate(
    tables: &Tables,
    pending: &[Write],
    txn: TransactionId,
) -> std::result::Result<(), String> {
    let mut overlay: HashMap<(&str, &str), bool> = HashMap::new();
    for write in pending {
        let (table, key) = (write.table(), write.key());
        if let Some(holder) = tables.lock_holder(table, key) {
            if holder != txn {
                return Err(format!("row {} in {} is locked by {}", key, table, holder));
            }
        }
        let committed = tables
            .tables
            .get(table)
            .ok_or_else(|| format!("table {} no longer exists", table))?;
        let present = overlay
            .get(&(table, key))
            .copied()
            .unwrap_or_else(|| committed.rows.contains_key(key));
        match write {
            Write::Insert { .. } if present => {
                return Err(format!("duplicate primary key {} in {}", key, table));
            }
            Write::Insert { .. } => overlay.insert((table, key), true),
            Write::Delete { .. } => overlay.insert((table, key), false),
        };
    }
    Ok(())
}

fn apply(tables: &mut Tables, pending: Vec<Write>) {
    for write in pending {
        match write {
            Write::Insert { table, key, row } => {
                if let Some(t) = tables.tables.get_mut(&table) {
                    t.rows.insert(key, row);
                }
            }
            Write::Delete { table, key } => {
                if let Some(t) = tables.tables.get_mut(&table) {
                    t.rows.remove(&key);
                }
            }
        }
    }
}

/// Connection to an `InMemoryDatabase`
///
/// Enlist it (wrapped in an `Arc`) to make its statements transactional.
pub struct DbConnection {
    id: ResourceId,
    db: Arc<DatabaseInner>,
    session: Mutex<Session>,
}

impl DbConnection {
    /// Transaction this connection is enlisted in
    pub fn enlisted_in(&self) -> Option<TransactionId> {
        self.session.lock().txn
    }

    /// Transaction that ended under this connection, while it still refuses
    /// statements
    pub fn ended_in(&self) -> Option<TransactionId> {
        self.session.lock().ended
    }

    /// Number of staged writes
    pub fn pending_writes(&self) -> usize {
        self.session.lock().pending.len()
    }

    /// Return to autocommit after the transaction ended.
    ///
    /// No effect while enlisted.
    pub fn reset(&self) {
        let mut session = self.session.lock();
        if session.txn.is_none() {
            session.ended = None;
        }
    }

    /// Execute one statement
    ///
    /// # Errors
    /// Schema errors, duplicate keys (against what this connection can see),
    /// rows locked by a prepared transaction (autocommit only), any
    /// statement after prepare, or any statement after the transaction
    /// ended.
    pub fn execute(&self, statement: Statement) -> DbResult<QueryResult> {
        let mut session = self.session.lock();
        if let Some(txn) = session.ended {
            return Err(DatabaseError::TransactionEnded {
                resource: self.id.clone(),
                txn,
            });
        }
        if session.vote.is_some() {
            return Err(DatabaseError::Prepared(self.id.clone()));
        }

        match statement {
            Statement::CreateTable { name, columns } => {
                if columns.is_empty() {
                    return Err(DatabaseError::NoColumns(name));
                }
                let mut state = self.db.state.write();
                if state.tables.contains_key(&name) {
                    return Err(DatabaseError::TableExists(name));
                }
                debug!(target: "xact::adapters", db = %self.db.name, table = %name, "Table created");
                state.tables.insert(
                    name,
                    Table {
                        columns,
                        rows: BTreeMap::new(),
                    },
                );
                Ok(QueryResult::Done)
            }

            Statement::DropTable { name, if_exists } => {
                let mut state = self.db.state.write();
                if let Some(((_, key), holder)) = state.locks.iter().find(|((t, _), _)| *t == name) {
                    return Err(DatabaseError::Locked {
                        table: name.clone(),
                        key: key.clone(),
                        holder: *holder,
                    });
                }
                match state.tables.remove(&name) {
                    Some(_) => {
                        debug!(target: "xact::adapters", db = %self.db.name, table = %name, "Table dropped");
                        Ok(QueryResult::Done)
                    }
                    None if if_exists => Ok(QueryResult::Done),
                    None => Err(DatabaseError::TableNotFound(name)),
                }
            }

            Statement::Insert { table, values } => {
                let mut state = self.db.state.write();
                let expected = state.table(&table)?.columns.len();
                if values.len() != expected {
                    return Err(DatabaseError::ColumnCount {
                        table,
                        expected,
                        actual: values.len(),
                    });
                }
                let key = primary_key(&values[0]);

                if session.txn.is_some() {
                    if visible_row(&state, &session.pending, &table, &key).is_some() {
                        return Err(DatabaseError::DuplicateKey { table, key });
                    }
                    session.pending.push(Write::Insert {
                        table,
                        key,
                        row: values,
                    });
                    return Ok(QueryResult::Affected(1));
                }

                if let Some(holder) = state.lock_holder(&table, &key) {
                    return Err(DatabaseError::Locked { table, key, holder });
                }
                let rows = match state.tables.get_mut(&table) {
                    Some(t) => &mut t.rows,
                    None => return Err(DatabaseError::TableNotFound(table)),
                };
                if rows.contains_key(&key) {
                    return Err(DatabaseError::DuplicateKey { table, key });
                }
                rows.insert(key, values);
                Ok(QueryResult::Affected(1))
            }

            Statement::Delete { table, key } => {
                let mut state = self.db.state.write();
                state.table(&table)?;
                let key = primary_key(&key);

                if session.txn.is_some() {
                    let existed = visible_row(&state, &session.pending, &table, &key).is_some();
                    if existed {
                        session.pending.push(Write::Delete { table, key });
                    }
                    return Ok(QueryResult::Affected(usize::from(existed)));
                }

                if let Some(holder) = state.lock_holder(&table, &key) {
                    return Err(DatabaseError::Locked { table, key, holder });
                }
                let removed = state
                    .tables
                    .get_mut(&table)
                    .and_then(|t| t.rows.remove(&key))
                    .is_some();
                Ok(QueryResult::Affected(usize::from(removed)))
            }

            Statement::Select { table, key } => {
                let state = self.db.state.read();
                let mut view = state.table(&table)?.rows.clone();
                for write in session.pending.iter().filter(|w| w.table() == table) {
                    match write {
                        Write::Insert { key, row, .. } => {
                            view.insert(key.clone(), row.clone());
                        }
                        Write::Delete { key, .. } => {
                            view.remove(key);
                        }
                    }
                }
                let rows = match key {
                    Some(key) => view.remove(&primary_key(&key)).into_iter().collect(),
                    None => view.into_values().collect(),
                };
                Ok(QueryResult::Rows(rows))
            }
        }
    }

    fn check_txn(&self, session: &Session, txn: TransactionId) -> AdapterResult<()> {
        match session.txn {
            Some(current) if current == txn => Ok(()),
            _ => Err(AdapterError::Failed(format!(
                "connection {} is not enlisted in transaction {}",
                self.id, txn
            ))),
        }
    }
}

impl ResourceAdapter for DbConnection {
    fn resource_id(&self) -> &ResourceId {
        &self.id
    }

    fn capability(&self) -> Capability {
        Capability::Preparable
    }

    fn enlist(&self, txn: TransactionId) -> AdapterResult<()> {
        let mut session = self.session.lock();
        match session.txn {
            Some(current) if current == txn => Ok(()),
            Some(current) => Err(AdapterError::AlreadyEnlisted(current)),
            None => {
                *session = Session {
                    txn: Some(txn),
                    ..Session::default()
                };
                Ok(())
            }
        }
    }

    fn prepare(&self, txn: TransactionId) -> AdapterResult<Vote> {
        let mut session = self.session.lock();
        self.check_txn(&session, txn)?;
        if let Some(vote) = session.vote {
            return Ok(vote);
        }

        let mut state = self.db.state.write();
        if let Err(reason) = validate(&state, &session.pending, txn) {
            debug!(target: "xact::adapters", conn = %self.id, txn = %txn, reason = %reason, "Voting rollback");
            session.vote = Some(Vote::Rollback);
            return Ok(Vote::Rollback);
        }
        for write in &session.pending {
            state
                .locks
                .insert((write.table().to_string(), write.key().to_string()), txn);
        }
        session.vote = Some(Vote::Commit);
        Ok(Vote::Commit)
    }

    fn commit(&self, txn: TransactionId, one_phase: bool) -> AdapterResult<()> {
        let mut session = self.session.lock();
        self.check_txn(&session, txn)?;

        let mut state = self.db.state.write();
        match session.vote {
            Some(Vote::Commit) => {}
            Some(Vote::Rollback) => {
                *session = Session::ended(txn);
                return Err(AdapterError::RolledBack(format!(
                    "connection {} voted rollback for {}",
                    self.id, txn
                )));
            }
            None if !one_phase => {
                *session = Session::ended(txn);
                return Err(AdapterError::Failed(format!(
                    "connection {} asked to commit {} without prepare",
                    self.id, txn
                )));
            }
            None => {
                if let Err(reason) = validate(&state, &session.pending, txn) {
                    *session = Session::ended(txn);
                    return Err(AdapterError::RolledBack(reason));
                }
            }
        }

        let pending = std::mem::take(&mut session.pending);
        let writes = pending.len();
        apply(&mut state, pending);
        state.release_locks(txn);
        *session = Session::ended(txn);
        debug!(target: "xact::adapters", conn = %self.id, txn = %txn, writes, "Committed");
        Ok(())
    }

    fn rollback(&self, txn: TransactionId) -> AdapterResult<()> {
        let mut session = self.session.lock();
        if session.txn != Some(txn) {
            return Ok(());
        }
        if session.holds_locks() {
            self.db.state.write().release_locks(txn);
        }
        let discarded = session.pending.len();
        *session = Session::ended(txn);
        debug!(target: "xact::adapters", conn = %self.id, txn = %txn, discarded, "Rolled back");
        Ok(())
    }

    fn forget(&self, _txn: TransactionId) -> AdapterResult<()> {
        Ok(())
    }
}
