//! Local statement storage.
//!
//! The node does not interpret statements beyond classifying them as reads or
//! writes. Execution, commit and rollback are delegated to a
//! [`StorageEngine`]; the default engine is SQLite.
//!
//! All access goes through [`Storage::session`], which hands out exclusive
//! access to the engine. Holding a [`Session`] is what serializes the local
//! write path: a coordinator keeps it across execute, replicate and commit.

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use rusqlite::types::ValueRef;
use serde_json::Value;
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("statement rejected: {0}")]
    Rejected(String),
}

/// What executing one statement produced.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Affected(usize),
}

/// The transactional engine a node executes statements against.
///
/// Each node owns exactly one engine. `execute` implicitly opens a
/// transaction that stays open until `commit` or `rollback`.
pub trait StorageEngine: Send {
    fn execute(&mut self, sql: &str) -> Result<QueryOutput, StorageError>;
    fn commit(&mut self) -> Result<(), StorageError>;
    fn rollback(&mut self) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Write,
}

impl StatementKind {
    /// Classifies SQL text. Only a statement list made entirely of queries is
    /// a read; text the parser rejects falls back to a `select` prefix check.
    pub fn classify(sql: &str) -> Self {
        match Parser::parse_sql(&GenericDialect {}, sql) {
            Ok(statements) if !statements.is_empty() => {
                if statements
                    .iter()
                    .all(|statement| matches!(statement, Statement::Query(_)))
                {
                    StatementKind::Read
                } else {
                    StatementKind::Write
                }
            }
            _ => {
                if sql.trim_start().to_lowercase().starts_with("select") {
                    StatementKind::Read
                } else {
                    StatementKind::Write
                }
            }
        }
    }
}

/// Shared handle to the node's single storage engine.
#[derive(Clone)]
pub struct Storage {
    engine: Arc<Mutex<Box<dyn StorageEngine>>>,
}

impl Storage {
    pub fn new<E>(engine: E) -> Self
    where
        E: StorageEngine + 'static,
    {
        Self {
            engine: Arc::new(Mutex::new(Box::new(engine))),
        }
    }

    /// Waits for exclusive access to the engine.
    pub async fn session(&self) -> Session<'_> {
        Session {
            engine: self.engine.lock().await,
        }
    }
}

/// Exclusive access to the engine for the lifetime of the guard.
pub struct Session<'a> {
    engine: MutexGuard<'a, Box<dyn StorageEngine>>,
}

impl Session<'_> {
    pub fn execute(&mut self, sql: &str) -> Result<QueryOutput, StorageError> {
        self.engine.execute(sql)
    }

    pub fn commit(&mut self) -> Result<(), StorageError> {
        self.engine.commit()
    }

    pub fn rollback(&mut self) -> Result<(), StorageError> {
        self.engine.rollback()
    }

    /// Executes one statement as its own transaction.
    ///
    /// `before_commit` runs after a successful execute and before the commit.
    /// A failed execute or commit always reaches rollback before returning.
    pub fn transaction<F>(&mut self, sql: &str, before_commit: F) -> Result<QueryOutput, StorageError>
    where
        F: FnOnce(&QueryOutput),
    {
        let output = match self.engine.execute(sql) {
            Ok(output) => output,
            Err(err) => {
                self.rollback_quietly();
                return Err(err);
            }
        };

        before_commit(&output);

        if let Err(err) = self.engine.commit() {
            self.rollback_quietly();
            return Err(err);
        }
        Ok(output)
    }

    fn rollback_quietly(&mut self) {
        if let Err(err) = self.engine.rollback() {
            tracing::warn!(error = %err, "rollback failed");
        }
    }
}

/// SQLite-backed engine, in memory or on disk.
pub struct SqliteEngine {
    conn: Connection,
}

impl SqliteEngine {
    pub fn in_memory() -> Result<Self, StorageError> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self {
            conn: Connection::open(path)?,
        })
    }

    fn begin_if_needed(&self) -> Result<(), StorageError> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }
}

impl StorageEngine for SqliteEngine {
    fn execute(&mut self, sql: &str) -> Result<QueryOutput, StorageError> {
        // `prepare` compiles only the first statement and drops the rest.
        if statement_count(sql).is_some_and(|count| count > 1) {
            return Err(StorageError::Rejected(format!(
                "expected a single statement: {sql}"
            )));
        }
        self.begin_if_needed()?;

        let mut stmt = self.conn.prepare(sql)?;
        if stmt.column_count() == 0 {
            return Ok(QueryOutput::Affected(stmt.execute([])?));
        }

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();
        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(width);
            for index in 0..width {
                values.push(json_value(row.get_ref(index)?));
            }
            rows.push(values);
        }
        Ok(QueryOutput::Rows { columns, rows })
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }
}

/// Number of statements in `sql`, or `None` when it does not parse.
fn statement_count(sql: &str) -> Option<usize> {
    Parser::parse_sql(&GenericDialect {}, sql)
        .ok()
        .map(|statements| statements.len())
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => Value::String(hex::encode(blob)),
    }
}
