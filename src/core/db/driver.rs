/// Driver Contract Module
///
/// This module defines the capability interface the session engine uses to
/// talk to a database backend, along with the result and error types every
/// backend produces. The engine only ever depends on these traits; concrete
/// backends (see `sqlite.rs`) are injected through a `DriverFactory`.

use serde::Serialize;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Describes one result column
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    /// Column name as reported by the driver
    pub name: String,
    /// Declared (or inferred) type name
    #[serde(rename = "type")]
    pub type_name: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        ColumnInfo {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// The outcome of one executed statement.
///
/// Immutable once produced; the engine shares it behind an `Arc` between the
/// result cache and any number of pollers.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSet {
    /// Ordered result columns
    pub columns: Vec<ColumnInfo>,
    /// Ordered rows; `None` is SQL NULL
    pub rows: Vec<Vec<Option<String>>>,
    /// Rows changed by a data-modifying statement
    pub affected_rows: u64,
    /// Wall-clock time spent inside the driver
    pub execution_time_ms: f64,
    /// Set when rows beyond the configured cap were dropped
    pub truncated: bool,
}

impl ResultSet {
    /// Creates a ResultSet from columns and row data
    pub fn new(columns: Vec<ColumnInfo>, rows: Vec<Vec<Option<String>>>) -> Self {
        ResultSet {
            columns,
            rows,
            ..Default::default()
        }
    }

    /// Creates a column-less ResultSet for a data-modifying statement
    pub fn affected(affected_rows: u64) -> Self {
        ResultSet {
            affected_rows,
            ..Default::default()
        }
    }

    /// Approximate heap footprint in bytes, used for cache accounting.
    pub fn estimated_size_bytes(&self) -> usize {
        let columns: usize = self
            .columns
            .iter()
            .map(|c| size_of::<ColumnInfo>() + c.name.len() + c.type_name.len())
            .sum();
        let rows: usize = self
            .rows
            .iter()
            .map(|row| {
                size_of::<Vec<Option<String>>>()
                    + row
                        .iter()
                        .map(|cell| size_of::<Option<String>>() + cell.as_ref().map_or(0, String::len))
                        .sum::<usize>()
            })
            .sum();
        size_of::<ResultSet>() + columns + rows
    }
}

/// Error reported by a database driver.
///
/// Keeps the backend's native error code and message so callers can pass
/// them through untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverError {
    /// Native error code, when the backend has one
    pub code: Option<i32>,
    /// Native error message
    pub message: String,
    /// True when the statement stopped because of a cancellation request
    pub interrupted: bool,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        DriverError {
            code: None,
            message: message.into(),
            interrupted: false,
        }
    }

    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        DriverError {
            code: Some(code),
            ..DriverError::new(message)
        }
    }

    pub fn interrupted() -> Self {
        DriverError {
            interrupted: true,
            ..DriverError::new("interrupted")
        }
    }
}

/// Shared cancellation flag handed to `DatabaseDriver::execute`.
///
/// Set by whoever wants the statement stopped; drivers poll it so that a
/// cancel that lands before the statement starts is still honoured.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clones the inner flag for callbacks that need `'static` ownership.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// A single physical connection to a database.
///
/// Implementations must be usable from several threads at once: `execute`
/// runs on a background worker while `cancel`, `is_connected` and
/// `disconnect` may be called from the request thread.
pub trait DatabaseDriver: Send + Sync {
    /// Executes one statement, blocking until it finishes, fails or is
    /// interrupted through `cancel` or the token.
    fn execute(&self, sql: &str, cancel: &CancellationToken) -> Result<ResultSet, DriverError>;

    /// Interrupts the statement currently running on this connection, if any.
    fn cancel(&self);

    /// Closes the physical connection. Calling it twice is a no-op.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Lists user tables; used through the metadata connection.
    fn list_tables(&self) -> Result<Vec<String>, DriverError>;

    fn begin_transaction(&self) -> Result<(), DriverError> {
        self.execute("BEGIN", &CancellationToken::new()).map(|_| ())
    }

    fn commit_transaction(&self) -> Result<(), DriverError> {
        self.execute("COMMIT", &CancellationToken::new()).map(|_| ())
    }

    fn rollback_transaction(&self) -> Result<(), DriverError> {
        self.execute("ROLLBACK", &CancellationToken::new()).map(|_| ())
    }
}

/// Shared handle to a connected driver
pub type DriverRef = Arc<dyn DatabaseDriver>;

/// Opens connected drivers from a connection string.
pub trait DriverFactory: Send + Sync {
    fn open(&self, connection_string: &str) -> Result<DriverRef, DriverError>;
}
