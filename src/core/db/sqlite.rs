/// SQLite Driver Module
///
/// The bundled `DatabaseDriver` backend, built on rusqlite. Each driver owns
/// one physical connection; statements are executed under the connection
/// mutex while cancellation goes through rusqlite's interrupt handle, which
/// needs no lock.

use super::driver::{
    CancellationToken, ColumnInfo, DatabaseDriver, DriverError, DriverRef, DriverFactory, ResultSet,
};
use crate::core::lock;
use rusqlite::types::{Type, ValueRef};
use rusqlite::{Connection, ErrorCode, InterruptHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Number of VM instructions between cancellation checks
const PROGRESS_INTERVAL_OPS: i32 = 1_000;

/// How long a statement waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl From<rusqlite::Error> for DriverError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::OperationInterrupted => {
                DriverError::interrupted()
            }
            rusqlite::Error::SqliteFailure(e, msg) => {
                DriverError::with_code(e.extended_code, msg.clone().unwrap_or_else(|| e.to_string()))
            }
            _ => DriverError::new(err.to_string()),
        }
    }
}

/// A single SQLite connection usable from several threads.
pub struct SqliteDriver {
    conn: Mutex<Option<Connection>>,
    interrupt: InterruptHandle,
    connected: AtomicBool,
    max_rows: usize,
}

impl SqliteDriver {
    /// Opens a connection to the database at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - Database file, `:memory:`, or a `file:` URI
    /// * `max_rows` - Rows kept per result set; the rest are dropped and the result is marked truncated
    pub fn open(path: &str, max_rows: usize) -> Result<Self, DriverError> {
        let conn = Connection::open(path)?;

        // Initialize connection with common pragmas
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
        ",
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let interrupt = conn.get_interrupt_handle();
        debug!("Opened SQLite connection to {}", path);

        Ok(SqliteDriver {
            conn: Mutex::new(Some(conn)),
            interrupt,
            connected: AtomicBool::new(true),
            max_rows,
        })
    }
}

impl DatabaseDriver for SqliteDriver {
    fn execute(&self, sql: &str, cancel: &CancellationToken) -> Result<ResultSet, DriverError> {
        let guard = lock(&self.conn);
        let conn = guard
            .as_ref()
            .ok_or_else(|| DriverError::new("connection is closed"))?;

        if cancel.is_cancelled() {
            return Err(DriverError::interrupted());
        }

        // The handler sees cancels that land before the first step, which
        // sqlite3_interrupt alone would miss.
        let flag = cancel.flag();
        conn.progress_handler(
            PROGRESS_INTERVAL_OPS,
            Some(move || flag.load(Ordering::SeqCst)),
        );

        let started = Instant::now();
        let result = run_statement(conn, sql, self.max_rows);
        conn.progress_handler(0, None::<fn() -> bool>);

        let mut result_set = result?;
        result_set.execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        Ok(result_set)
    }

    fn cancel(&self) {
        self.interrupt.interrupt();
    }

    fn disconnect(&self) {
        let conn = lock(&self.conn).take();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(conn) = conn {
            if let Err((_, e)) = conn.close() {
                warn!("Failed to close SQLite connection cleanly: {}", e);
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn list_tables(&self) -> Result<Vec<String>, DriverError> {
        let guard = lock(&self.conn);
        let conn = guard
            .as_ref()
            .ok_or_else(|| DriverError::new("connection is closed"))?;

        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }
}

/// Opens `SqliteDriver`s; connection strings are paths with an optional `sqlite://` prefix.
#[derive(Debug, Clone)]
pub struct SqliteDriverFactory {
    max_rows: usize,
}

impl SqliteDriverFactory {
    pub fn new(max_rows: usize) -> Self {
        SqliteDriverFactory { max_rows }
    }
}

impl DriverFactory for SqliteDriverFactory {
    fn open(&self, connection_string: &str) -> Result<DriverRef, DriverError> {
        let path = connection_string
            .strip_prefix("sqlite://")
            .unwrap_or(connection_string);
        Ok(Arc::new(SqliteDriver::open(path, self.max_rows)?))
    }
}

fn run_statement(conn: &Connection, sql: &str, max_rows: usize) -> rusqlite::Result<ResultSet> {
    let mut stmt = conn.prepare(sql)?;
    let column_count = stmt.column_count();

    if column_count == 0 {
        let affected = stmt.execute([])?;
        return Ok(ResultSet::affected(affected as u64));
    }

    let declared: Vec<(String, Option<String>)> = stmt
        .columns()
        .iter()
        .map(|c| (c.name().to_string(), c.decl_type().map(str::to_string)))
        .collect();

    let mut inferred: Vec<Option<&'static str>> = vec![None; column_count];
    let mut rows = Vec::new();
    let mut truncated = false;

    let mut cursor = stmt.query([])?;
    while let Some(row) = cursor.next()? {
        if rows.len() >= max_rows {
            truncated = true;
            break;
        }
        let mut values = Vec::with_capacity(column_count);
        for (i, slot) in inferred.iter_mut().enumerate() {
            let value = row.get_ref(i)?;
            if slot.is_none() {
                *slot = storage_class(value.data_type());
            }
            values.push(format_value(value));
        }
        rows.push(values);
    }

    let columns = declared
        .into_iter()
        .zip(inferred)
        .map(|((name, decl), guess)| {
            let type_name = decl
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| guess.unwrap_or("NULL").to_string());
            ColumnInfo::new(name, type_name)
        })
        .collect();

    let mut result_set = ResultSet::new(columns, rows);
    result_set.truncated = truncated;
    Ok(result_set)
}

fn storage_class(data_type: Type) -> Option<&'static str> {
    match data_type {
        Type::Null => None,
        Type::Integer => Some("INTEGER"),
        Type::Real => Some("REAL"),
        Type::Text => Some("TEXT"),
        Type::Blob => Some("BLOB"),
    }
}

/// Formats a SQLite value for transfer; NULL stays distinguishable from text
fn format_value(value: ValueRef) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => Some(format!("<BLOB: {} bytes>", b.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    const ENDLESS_QUERY: &str =
        "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT count(*) FROM c";

    fn open_temp(max_rows: usize) -> (TempDir, SqliteDriver) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let driver = SqliteDriver::open(path.to_str().unwrap(), max_rows).unwrap();
        (dir, driver)
    }

    fn setup_test_table(driver: &SqliteDriver) {
        let token = CancellationToken::new();
        driver
            .execute("CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT, value REAL)", &token)
            .unwrap();
        driver
            .execute(
                "INSERT INTO test (name, value) VALUES ('Alice', 123.45), ('Bob', 678.90), (NULL, NULL)",
                &token,
            )
            .unwrap();
    }

    #[test]
    fn test_select_literal() {
        let (_dir, driver) = open_temp(100);
        let rs = driver.execute("SELECT 1", &CancellationToken::new()).unwrap();
        assert_eq!(rs.columns, vec![ColumnInfo::new("1", "INTEGER")]);
        assert_eq!(rs.rows, vec![vec![Some("1".to_string())]]);
        assert!(!rs.truncated);
    }

    #[test]
    fn test_query_execution_with_nulls() {
        let (_dir, driver) = open_temp(100);
        setup_test_table(&driver);

        let rs = driver
            .execute("SELECT * FROM test ORDER BY id", &CancellationToken::new())
            .unwrap();
        let names: Vec<&str> = rs.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name", "value"]);
        assert_eq!(rs.columns[1].type_name, "TEXT");
        assert_eq!(rs.rows.len(), 3);
        assert_eq!(
            rs.rows[0],
            vec![Some("1".to_string()), Some("Alice".to_string()), Some("123.45".to_string())]
        );
        assert_eq!(rs.rows[2], vec![Some("3".to_string()), None, None]);
    }

    #[test]
    fn test_affected_rows() {
        let (_dir, driver) = open_temp(100);
        setup_test_table(&driver);

        let rs = driver
            .execute("UPDATE test SET value = 0 WHERE name IS NOT NULL", &CancellationToken::new())
            .unwrap();
        assert!(rs.columns.is_empty());
        assert_eq!(rs.affected_rows, 2);
    }

    #[test]
    fn test_rows_beyond_cap_are_truncated() {
        let (_dir, driver) = open_temp(2);
        setup_test_table(&driver);

        let rs = driver
            .execute("SELECT id FROM test", &CancellationToken::new())
            .unwrap();
        assert_eq!(rs.rows.len(), 2);
        assert!(rs.truncated);
    }

    #[test]
    fn test_query_error_keeps_native_message() {
        let (_dir, driver) = open_temp(100);
        let err = driver
            .execute("SELECT * FROM nonexistent_table", &CancellationToken::new())
            .unwrap_err();
        assert!(err.message.contains("no such table"));
        assert!(err.code.is_some());
        assert!(!err.interrupted);
    }

    #[test]
    fn test_blob_handling() {
        let (_dir, driver) = open_temp(100);
        let token = CancellationToken::new();
        driver.execute("CREATE TABLE blobs (id INTEGER, data BLOB)", &token).unwrap();
        driver.execute("INSERT INTO blobs VALUES (1, X'48656C6C6F')", &token).unwrap();

        let rs = driver.execute("SELECT data FROM blobs", &token).unwrap();
        assert_eq!(rs.rows[0][0].as_deref(), Some("<BLOB: 5 bytes>"));
    }

    #[test]
    fn test_pre_cancelled_token_never_runs() {
        let (_dir, driver) = open_temp(100);
        let token = CancellationToken::new();
        token.cancel();
        let err = driver.execute(ENDLESS_QUERY, &token).unwrap_err();
        assert!(err.interrupted);
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let (_dir, driver) = open_temp(100);
        let driver = Arc::new(driver);
        let token = CancellationToken::new();

        let worker = {
            let driver = Arc::clone(&driver);
            let token = token.clone();
            thread::spawn(move || driver.execute(ENDLESS_QUERY, &token))
        };

        thread::sleep(Duration::from_millis(50));
        token.cancel();
        driver.cancel();

        let err = worker.join().unwrap().unwrap_err();
        assert!(err.interrupted);

        // The connection stays usable afterwards
        let rs = driver.execute("SELECT 2", &CancellationToken::new()).unwrap();
        assert_eq!(rs.rows[0][0].as_deref(), Some("2"));
    }

    #[test]
    fn test_list_tables() {
        let (_dir, driver) = open_temp(100);
        setup_test_table(&driver);
        driver
            .execute("CREATE VIEW named AS SELECT name FROM test", &CancellationToken::new())
            .unwrap();
        assert_eq!(driver.list_tables().unwrap(), vec!["named", "test"]);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (_dir, driver) = open_temp(100);
        assert!(driver.is_connected());
        driver.disconnect();
        driver.disconnect();
        assert!(!driver.is_connected());

        let err = driver.execute("SELECT 1", &CancellationToken::new()).unwrap_err();
        assert!(err.message.contains("closed"));
    }

    #[test]
    fn test_factory_strips_scheme() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("factory.db");
        let factory = SqliteDriverFactory::new(10);
        let driver = factory
            .open(&format!("sqlite://{}", path.to_str().unwrap()))
            .unwrap();
        assert!(driver.is_connected());
        assert!(path.exists());
    }

    #[test]
    fn test_open_failure() {
        let result = SqliteDriver::open("/nonexistent/path/database.db", 10);
        assert!(result.is_err());
    }
}
