/// # Test Utilities Module
///
/// Scriptable drivers for exercising the session engine without a database.
///
/// `MockDriver` decides what to do from the first word of each statement:
/// - `LONG ...` blocks until cancelled (or five seconds pass)
/// - `SLEEP <ms>` ignores the token and returns one row after `ms`
///   milliseconds, unless a slow-cancel driver interrupts it mid-flight
/// - `FAIL <message>` returns a driver error carrying the message
/// - `PANIC` panics inside the driver
/// - `SELECT ...` / `WITH ...` return one column `_c0` with a single row `1`
/// - anything else reports one affected row

use crate::core::db::{
    CancellationToken, ColumnInfo, DatabaseDriver, DriverError, DriverFactory, DriverRef,
    ResultSet,
};
use crate::core::lock;
use crate::executor::{AsyncQueryExecutor, AsyncQueryResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const LONG_LIMIT: Duration = Duration::from_secs(5);
const POLL_STEP: Duration = Duration::from_millis(2);

#[derive(Default)]
pub struct MockDriver {
    executed: Mutex<Vec<String>>,
    cancels: AtomicUsize,
    disconnects: AtomicUsize,
    disconnected: AtomicBool,
    running: AtomicBool,
    interrupted: AtomicBool,
    /// `None` keeps `cancel` a counter only
    slow_cancel: Option<Duration>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A driver whose `cancel` takes `delay` before it interrupts whatever
    /// statement is running at that moment
    pub fn with_slow_cancel(delay: Duration) -> Arc<Self> {
        Arc::new(MockDriver {
            slow_cancel: Some(delay),
            ..Self::default()
        })
    }

    /// Statements passed to `execute`, in order
    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn respond(&self, sql: &str, cancel: &CancellationToken) -> Result<ResultSet, DriverError> {
        let mut words = sql.split_whitespace();
        let first = words.next().unwrap_or_default().to_uppercase();

        match first.as_str() {
            "LONG" => {
                let started = Instant::now();
                while started.elapsed() < LONG_LIMIT {
                    if cancel.is_cancelled() {
                        return Err(DriverError::interrupted());
                    }
                    thread::sleep(POLL_STEP);
                }
                Ok(Self::single_value())
            }
            "SLEEP" => {
                let ms = words.next().and_then(|w| w.parse().ok()).unwrap_or(0);
                let until = Instant::now() + Duration::from_millis(ms);
                while Instant::now() < until {
                    if self.interrupted.load(Ordering::SeqCst) {
                        return Err(DriverError::interrupted());
                    }
                    thread::sleep(POLL_STEP);
                }
                Ok(Self::single_value())
            }
            "FAIL" => Err(DriverError::with_code(
                42,
                words.collect::<Vec<_>>().join(" "),
            )),
            "PANIC" => panic!("mock driver exploded"),
            "SELECT" | "WITH" => Ok(Self::single_value()),
            _ => Ok(ResultSet::affected(1)),
        }
    }

    fn single_value() -> ResultSet {
        ResultSet::new(
            vec![ColumnInfo::new("_c0", "int")],
            vec![vec![Some("1".to_string())]],
        )
    }
}

impl DatabaseDriver for MockDriver {
    fn execute(&self, sql: &str, cancel: &CancellationToken) -> Result<ResultSet, DriverError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(DriverError::new("connection is closed"));
        }
        lock(&self.executed).push(sql.to_string());
        self.interrupted.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        let result = self.respond(sql, cancel);
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.slow_cancel {
            thread::sleep(delay);
            if self.running.load(Ordering::SeqCst) {
                self.interrupted.store(true, Ordering::SeqCst);
            }
        }
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.disconnected.store(true, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    fn list_tables(&self) -> Result<Vec<String>, DriverError> {
        Ok(vec!["mock_table".to_string()])
    }
}

/// Opens `MockDriver`s and keeps every one it handed out.
///
/// Connection strings starting with `fail` are refused; `fail-second` lets
/// the first open through and refuses the next.
#[derive(Default)]
pub struct MockDriverFactory {
    opened: Mutex<Vec<Arc<MockDriver>>>,
}

impl MockDriverFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opened(&self) -> Vec<Arc<MockDriver>> {
        lock(&self.opened).clone()
    }
}

impl DriverFactory for MockDriverFactory {
    fn open(&self, connection_string: &str) -> Result<DriverRef, DriverError> {
        let mut opened = lock(&self.opened);
        let refuse = match connection_string {
            "fail-second" => opened.len() % 2 == 1,
            s => s.starts_with("fail"),
        };
        if refuse {
            return Err(DriverError::new(format!("cannot open {}", connection_string)));
        }
        let driver = MockDriver::new();
        opened.push(Arc::clone(&driver));
        Ok(driver)
    }
}

/// Polls until the query reaches a terminal state (or panics after a deadline)
pub fn wait_for_terminal(executor: &AsyncQueryExecutor, query_id: &str) -> AsyncQueryResult {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let result = executor
            .get_result(query_id)
            .expect("query should still be registered");
        if result.status.is_terminal() {
            return result;
        }
        assert!(Instant::now() < deadline, "query {} never finished", query_id);
        thread::sleep(POLL_STEP);
    }
}

/// Waits until the mock driver is inside `execute`
pub fn wait_until_running(driver: &MockDriver) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !driver.is_running() {
        assert!(Instant::now() < deadline, "driver never started executing");
        thread::sleep(POLL_STEP);
    }
}
