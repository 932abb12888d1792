//! Async query executor
//!
//! Runs submitted SQL on a background worker per query and exposes the
//! `Pending -> Running -> {Completed | Failed | Cancelled}` state machine
//! through non-blocking reads. The worker is the only writer of a terminal
//! state, so a cancel racing natural completion is resolved exactly once.
//!
//! At most one query (or exclusive lease, see [`ConnectionLease`]) owns a
//! connection's query driver at any time; a second claimant is rejected with
//! `ConnectionConflict` rather than queued.
//!
//! Lock order is table, then task. Workers only ever take their task lock.
use crate::core::db::{
    split_statements, CancellationToken, DatabaseDriver, DriverError, DriverRef, ResultSet,
};
use crate::core::{lock, Result, SessionError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl QueryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueryStatus::Completed | QueryStatus::Failed | QueryStatus::Cancelled
        )
    }
}

/// One statement's outcome inside a multi-statement query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatementResult {
    pub statement: String,
    pub data: Arc<ResultSet>,
}

/// Payload of a completed query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum QueryOutput {
    #[serde(rename = "result")]
    Single(Arc<ResultSet>),
    #[serde(rename = "results")]
    Multiple(Vec<StatementResult>),
}

impl QueryOutput {
    pub fn affected_rows(&self) -> u64 {
        match self {
            QueryOutput::Single(rs) => rs.affected_rows,
            QueryOutput::Multiple(results) => results.iter().map(|r| r.data.affected_rows).sum(),
        }
    }

    pub fn execution_time_ms(&self) -> f64 {
        match self {
            QueryOutput::Single(rs) => rs.execution_time_ms,
            QueryOutput::Multiple(results) => results.iter().map(|r| r.data.execution_time_ms).sum(),
        }
    }
}

/// What the worker hands to the completion hook before publishing a
/// terminal state. Synchronous executions have no query id.
#[derive(Debug)]
pub struct QueryReport<'a> {
    pub query_id: Option<&'a str>,
    pub connection_id: &'a str,
    pub sql: &'a str,
    pub status: QueryStatus,
    pub output: Option<&'a QueryOutput>,
    pub error: Option<&'a str>,
    pub elapsed_ms: f64,
}

/// Snapshot returned by a poll
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncQueryResult {
    pub query_id: String,
    pub connection_id: String,
    pub status: QueryStatus,
    pub cached: bool,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Arc<ResultSet>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<StatementResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
struct TaskState {
    status: QueryStatus,
    /// Set by the worker once it has decided the terminal status
    finishing: bool,
    output: Option<QueryOutput>,
    error: Option<String>,
    finished: Option<Instant>,
    last_touched: Instant,
}

struct QueryTask {
    id: String,
    connection_id: String,
    sql: String,
    cached: bool,
    started_at: DateTime<Utc>,
    started: Instant,
    token: CancellationToken,
    driver: Option<DriverRef>,
    state: Mutex<TaskState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueryTask {
    fn new(connection_id: &str, sql: &str, driver: Option<DriverRef>, state: TaskState) -> Self {
        QueryTask {
            id: format!("query_{}", Uuid::new_v4().simple()),
            connection_id: connection_id.to_string(),
            sql: sql.to_string(),
            cached: false,
            started_at: Utc::now(),
            started: Instant::now(),
            token: CancellationToken::new(),
            driver,
            state: Mutex::new(state),
            worker: Mutex::new(None),
        }
    }

    fn is_active(&self) -> bool {
        !lock(&self.state).status.is_terminal()
    }

    /// Signals cancellation unless the outcome is already decided.
    ///
    /// The driver is interrupted under the state lock, so the interrupt lands
    /// before the worker can decide an outcome and free the connection.
    fn request_cancel(&self) -> bool {
        let state = lock(&self.state);
        if state.status.is_terminal() || state.finishing {
            return false;
        }
        self.token.cancel();
        if let Some(driver) = &self.driver {
            driver.cancel();
        }
        drop(state);
        true
    }

    fn snapshot(&self) -> AsyncQueryResult {
        let mut state = lock(&self.state);
        state.last_touched = Instant::now();

        let elapsed = match state.finished {
            Some(finished) => finished.duration_since(self.started),
            None => self.started.elapsed(),
        };
        let (result, results) = match &state.output {
            Some(QueryOutput::Single(rs)) => (Some(Arc::clone(rs)), Vec::new()),
            Some(QueryOutput::Multiple(results)) => (None, results.clone()),
            None => (None, Vec::new()),
        };

        AsyncQueryResult {
            query_id: self.id.clone(),
            connection_id: self.connection_id.clone(),
            status: state.status,
            cached: self.cached,
            started_at: self.started_at,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            result,
            results,
            error: state.error.clone(),
        }
    }

    /// Idle time measured from the last poll or the end of execution
    fn idle_for(&self, now: Instant) -> Duration {
        let state = lock(&self.state);
        now.saturating_duration_since(state.last_touched)
    }
}

enum Occupant {
    Query(Arc<QueryTask>),
    /// Held by a `ConnectionLease`
    Exclusive,
}

struct QueryTable {
    queries: HashMap<String, Arc<QueryTask>>,
    occupants: HashMap<String, Occupant>,
    last_sweep: Instant,
}

impl QueryTable {
    fn ensure_idle(&self, connection_id: &str) -> Result<()> {
        match self.occupants.get(connection_id) {
            Some(Occupant::Exclusive) => Err(SessionError::ConnectionConflict {
                connection_id: connection_id.to_string(),
                query_id: None,
            }),
            Some(Occupant::Query(task)) if task.is_active() => Err(SessionError::ConnectionConflict {
                connection_id: connection_id.to_string(),
                query_id: Some(task.id.clone()),
            }),
            _ => Ok(()),
        }
    }

    fn release(&mut self, query_id: &str) {
        let owned = self
            .occupants
            .iter()
            .find(|(_, o)| matches!(o, Occupant::Query(t) if t.id == query_id && !t.is_active()))
            .map(|(conn, _)| conn.clone());
        if let Some(conn) = owned {
            self.occupants.remove(&conn);
        }
    }
}

/// Exclusive hold on a connection's query driver for synchronous work
/// (transaction control, row counts). Released on drop.
pub struct ConnectionLease {
    table: Arc<Mutex<QueryTable>>,
    connection_id: String,
}

impl ConnectionLease {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        let mut table = lock(&self.table);
        if matches!(table.occupants.get(&self.connection_id), Some(Occupant::Exclusive)) {
            table.occupants.remove(&self.connection_id);
        }
    }
}

pub struct AsyncQueryExecutor {
    table: Arc<Mutex<QueryTable>>,
    idle_timeout: Duration,
    sweep_interval: Duration,
}

impl AsyncQueryExecutor {
    pub fn new(idle_timeout: Duration, sweep_interval: Duration) -> Self {
        AsyncQueryExecutor {
            table: Arc::new(Mutex::new(QueryTable {
                queries: HashMap::new(),
                occupants: HashMap::new(),
                last_sweep: Instant::now(),
            })),
            idle_timeout,
            sweep_interval,
        }
    }

    /// Registers `sql` and starts a worker running it on `driver`.
    ///
    /// `on_finish` runs on the worker after the outcome is decided and
    /// before it becomes visible to pollers.
    pub fn submit<F>(&self, connection_id: &str, sql: &str, driver: DriverRef, on_finish: F) -> Result<String>
    where
        F: FnOnce(&QueryReport<'_>) + Send + 'static,
    {
        let statements = split_statements(sql);
        if statements.is_empty() {
            return Err(SessionError::EmptyQuery);
        }
        self.sweep(false);

        let now = Instant::now();
        let task = Arc::new(QueryTask::new(
            connection_id,
            sql,
            Some(Arc::clone(&driver)),
            TaskState {
                status: QueryStatus::Pending,
                finishing: false,
                output: None,
                error: None,
                finished: None,
                last_touched: now,
            },
        ));

        {
            let mut table = lock(&self.table);
            table.ensure_idle(connection_id)?;
            table
                .occupants
                .insert(connection_id.to_string(), Occupant::Query(Arc::clone(&task)));
            table.queries.insert(task.id.clone(), Arc::clone(&task));
        }

        let worker_task = Arc::clone(&task);
        let spawned = thread::Builder::new()
            .name(format!("querydeck-{}", connection_id))
            .spawn(move || run_query(worker_task, driver, statements, on_finish));

        match spawned {
            Ok(handle) => {
                *lock(&task.worker) = Some(handle);
                debug!(query_id = %task.id, connection_id, "Submitted async query");
                Ok(task.id.clone())
            }
            Err(err) => {
                let mut table = lock(&self.table);
                table.queries.remove(&task.id);
                table.occupants.remove(connection_id);
                Err(err.into())
            }
        }
    }

    /// Registers an already completed query served from the result cache.
    pub fn submit_cached(&self, connection_id: &str, sql: &str, result: Arc<ResultSet>) -> Result<String> {
        let now = Instant::now();
        let mut task = QueryTask::new(
            connection_id,
            sql,
            None,
            TaskState {
                status: QueryStatus::Completed,
                finishing: true,
                output: Some(QueryOutput::Single(result)),
                error: None,
                finished: Some(now),
                last_touched: now,
            },
        );
        task.cached = true;
        task.started = now;
        let task = Arc::new(task);

        let mut table = lock(&self.table);
        table.ensure_idle(connection_id)?;
        table.queries.insert(task.id.clone(), Arc::clone(&task));
        debug!(query_id = %task.id, connection_id, "Served async query from cache");
        Ok(task.id.clone())
    }

    /// Non-blocking read of a query's current state
    pub fn get_result(&self, query_id: &str) -> Result<AsyncQueryResult> {
        let task = lock(&self.table).queries.get(query_id).cloned();
        let snapshot = task
            .map(|t| t.snapshot())
            .ok_or_else(|| SessionError::QueryNotFound(query_id.to_string()))?;
        self.sweep(false);
        Ok(snapshot)
    }

    /// Requests cancellation; false for unknown or already decided queries
    pub fn cancel(&self, query_id: &str) -> bool {
        let task = lock(&self.table).queries.get(query_id).cloned();
        let cancelled = task.is_some_and(|t| t.request_cancel());
        if cancelled {
            debug!(query_id, "Cancellation requested");
        }
        cancelled
    }

    /// Cancels whatever query currently owns the connection
    pub fn cancel_connection(&self, connection_id: &str) -> bool {
        let task = match lock(&self.table).occupants.get(connection_id) {
            Some(Occupant::Query(task)) => Some(Arc::clone(task)),
            _ => None,
        };
        task.is_some_and(|t| t.request_cancel())
    }

    /// Ids of queries still pending or running, oldest first
    pub fn active_queries(&self) -> Vec<String> {
        self.sweep(false);
        let table = lock(&self.table);
        let mut active: Vec<&Arc<QueryTask>> =
            table.queries.values().filter(|t| t.is_active()).collect();
        active.sort_by_key(|t| t.started);
        active.iter().map(|t| t.id.clone()).collect()
    }

    /// Forgets a query, force-cancelling it first when still active.
    ///
    /// A cancelled query keeps its connection claimed until its worker
    /// actually stops.
    pub fn remove(&self, query_id: &str) -> bool {
        let mut table = lock(&self.table);
        let Some(task) = table.queries.remove(query_id) else {
            return false;
        };
        if task.is_active() {
            task.request_cancel();
        } else {
            table.release(query_id);
        }
        debug!(query_id, "Removed async query");
        true
    }

    pub fn ensure_idle(&self, connection_id: &str) -> Result<()> {
        lock(&self.table).ensure_idle(connection_id)
    }

    pub fn is_busy(&self, connection_id: &str) -> bool {
        self.ensure_idle(connection_id).is_err()
    }

    /// Claims the connection for synchronous work on its query driver
    pub fn reserve(&self, connection_id: &str) -> Result<ConnectionLease> {
        let mut table = lock(&self.table);
        table.ensure_idle(connection_id)?;
        table
            .occupants
            .insert(connection_id.to_string(), Occupant::Exclusive);
        Ok(ConnectionLease {
            table: Arc::clone(&self.table),
            connection_id: connection_id.to_string(),
        })
    }

    /// Reclaims queries nobody polled within the idle timeout. Finished ones
    /// are dropped; active ones are cancelled and dropped on a later sweep.
    ///
    /// Without `force` this is a no-op until the sweep interval has elapsed.
    pub fn sweep(&self, force: bool) -> usize {
        let now = Instant::now();
        let mut to_cancel = Vec::new();
        let mut removed = 0;
        {
            let mut table = lock(&self.table);
            if !force && now.duration_since(table.last_sweep) < self.sweep_interval {
                return 0;
            }
            table.last_sweep = now;

            // Queries removed while active leave their occupant behind
            table.occupants.retain(|_, occupant| match occupant {
                Occupant::Query(task) => task.is_active(),
                Occupant::Exclusive => true,
            });

            let idle: Vec<Arc<QueryTask>> = table
                .queries
                .values()
                .filter(|t| t.idle_for(now) >= self.idle_timeout)
                .cloned()
                .collect();
            for task in idle {
                if task.is_active() {
                    to_cancel.push(task);
                } else {
                    table.queries.remove(&task.id);
                    table.release(&task.id);
                    removed += 1;
                }
            }
        }

        for task in to_cancel {
            if task.request_cancel() {
                warn!(query_id = %task.id, connection_id = %task.connection_id, "Cancelling abandoned query");
            }
        }
        if removed > 0 {
            warn!(removed, "Reclaimed idle async queries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        lock(&self.table).queries.len()
    }

    /// Connections currently claimed by a query or a lease
    pub fn occupied_connections(&self) -> usize {
        lock(&self.table).occupants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels every active query and waits for all workers to exit
    pub fn shutdown(&self) {
        let tasks: Vec<Arc<QueryTask>> = {
            let table = lock(&self.table);
            let mut tasks: Vec<Arc<QueryTask>> = table.queries.values().cloned().collect();
            // Removed-but-still-running queries are only reachable as occupants
            for occupant in table.occupants.values() {
                if let Occupant::Query(task) = occupant {
                    if !tasks.iter().any(|t| Arc::ptr_eq(t, task)) {
                        tasks.push(Arc::clone(task));
                    }
                }
            }
            tasks
        };

        for task in &tasks {
            task.request_cancel();
        }
        for task in &tasks {
            let handle = lock(&task.worker).take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    warn!(query_id = %task.id, "Query worker panicked");
                }
            }
        }
    }
}

impl Drop for AsyncQueryExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_query<F>(task: Arc<QueryTask>, driver: DriverRef, statements: Vec<String>, on_finish: F)
where
    F: FnOnce(&QueryReport<'_>),
{
    {
        let mut state = lock(&task.state);
        if !task.token.is_cancelled() {
            state.status = QueryStatus::Running;
        }
    }

    let outcome = if task.token.is_cancelled() {
        Err(DriverError::interrupted())
    } else {
        panic::catch_unwind(AssertUnwindSafe(|| {
            execute_statements(driver.as_ref(), &statements, &task.token)
        }))
        .unwrap_or_else(|payload| {
            Err(DriverError::new(format!("Driver panicked: {}", panic_message(&*payload))))
        })
    };

    let (status, output, error) = {
        let mut state = lock(&task.state);
        state.finishing = true;
        if task.token.is_cancelled() {
            (QueryStatus::Cancelled, None, None)
        } else {
            match outcome {
                Ok(output) => (QueryStatus::Completed, Some(output), None),
                Err(err) => (QueryStatus::Failed, None, Some(err.message)),
            }
        }
    };

    match status {
        QueryStatus::Failed => warn!(
            query_id = %task.id,
            error = error.as_deref().unwrap_or_default(),
            "Async query failed"
        ),
        _ => debug!(query_id = %task.id, ?status, "Async query finished"),
    }

    let report = QueryReport {
        query_id: Some(task.id.as_str()),
        connection_id: &task.connection_id,
        sql: &task.sql,
        status,
        output: output.as_ref(),
        error: error.as_deref(),
        elapsed_ms: task.started.elapsed().as_secs_f64() * 1000.0,
    };
    if panic::catch_unwind(AssertUnwindSafe(|| on_finish(&report))).is_err() {
        warn!(query_id = %task.id, "Query completion hook panicked");
    }

    let now = Instant::now();
    let mut state = lock(&task.state);
    state.status = status;
    state.output = output;
    state.error = error;
    state.finished = Some(now);
    state.last_touched = now;
}

/// Runs the statements in order, stopping at the first failure. A failure
/// inside a script names the statement's position in its message.
pub(crate) fn execute_statements(
    driver: &dyn DatabaseDriver,
    statements: &[String],
    token: &CancellationToken,
) -> std::result::Result<QueryOutput, DriverError> {
    if let [single] = statements {
        return driver
            .execute(single, token)
            .map(|rs| QueryOutput::Single(Arc::new(rs)));
    }

    let total = statements.len();
    let mut results = Vec::with_capacity(total);
    for (i, statement) in statements.iter().enumerate() {
        if token.is_cancelled() {
            return Err(DriverError::interrupted());
        }
        let data = driver.execute(statement, token).map_err(|e| DriverError {
            message: format!("Statement {} of {}: {}", i + 1, total, e.message),
            ..e
        })?;
        results.push(StatementResult {
            statement: statement.clone(),
            data: Arc::new(data),
        });
    }
    Ok(QueryOutput::Multiple(results))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
