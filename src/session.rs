//! Session facade
//!
//! The composition root of the engine: owns the registry, executor, cache,
//! history and transaction bookkeeping, and exposes the request/response
//! operations a transport layer dispatches to.
use crate::cache::{CacheKey, CacheStats, ResultCache};
use crate::config::Settings;
use crate::core::db::{
    is_read_only, split_statements, CancellationToken, DriverError, DriverFactory,
    SqliteDriverFactory,
};
use crate::core::{Result, SessionError};
use crate::executor::{
    execute_statements, AsyncQueryExecutor, AsyncQueryResult, QueryOutput, QueryReport, QueryStatus,
};
use crate::history::{HistoryEntry, HistoryRecord, QueryHistory};
use crate::registry::ConnectionRegistry;
use crate::transaction::{TransactionManager, TransactionState};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Per-call options for `execute_query` and `execute_async_query_with`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Serve from and store into the result cache when the query is eligible
    pub use_cache: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        ExecuteOptions { use_cache: true }
    }
}

/// Statements of one request and how they interact with the result cache
struct QueryPlan {
    statements: Vec<String>,
    writes: bool,
    cache_key: Option<CacheKey>,
}

pub struct Session {
    settings: Settings,
    registry: ConnectionRegistry,
    executor: AsyncQueryExecutor,
    transactions: TransactionManager,
    cache: Arc<ResultCache>,
    history: Arc<QueryHistory>,
}

impl Session {
    pub fn new(settings: Settings, factory: Arc<dyn DriverFactory>) -> Self {
        let executor = AsyncQueryExecutor::new(
            settings.query.idle_timeout(),
            settings.query.sweep_interval(),
        );
        Session {
            registry: ConnectionRegistry::new(factory),
            executor,
            transactions: TransactionManager::new(),
            cache: Arc::new(ResultCache::new(settings.cache.max_memory_bytes())),
            history: Arc::new(QueryHistory::new(settings.history.max_entries)),
            settings,
        }
    }

    /// A session whose connection strings are SQLite paths
    pub fn with_sqlite(settings: Settings) -> Self {
        let factory = Arc::new(SqliteDriverFactory::new(settings.query.max_rows));
        Session::new(settings, factory)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn connect(&self, connection_string: &str) -> Result<String> {
        self.registry.connect(connection_string)
    }

    pub fn test_connection(&self, connection_string: &str) -> Result<()> {
        Ok(self.registry.test_connection(connection_string)?)
    }

    /// Cancels the connection's in-flight query, closes both drivers and
    /// drops its transaction state and cached results. Unknown ids are a
    /// no-op.
    pub fn disconnect(&self, connection_id: &str) {
        if self.executor.cancel_connection(connection_id) {
            info!(connection_id, "Cancelled in-flight query before disconnect");
        }
        self.registry.disconnect(connection_id);
        self.transactions.cleanup_connection(connection_id);
        self.cache.invalidate_connection(connection_id);
    }

    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.registry.is_connected(connection_id)
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.registry.connection_ids()
    }

    pub fn execute_async_query(&self, connection_id: &str, sql: &str) -> Result<String> {
        self.execute_async_query_with(connection_id, sql, ExecuteOptions::default())
    }

    /// Starts `sql` in the background and returns its query id.
    ///
    /// A single read-only statement may be answered from the result cache,
    /// in which case the returned query is already completed and marked
    /// `cached`.
    pub fn execute_async_query_with(
        &self,
        connection_id: &str,
        sql: &str,
        options: ExecuteOptions,
    ) -> Result<String> {
        let driver = self.registry.get_query_driver(connection_id)?;
        self.executor.ensure_idle(connection_id)?;
        let QueryPlan { writes, cache_key, .. } = self.plan(connection_id, sql, options)?;

        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key) {
                debug!(connection_id, "Result cache hit");
                return self.executor.submit_cached(connection_id, sql, hit);
            }
        }

        let cache = Arc::clone(&self.cache);
        let history = Arc::clone(&self.history);
        self.executor.submit(connection_id, sql, driver, move |report: &QueryReport<'_>| {
            record_outcome(report, &history, &cache, cache_key, writes)
        })
    }

    /// Runs `sql` to completion on the calling thread.
    ///
    /// The connection is held exclusively meanwhile, so this fails with
    /// `ConnectionConflict` while an async query is in flight and blocks
    /// async submissions until it returns. `cancel_query` interrupts it, in
    /// which case the error is `Cancelled`. Cache and history are updated the
    /// same way as for async queries.
    pub fn execute_query(
        &self,
        connection_id: &str,
        sql: &str,
        options: ExecuteOptions,
    ) -> Result<QueryOutput> {
        let driver = self.registry.get_query_driver(connection_id)?;
        let plan = self.plan(connection_id, sql, options)?;
        let _lease = self.executor.reserve(connection_id)?;

        if let Some(hit) = plan.cache_key.as_ref().and_then(|key| self.cache.get(key)) {
            debug!(connection_id, "Result cache hit");
            return Ok(QueryOutput::Single(hit));
        }

        let started = Instant::now();
        let outcome = execute_statements(driver.as_ref(), &plan.statements, &CancellationToken::new());
        let status = match &outcome {
            Ok(_) => QueryStatus::Completed,
            Err(err) if err.interrupted => QueryStatus::Cancelled,
            Err(_) => QueryStatus::Failed,
        };
        let report = QueryReport {
            query_id: None,
            connection_id,
            sql,
            status,
            output: outcome.as_ref().ok(),
            error: outcome.as_ref().err().map(|e| e.message.as_str()),
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        };
        record_outcome(&report, &self.history, &self.cache, plan.cache_key, plan.writes);

        match outcome {
            Ok(output) => Ok(output),
            Err(err) if err.interrupted => Err(SessionError::Cancelled),
            Err(err) => Err(err.into()),
        }
    }

    fn plan(&self, connection_id: &str, sql: &str, options: ExecuteOptions) -> Result<QueryPlan> {
        let statements = split_statements(sql);
        if statements.is_empty() {
            return Err(SessionError::EmptyQuery);
        }
        let writes = !statements.iter().all(|s| is_read_only(s));
        let cache_key = match statements.as_slice() {
            [single] if options.use_cache && self.settings.cache.enabled && !writes => {
                Some(CacheKey::new(connection_id, single))
            }
            _ => None,
        };
        Ok(QueryPlan {
            statements,
            writes,
            cache_key,
        })
    }

    pub fn get_async_query_result(&self, query_id: &str) -> Result<AsyncQueryResult> {
        self.executor.get_result(query_id)
    }

    pub fn cancel_async_query(&self, query_id: &str) -> bool {
        self.executor.cancel(query_id)
    }

    /// Cancels whatever the connection's query driver is running, including
    /// a synchronous `execute_query`. True only when an async query was
    /// cancelled.
    pub fn cancel_query(&self, connection_id: &str) -> Result<bool> {
        let driver = self.registry.get_query_driver(connection_id)?;
        if self.executor.cancel_connection(connection_id) {
            return Ok(true);
        }
        driver.cancel();
        Ok(false)
    }

    pub fn remove_async_query(&self, query_id: &str) -> bool {
        self.executor.remove(query_id)
    }

    pub fn get_active_queries(&self) -> Vec<String> {
        self.executor.active_queries()
    }

    pub fn begin_transaction(&self, connection_id: &str) -> Result<()> {
        let driver = self.registry.get_query_driver(connection_id)?;
        let _lease = self.executor.reserve(connection_id)?;
        self.transactions.begin(connection_id, driver.as_ref())
    }

    pub fn commit_transaction(&self, connection_id: &str) -> Result<()> {
        let driver = self.registry.get_query_driver(connection_id)?;
        let _lease = self.executor.reserve(connection_id)?;
        self.transactions.commit(connection_id, driver.as_ref())
    }

    pub fn rollback_transaction(&self, connection_id: &str) -> Result<()> {
        let driver = self.registry.get_query_driver(connection_id)?;
        let _lease = self.executor.reserve(connection_id)?;
        let result = self.transactions.rollback(connection_id, driver.as_ref());
        // Rolled-back writes may have been cached by reads inside the transaction
        self.cache.invalidate_connection(connection_id);
        result
    }

    pub fn transaction_state(&self, connection_id: &str) -> TransactionState {
        self.transactions.state(connection_id)
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn get_query_history(&self) -> Vec<HistoryEntry> {
        self.history.entries()
    }

    pub fn search_query_history(&self, term: &str) -> Vec<HistoryEntry> {
        self.history.search(term)
    }

    pub fn clear_query_history(&self) {
        self.history.clear();
    }

    /// Counts the rows `sql` would return by wrapping it in `COUNT(*)`
    pub fn get_row_count(&self, connection_id: &str, sql: &str) -> Result<u64> {
        let driver = self.registry.get_query_driver(connection_id)?;
        let inner = sql.trim().trim_end_matches(';').trim_end();
        if inner.is_empty() {
            return Err(SessionError::EmptyQuery);
        }
        let _lease = self.executor.reserve(connection_id)?;

        let count_sql = format!("SELECT COUNT(*) FROM ({}) AS subquery", inner);
        let rs = driver.execute(&count_sql, &CancellationToken::new())?;
        rs.rows
            .first()
            .and_then(|row| row.first())
            .and_then(|cell| cell.as_deref())
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| DriverError::new("Row count query returned no value").into())
    }

    /// Lists tables through the metadata driver, so a running query never
    /// blocks it
    pub fn get_tables(&self, connection_id: &str) -> Result<Vec<String>> {
        let driver = self.registry.get_metadata_driver(connection_id)?;
        Ok(driver.list_tables()?)
    }

    /// Cancels every query, waits for the workers and closes all connections
    pub fn shutdown(&self) {
        self.executor.shutdown();
        for connection_id in self.registry.connection_ids() {
            self.transactions.cleanup_connection(&connection_id);
        }
        self.registry.clear();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs on the query worker before the outcome is published
fn record_outcome(
    report: &QueryReport<'_>,
    history: &QueryHistory,
    cache: &ResultCache,
    cache_key: Option<CacheKey>,
    writes: bool,
) {
    let error = match report.status {
        QueryStatus::Cancelled => Some(SessionError::Cancelled.to_string()),
        _ => report.error.map(str::to_string),
    };
    let (affected_rows, execution_time_ms) = report
        .output
        .map_or((0, report.elapsed_ms), |o| (o.affected_rows(), o.execution_time_ms()));

    history.add(HistoryRecord {
        sql: report.sql,
        connection_id: report.connection_id,
        success: report.status == QueryStatus::Completed,
        execution_time_ms,
        affected_rows,
        error,
    });

    if writes {
        cache.invalidate_connection(report.connection_id);
    } else if let (Some(key), Some(QueryOutput::Single(rs))) = (cache_key, report.output) {
        cache.put(key, Arc::clone(rs));
    }
}
