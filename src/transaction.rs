/// Transaction Management Module
///
/// This module tracks explicit transaction state per connection id and
/// issues begin/commit/rollback against the connection's query driver.
///
/// Callers are expected to hold a `ConnectionLease` for the connection while
/// calling `begin`, `commit` or `rollback`, which keeps these calls from
/// interleaving with an async query on the same driver.

use crate::core::db::DatabaseDriver;
use crate::core::{lock, Result, SessionError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};

/// Represents a connection's transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    /// No explicit transaction (autocommit mode)
    #[default]
    None,
    /// A transaction was begun and not yet closed
    Active,
}

/// Local bookkeeping of open transactions, keyed by connection id
#[derive(Debug, Default)]
pub struct TransactionManager {
    active: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins a transaction on the connection's query driver
    ///
    /// # Errors
    ///
    /// `TransactionState` if one is already active; the driver's error if
    /// the begin itself fails, in which case the state stays `None`.
    pub fn begin(&self, connection_id: &str, driver: &dyn DatabaseDriver) -> Result<()> {
        if lock(&self.active).contains_key(connection_id) {
            return Err(SessionError::TransactionState(
                "Transaction already in progress".to_string(),
            ));
        }

        driver.begin_transaction()?;
        lock(&self.active).insert(connection_id.to_string(), Utc::now());
        info!(connection_id, "Transaction started");
        Ok(())
    }

    /// Commits the active transaction
    ///
    /// Local state returns to `None` even when the driver reports an error;
    /// that error is still returned to the caller.
    pub fn commit(&self, connection_id: &str, driver: &dyn DatabaseDriver) -> Result<()> {
        self.take(connection_id)?;
        match driver.commit_transaction() {
            Ok(()) => {
                info!(connection_id, "Transaction committed");
                Ok(())
            }
            Err(err) => {
                warn!(connection_id, error = %err, "Commit failed");
                Err(err.into())
            }
        }
    }

    /// Rolls back the active transaction; same bookkeeping rules as `commit`
    pub fn rollback(&self, connection_id: &str, driver: &dyn DatabaseDriver) -> Result<()> {
        self.take(connection_id)?;
        match driver.rollback_transaction() {
            Ok(()) => {
                info!(connection_id, "Transaction rolled back");
                Ok(())
            }
            Err(err) => {
                warn!(connection_id, error = %err, "Rollback failed");
                Err(err.into())
            }
        }
    }

    /// Discards local state without touching the driver
    pub fn cleanup_connection(&self, connection_id: &str) {
        if lock(&self.active).remove(connection_id).is_some() {
            info!(connection_id, "Discarded open transaction of closed connection");
        }
    }

    pub fn state(&self, connection_id: &str) -> TransactionState {
        if lock(&self.active).contains_key(connection_id) {
            TransactionState::Active
        } else {
            TransactionState::None
        }
    }

    pub fn started_at(&self, connection_id: &str) -> Option<DateTime<Utc>> {
        lock(&self.active).get(connection_id).copied()
    }

    fn take(&self, connection_id: &str) -> Result<DateTime<Utc>> {
        lock(&self.active)
            .remove(connection_id)
            .ok_or_else(|| SessionError::TransactionState("No transaction in progress".to_string()))
    }
}
