//! Connection registry
//!
//! Owns the two drivers behind every logical connection: the query driver,
//! which may sit inside a long statement, and the metadata driver used for
//! schema browsing so that it never waits behind a user query.
use crate::core::db::{DriverError, DriverFactory, DriverRef};
use crate::core::{Result, SessionError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

struct Connection {
    query_driver: DriverRef,
    metadata_driver: DriverRef,
    connection_string: String,
}

pub struct ConnectionRegistry {
    factory: Arc<dyn DriverFactory>,
    connections: RwLock<HashMap<String, Connection>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<dyn DriverFactory>) -> Self {
        ConnectionRegistry {
            factory,
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Connection>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Connection>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens the query and metadata drivers and registers them under a new id
    pub fn connect(&self, connection_string: &str) -> Result<String> {
        let query_driver = self.factory.open(connection_string)?;
        let metadata_driver = match self.factory.open(connection_string) {
            Ok(driver) => driver,
            Err(err) => {
                warn!("Failed to open metadata connection to {}: {}", connection_string, err);
                query_driver.disconnect();
                return Err(err.into());
            }
        };

        let id = format!("conn_{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write().insert(
            id.clone(),
            Connection {
                query_driver,
                metadata_driver,
                connection_string: connection_string.to_string(),
            },
        );
        info!(connection_id = %id, "Connected to {}", connection_string);
        Ok(id)
    }

    /// Opens and immediately closes a single driver without registering it
    pub fn test_connection(&self, connection_string: &str) -> std::result::Result<(), DriverError> {
        let driver = self.factory.open(connection_string)?;
        driver.disconnect();
        Ok(())
    }

    /// Closes both drivers and forgets the connection. Unknown ids are a
    /// no-op; returns whether anything was removed.
    pub fn disconnect(&self, connection_id: &str) -> bool {
        let Some(conn) = self.write().remove(connection_id) else {
            return false;
        };
        conn.query_driver.disconnect();
        conn.metadata_driver.disconnect();
        info!(connection_id, "Disconnected from {}", conn.connection_string);
        true
    }

    pub fn get_query_driver(&self, connection_id: &str) -> Result<DriverRef> {
        self.read()
            .get(connection_id)
            .map(|c| Arc::clone(&c.query_driver))
            .ok_or_else(|| SessionError::ConnectionNotFound(connection_id.to_string()))
    }

    pub fn get_metadata_driver(&self, connection_id: &str) -> Result<DriverRef> {
        self.read()
            .get(connection_id)
            .map(|c| Arc::clone(&c.metadata_driver))
            .ok_or_else(|| SessionError::ConnectionNotFound(connection_id.to_string()))
    }

    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.read()
            .get(connection_id)
            .is_some_and(|c| c.query_driver.is_connected())
    }

    /// Registered ids in connection order
    pub fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort_by_key(|id| {
            id.trim_start_matches("conn_")
                .parse::<u64>()
                .unwrap_or(u64::MAX)
        });
        ids
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disconnects everything
    pub fn clear(&self) {
        let drained: Vec<(String, Connection)> = self.write().drain().collect();
        for (id, conn) in drained {
            conn.query_driver.disconnect();
            conn.metadata_driver.disconnect();
            info!(connection_id = %id, "Disconnected from {}", conn.connection_string);
        }
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}
