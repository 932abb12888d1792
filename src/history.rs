//! Query history: a bounded, in-memory log of executed statements
use crate::core::lock;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub sql: String,
    pub connection_id: String,
    pub timestamp: DateTime<Utc>,
    pub execution_time_ms: f64,
    pub affected_rows: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// Fields recorded for one execution
#[derive(Debug, Clone)]
pub struct HistoryRecord<'a> {
    pub sql: &'a str,
    pub connection_id: &'a str,
    pub success: bool,
    pub execution_time_ms: f64,
    pub affected_rows: u64,
    pub error: Option<String>,
}

pub struct QueryHistory {
    entries: Mutex<VecDeque<HistoryEntry>>,
    max_entries: usize,
    next_id: AtomicU64,
}

impl QueryHistory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_entries.min(1024))),
            max_entries,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Append an execution, evicting the oldest entries beyond capacity
    pub fn add(&self, record: HistoryRecord<'_>) {
        if self.max_entries == 0 {
            return;
        }

        let entry = HistoryEntry {
            id: format!("hist_{}", self.next_id.fetch_add(1, Ordering::Relaxed)),
            sql: record.sql.to_string(),
            connection_id: record.connection_id.to_string(),
            timestamp: Utc::now(),
            execution_time_ms: record.execution_time_ms,
            affected_rows: record.affected_rows,
            success: record.success,
            error: record.error,
        };
        debug!("Added history entry {}", entry.id);

        let mut entries = lock(&self.entries);
        entries.push_back(entry);
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    /// All entries, most recent first
    pub fn entries(&self) -> Vec<HistoryEntry> {
        lock(&self.entries).iter().rev().cloned().collect()
    }

    /// Entries whose SQL contains `term` (case-insensitive), most recent first
    pub fn search(&self, term: &str) -> Vec<HistoryEntry> {
        let needle = term.to_lowercase();
        lock(&self.entries)
            .iter()
            .rev()
            .filter(|e| e.sql.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}
