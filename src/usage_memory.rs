//! In-memory usage storage backend
//!
//! For development and tests. Data is lost when the process exits.

use crate::usage::{Result, StorageStats, UsageError, UsageFilter, UsageRecord, UsageStore};
use std::sync::{Arc, RwLock};

#[derive(Clone, Default)]
pub struct MemoryUsageStore {
    records: Arc<RwLock<Vec<UsageRecord>>>,
    max_records: Option<usize>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oldest records are dropped once `max_records` is exceeded.
    pub fn with_max_records(max_records: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
            max_records: Some(max_records),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_error<E: std::fmt::Display>(e: E) -> UsageError {
    UsageError::Storage(format!("Lock error: {}", e))
}

#[async_trait::async_trait]
impl UsageStore for MemoryUsageStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn append(&self, record: &UsageRecord) -> Result<()> {
        let mut records = self.records.write().map_err(lock_error)?;
        records.push(record.clone());
        if let Some(max) = self.max_records {
            if records.len() > max {
                let excess = records.len() - max;
                records.drain(0..excess);
            }
        }
        Ok(())
    }

    async fn query(&self, filter: &UsageFilter) -> Result<Vec<UsageRecord>> {
        let records = self.records.read().map_err(lock_error)?;
        let mut results: Vec<UsageRecord> = records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        drop(records);

        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = filter.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn stats(&self) -> Result<StorageStats> {
        let records = self.records.read().map_err(lock_error)?;
        Ok(StorageStats {
            total_records: records.len(),
            backend_type: "memory".to_string(),
            storage_path: None,
        })
    }
}
