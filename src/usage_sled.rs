//! sled usage storage backend (feature: sled)
//!
//! Records live in the `usage_records` tree keyed by
//! `timestamp_micros (u64 BE) ++ record uuid`, so key order is time order and window
//! queries are range scans.

use crate::usage::{Result, StorageStats, UsageError, UsageFilter, UsageRecord, UsageStore};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

const TREE: &str = "usage_records";

pub struct SledUsageStore {
    _db: sled::Db,
    tree: sled::Tree,
    path: Option<PathBuf>,
}

fn storage(e: sled::Error) -> UsageError {
    UsageError::Storage(e.to_string())
}

fn micros(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_micros().max(0) as u64
}

fn record_key(record: &UsageRecord) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&micros(record.timestamp).to_be_bytes());
    key.extend_from_slice(record.id.as_bytes());
    key
}

impl SledUsageStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = sled::open(&path).map_err(storage)?;
        let tree = db.open_tree(TREE).map_err(storage)?;
        Ok(Self {
            _db: db,
            tree,
            path: Some(path),
        })
    }

    /// Throwaway database removed on drop.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(storage)?;
        let tree = db.open_tree(TREE).map_err(storage)?;
        Ok(Self {
            _db: db,
            tree,
            path: None,
        })
    }
}

#[async_trait::async_trait]
impl UsageStore for SledUsageStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn append(&self, record: &UsageRecord) -> Result<()> {
        let value = serde_json::to_vec(record)?;
        self.tree
            .insert(record_key(record), value)
            .map_err(storage)?;
        self.tree.flush().map_err(storage)?;
        Ok(())
    }

    async fn query(&self, filter: &UsageFilter) -> Result<Vec<UsageRecord>> {
        let lower = filter.start.map(micros).unwrap_or(0).to_be_bytes().to_vec();
        let upper = filter
            .end
            .map(|end| micros(end).saturating_add(1))
            .unwrap_or(u64::MAX)
            .to_be_bytes()
            .to_vec();

        let mut out = Vec::new();
        for item in self.tree.range(lower..upper).rev() {
            let (_k, v) = item.map_err(storage)?;
            let record: UsageRecord = serde_json::from_slice(&v)?;
            if !filter.matches(&record) {
                continue;
            }
            out.push(record);
            if filter.limit.is_some_and(|limit| out.len() >= limit) {
                break;
            }
        }
        Ok(out)
    }

    async fn stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_records: self.tree.len(),
            backend_type: "sled".to_string(),
            storage_path: self.path.as_ref().map(|p| p.display().to_string()),
        })
    }

    async fn health(&self) -> Result<bool> {
        self.tree.first().map_err(storage)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::RequestMode;
    use chrono::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn range_scan_returns_window_newest_first() {
        let store = SledUsageStore::temporary().unwrap();
        let now = Utc::now();
        for hours in [1, 30, 5, 72] {
            let rec = UsageRecord::new("gw", "gpt-4o", "openai", RequestMode::NonStreaming)
                .with_timestamp(now - Duration::hours(hours));
            store.append(&rec).await.unwrap();
        }

        let filter = UsageFilter::for_gateway("gw").between(now - Duration::days(2), now, true);
        let records = store.query(&filter).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].timestamp, now - Duration::hours(1));
        assert_eq!(records[2].timestamp, now - Duration::hours(30));

        let limited = store
            .query(&UsageFilter {
                limit: Some(2),
                ..filter
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn same_instant_records_do_not_collide() {
        let store = SledUsageStore::temporary().unwrap();
        let ts = Utc::now();
        for _ in 0..3 {
            let rec = UsageRecord::new("gw", "m", "p", RequestMode::Streaming).with_timestamp(ts);
            store.append(&rec).await.unwrap();
        }
        assert_eq!(store.stats().await.unwrap().total_records, 3);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.db");
        let rec = UsageRecord::new("gw", "m", "p", RequestMode::NonStreaming);
        {
            let store = SledUsageStore::open(&path).unwrap();
            store.append(&rec).await.unwrap();
        }
        let store = SledUsageStore::open(&path).unwrap();
        let records = store.query(&UsageFilter::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, rec.id);
        assert!(store.health().await.unwrap());
    }
}
