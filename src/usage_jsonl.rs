//! JSONL usage storage backend
//!
//! Append-only JSON Lines, one record per line. Suited to audit mirrors; reads scan the
//! whole file.

use crate::usage::{Result, StorageStats, UsageError, UsageFilter, UsageRecord, UsageStore};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct JsonlUsageStore {
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
}

impl JsonlUsageStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self
            .file
            .lock()
            .map_err(|e| UsageError::Storage(format!("Lock error: {}", e)))?;

        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            *guard = Some(file);
        }

        if let Some(file) = guard.as_mut() {
            writeln!(file, "{}", line)?;
            file.flush()?;
        }
        Ok(())
    }

    fn read_records(&self) -> Result<Vec<UsageRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<UsageRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::debug!(
                    "Skipping malformed usage line {} in {}: {}",
                    lineno + 1,
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(records)
    }
}

#[async_trait::async_trait]
impl UsageStore for JsonlUsageStore {
    async fn init(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(())
    }

    async fn append(&self, record: &UsageRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        self.write_line(&line)
    }

    async fn query(&self, filter: &UsageFilter) -> Result<Vec<UsageRecord>> {
        let mut results: Vec<UsageRecord> = self
            .read_records()?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = filter.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_records: self.read_records()?.len(),
            backend_type: "jsonl".to_string(),
            storage_path: Some(self.path.display().to_string()),
        })
    }

    async fn health(&self) -> Result<bool> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => Ok(parent.exists()),
            _ => Ok(true),
        }
    }
}
