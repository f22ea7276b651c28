//! Usage Recorder
//!
//! Builds the configured usage store once at startup and writes records without ever
//! holding up, or failing, the caller's response. A store that is disabled, fails to
//! open, or fails its first health probe leaves the recorder permanently in no-op mode.

use crate::usage::{CompositeUsageStore, Result, UsageError, UsageRecord, UsageStore};
use crate::usage_jsonl::JsonlUsageStore;
use crate::usage_memory::MemoryUsageStore;

#[cfg(feature = "sled")]
use crate::usage_sled::SledUsageStore;

#[cfg(feature = "sqlite")]
use crate::usage_sqlite::SqliteUsageStore;

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[cfg(feature = "sled")]
const DEFAULT_BACKEND: &str = "sled";
#[cfg(not(feature = "sled"))]
const DEFAULT_BACKEND: &str = "memory";

/// Usage store configuration
#[derive(Debug, Clone)]
pub struct UsageStoreConfig {
    /// Whether usage recording is enabled
    pub enabled: bool,
    /// Primary storage backend
    pub backend: String,
    /// Sink backends (best-effort)
    pub sink_backends: Vec<String>,
    /// Propagate sink failures
    pub strict: bool,
    pub jsonl_path: Option<String>,
    pub sled_path: Option<String>,
    pub sqlite_url: Option<String>,
    pub memory_max_records: Option<usize>,
}

impl Default for UsageStoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: DEFAULT_BACKEND.to_string(),
            sink_backends: Vec::new(),
            strict: false,
            jsonl_path: Some("./data/usage.jsonl".to_string()),
            sled_path: Some("./data/usage.db".to_string()),
            sqlite_url: None,
            memory_max_records: Some(100_000),
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl UsageStoreConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let sink_backends = std::env::var("TOLLGATE_USAGE_SINKS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            enabled: env_flag("TOLLGATE_USAGE_ENABLED", defaults.enabled),
            backend: env_nonempty("TOLLGATE_USAGE_BACKEND")
                .map(|s| s.to_ascii_lowercase())
                .unwrap_or(defaults.backend),
            sink_backends,
            strict: env_flag("TOLLGATE_USAGE_STRICT", defaults.strict),
            jsonl_path: env_nonempty("TOLLGATE_USAGE_JSONL_PATH").or(defaults.jsonl_path),
            sled_path: env_nonempty("TOLLGATE_USAGE_SLED_PATH").or(defaults.sled_path),
            sqlite_url: env_nonempty("TOLLGATE_USAGE_SQLITE_URL"),
            memory_max_records: env_nonempty("TOLLGATE_USAGE_MEMORY_MAX_RECORDS")
                .and_then(|s| s.parse().ok())
                .or(defaults.memory_max_records),
        }
    }

    /// In-memory store, used by tests and ephemeral deployments.
    pub fn memory() -> Self {
        Self {
            backend: "memory".to_string(),
            ..Self::default()
        }
    }
}

/// Open and initialize the configured primary store plus sinks.
pub async fn open_usage_store(config: &UsageStoreConfig) -> Result<Arc<dyn UsageStore>> {
    let primary = create_backend(&config.backend, config).await?;

    let store: Arc<dyn UsageStore> = if config.sink_backends.is_empty() {
        Arc::from(primary)
    } else {
        let mut composite = CompositeUsageStore::new(primary, config.strict);
        for sink_name in &config.sink_backends {
            composite.add_sink(create_backend(sink_name, config).await?);
        }
        Arc::new(composite)
    };

    store.init().await?;
    Ok(store)
}

async fn create_backend(backend: &str, config: &UsageStoreConfig) -> Result<Box<dyn UsageStore>> {
    match backend {
        "memory" => {
            let store = match config.memory_max_records {
                Some(max) => MemoryUsageStore::with_max_records(max),
                None => MemoryUsageStore::new(),
            };
            Ok(Box::new(store))
        }
        "jsonl" => {
            let path = config.jsonl_path.as_ref().ok_or_else(|| {
                UsageError::InvalidInput("JSONL path not configured".to_string())
            })?;
            Ok(Box::new(JsonlUsageStore::new(path)))
        }
        #[cfg(feature = "sled")]
        "sled" => {
            let path = config.sled_path.as_ref().ok_or_else(|| {
                UsageError::InvalidInput("sled path not configured".to_string())
            })?;
            Ok(Box::new(SledUsageStore::open(path)?))
        }
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            let url = config.sqlite_url.as_ref().ok_or_else(|| {
                UsageError::InvalidInput("SQLite URL not configured".to_string())
            })?;
            Ok(Box::new(SqliteUsageStore::new(url).await?))
        }
        _ => Err(UsageError::InvalidInput(format!(
            "Unknown usage backend: {}",
            backend
        ))),
    }
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RecorderStats {
    pub written: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Fire-and-forget writer for usage records.
#[derive(Clone, Default)]
pub struct UsageRecorder {
    store: Option<Arc<dyn UsageStore>>,
    counters: Arc<Counters>,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self {
            store: Some(store),
            counters: Arc::default(),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Open the store and probe it once; any failure yields a disabled recorder.
    pub async fn connect(config: &UsageStoreConfig) -> Self {
        if !config.enabled {
            warn!("Usage recording disabled by configuration; records will be dropped");
            return Self::disabled();
        }

        let store = match open_usage_store(config).await {
            Ok(store) => store,
            Err(e) => {
                warn!(
                    "Usage store '{}' unavailable, recording disabled: {}",
                    config.backend, e
                );
                return Self::disabled();
            }
        };

        Self::checked(store, &config.backend).await
    }

    /// Enable recording on `store` only if its health check passes.
    pub async fn checked(store: Arc<dyn UsageStore>, backend: &str) -> Self {
        match store.health().await {
            Ok(true) => {
                info!("Usage recording enabled (backend: {})", backend);
                Self::new(store)
            }
            Ok(false) => {
                warn!(
                    "Usage store '{}' failed its health check, recording disabled",
                    backend
                );
                Self::disabled()
            }
            Err(e) => {
                warn!(
                    "Usage store '{}' health check error, recording disabled: {}",
                    backend, e
                );
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn store(&self) -> Option<Arc<dyn UsageStore>> {
        self.store.clone()
    }

    /// Queue a record for persistence and return immediately.
    pub fn record(&self, record: UsageRecord) {
        let Some(store) = self.store.clone() else {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            debug!("Usage store unavailable; skipping record {}", record.id);
            return;
        };

        let counters = Arc::clone(&self.counters);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    persist(store.as_ref(), &counters, &record).await;
                });
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!("No async runtime available; usage record {} lost", record.id);
            }
        }
    }

    /// Persist a record and wait for the outcome. Returns whether it was stored.
    pub async fn record_now(&self, record: &UsageRecord) -> bool {
        match &self.store {
            Some(store) => persist(store.as_ref(), &self.counters, record).await,
            None => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                debug!("Usage store unavailable; skipping record {}", record.id);
                false
            }
        }
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
        }
    }
}

async fn persist(store: &dyn UsageStore, counters: &Counters, record: &UsageRecord) -> bool {
    match store.append(record).await {
        Ok(()) => {
            counters.written.fetch_add(1, Ordering::Relaxed);
            true
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                "Failed to persist usage record {} (gateway {}): {}",
                record.id, record.gateway_id, e
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::{RequestMode, StorageStats, UsageFilter};
    use tempfile::TempDir;

    struct BrokenStore;

    #[async_trait::async_trait]
    impl UsageStore for BrokenStore {
        async fn init(&self) -> Result<()> {
            Ok(())
        }
        async fn append(&self, _record: &UsageRecord) -> Result<()> {
            Err(UsageError::Storage("disk full".into()))
        }
        async fn query(&self, _filter: &UsageFilter) -> Result<Vec<UsageRecord>> {
            Ok(Vec::new())
        }
        async fn stats(&self) -> Result<StorageStats> {
            Err(UsageError::Storage("disk full".into()))
        }
        async fn health(&self) -> Result<bool> {
            Ok(false)
        }
    }

    fn sample() -> UsageRecord {
        UsageRecord::new("gw", "gpt-4o", "openai", RequestMode::NonStreaming)
    }

    async fn settle(recorder: &UsageRecorder, expected: u64) {
        for _ in 0..200 {
            let s = recorder.stats();
            if s.written + s.failed >= expected {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn config_default() {
        let config = UsageStoreConfig::default();
        assert!(config.enabled);
        assert_eq!(config.backend, DEFAULT_BACKEND);
        assert!(config.sink_backends.is_empty());
        assert!(!config.strict);
    }

    #[tokio::test]
    async fn memory_backend_records_in_background() {
        let recorder = UsageRecorder::connect(&UsageStoreConfig::memory()).await;
        assert!(recorder.is_enabled());

        recorder.record(sample());
        settle(&recorder, 1).await;
        assert_eq!(recorder.stats().written, 1);

        let store = recorder.store().unwrap();
        assert_eq!(store.query(&UsageFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_config_is_noop() {
        let config = UsageStoreConfig {
            enabled: false,
            ..UsageStoreConfig::memory()
        };
        let recorder = UsageRecorder::connect(&config).await;
        assert!(!recorder.is_enabled());
        recorder.record(sample());
        assert!(!recorder.record_now(&sample()).await);
        assert_eq!(
            recorder.stats(),
            RecorderStats {
                written: 0,
                failed: 0,
                skipped: 2
            }
        );
    }

    #[tokio::test]
    async fn unknown_backend_disables_recording() {
        let config = UsageStoreConfig {
            backend: "cassandra".into(),
            ..UsageStoreConfig::default()
        };
        assert!(!UsageRecorder::connect(&config).await.is_enabled());
    }

    #[tokio::test]
    async fn write_failures_are_counted_not_raised() {
        let recorder = UsageRecorder::new(Arc::new(BrokenStore));
        recorder.record(sample());
        settle(&recorder, 1).await;
        assert_eq!(recorder.stats().failed, 1);
        assert!(!recorder.record_now(&sample()).await);
    }

    #[tokio::test]
    async fn unhealthy_store_disables_recording() {
        let recorder = UsageRecorder::checked(Arc::new(BrokenStore), "broken").await;
        assert!(!recorder.is_enabled());
        assert!(recorder.store().is_none());
        recorder.record(sample());
        assert_eq!(recorder.stats().skipped, 1);

        let healthy = UsageRecorder::checked(Arc::new(MemoryUsageStore::new()), "memory").await;
        assert!(healthy.is_enabled());
    }

    #[tokio::test]
    async fn composite_with_jsonl_sink_mirrors_records() {
        let dir = TempDir::new().unwrap();
        let jsonl = dir.path().join("usage.jsonl");
        let config = UsageStoreConfig {
            sink_backends: vec!["jsonl".into()],
            jsonl_path: Some(jsonl.display().to_string()),
            ..UsageStoreConfig::memory()
        };
        let recorder = UsageRecorder::connect(&config).await;
        assert!(recorder.record_now(&sample()).await);

        let mirror = JsonlUsageStore::new(&jsonl);
        assert_eq!(
            mirror.query(&UsageFilter::default()).await.unwrap().len(),
            1
        );
    }
}
