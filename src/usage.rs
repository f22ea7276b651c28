//! Usage Records
//!
//! One immutable accounting entry per dispatched chat request, and the append-only
//! storage trait the recorder writes to and the analytics aggregator reads from.

use crate::dispatch::Timings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum UsageError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, UsageError>;

/// Endpoint path stamped on every record.
pub const CHAT_ENDPOINT: &str = "/chat/completions";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    Streaming,
    NonStreaming,
}

impl RequestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMode::Streaming => "streaming",
            RequestMode::NonStreaming => "non-streaming",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "streaming" => Some(RequestMode::Streaming),
            "non-streaming" => Some(RequestMode::NonStreaming),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub id: Uuid,
    /// Upstream-assigned completion id, when one was seen
    pub response_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub gateway_id: String,
    pub model: String,
    pub provider: String,
    pub tokens_prompt: u64,
    pub tokens_completion: u64,
    pub tokens_total: u64,
    pub request_type: RequestMode,
    pub success: bool,
    pub cost: f64,
    /// End-to-end seconds
    pub latency: Option<f64>,
    pub queue_time: Option<f64>,
    pub prompt_time: Option<f64>,
    pub completion_time: Option<f64>,
    /// Present iff `success` is false
    pub error_message: Option<String>,
    pub prompt_text: Option<String>,
    pub response_text: Option<String>,
    pub http_status_code: u16,
    pub endpoint: String,
}

impl UsageRecord {
    pub fn new(
        gateway_id: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
        request_type: RequestMode,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            response_id: None,
            timestamp: Utc::now(),
            gateway_id: gateway_id.into(),
            model: model.into(),
            provider: provider.into(),
            tokens_prompt: 0,
            tokens_completion: 0,
            tokens_total: 0,
            request_type,
            success: true,
            cost: 0.0,
            latency: None,
            queue_time: None,
            prompt_time: None,
            completion_time: None,
            error_message: None,
            prompt_text: None,
            response_text: None,
            http_status_code: 200,
            endpoint: CHAT_ENDPOINT.to_string(),
        }
    }

    pub fn with_response_id(mut self, response_id: Option<String>) -> Self {
        self.response_id = response_id;
        self
    }

    pub fn with_tokens(mut self, prompt: u64, completion: u64, total: u64) -> Self {
        self.tokens_prompt = prompt;
        self.tokens_completion = completion;
        self.tokens_total = total;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_timings(mut self, timings: &Timings) -> Self {
        self.latency = Some(timings.latency);
        self.queue_time = timings.queue_time;
        self.prompt_time = timings.prompt_time;
        self.completion_time = timings.completion_time;
        self
    }

    /// Success clears the error message; failure requires one.
    pub fn with_outcome(mut self, error_message: Option<String>, http_status_code: u16) -> Self {
        self.success = error_message.is_none();
        self.error_message = error_message;
        self.http_status_code = http_status_code;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_prompt_text(mut self, prompt_text: impl Into<String>) -> Self {
        self.prompt_text = Some(prompt_text.into());
        self
    }

    pub fn with_response_text(mut self, response_text: impl Into<String>) -> Self {
        self.response_text = Some(response_text.into());
        self
    }

    /// Route path the request arrived on
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

/// Query filter over the time-ordered store
#[derive(Debug, Clone, Default)]
pub struct UsageFilter {
    pub gateway_id: Option<String>,
    /// Inclusive lower bound
    pub start: Option<DateTime<Utc>>,
    /// Exclusive upper bound unless `end_inclusive`
    pub end: Option<DateTime<Utc>>,
    pub end_inclusive: bool,
    pub limit: Option<usize>,
}

impl UsageFilter {
    pub fn for_gateway(gateway_id: impl Into<String>) -> Self {
        Self {
            gateway_id: Some(gateway_id.into()),
            ..Self::default()
        }
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>, inclusive: bool) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self.end_inclusive = inclusive;
        self
    }

    pub fn matches(&self, record: &UsageRecord) -> bool {
        if let Some(gateway_id) = &self.gateway_id {
            if &record.gateway_id != gateway_id {
                return false;
            }
        }
        if let Some(start) = self.start {
            if record.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            let past_end = if self.end_inclusive {
                record.timestamp > end
            } else {
                record.timestamp >= end
            };
            if past_end {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyStats {
    pub samples: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl LatencyStats {
    pub fn observe(&mut self, latency: f64) {
        self.samples += 1;
        self.sum += latency;
        self.min = Some(self.min.map_or(latency, |m| m.min(latency)));
        self.max = Some(self.max.map_or(latency, |m| m.max(latency)));
    }

    pub fn mean(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.sum / self.samples as f64
        }
    }
}

/// Aggregate over a set of records.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageTotals {
    pub requests: u64,
    pub errors: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    /// Successful requests with a measured latency only
    pub latency: LatencyStats,
    /// Every request with a measured latency, failures included
    pub all_latency: LatencyStats,
}

impl UsageTotals {
    pub fn add(&mut self, record: &UsageRecord) {
        self.requests += 1;
        if !record.success {
            self.errors += 1;
        }
        self.tokens_in += record.tokens_prompt;
        self.tokens_out += record.tokens_completion;
        self.cost += record.cost;
        if let Some(latency) = record.latency {
            self.all_latency.observe(latency);
            if record.success {
                self.latency.observe(latency);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelTotals {
    pub model: String,
    pub totals: UsageTotals,
}

pub fn fold_totals<'a>(records: impl IntoIterator<Item = &'a UsageRecord>) -> UsageTotals {
    let mut totals = UsageTotals::default();
    for record in records {
        totals.add(record);
    }
    totals
}

/// Group by resolved model name, sorted by model.
pub fn fold_by_model<'a>(records: impl IntoIterator<Item = &'a UsageRecord>) -> Vec<ModelTotals> {
    let mut groups: BTreeMap<&str, UsageTotals> = BTreeMap::new();
    for record in records {
        groups.entry(record.model.as_str()).or_default().add(record);
    }
    groups
        .into_iter()
        .map(|(model, totals)| ModelTotals {
            model: model.to_string(),
            totals,
        })
        .collect()
}

/// Storage statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_records: usize,
    pub backend_type: String,
    pub storage_path: Option<String>,
}

/// Append-only usage storage
#[async_trait::async_trait]
pub trait UsageStore: Send + Sync {
    /// Initialize the storage backend
    async fn init(&self) -> Result<()>;

    /// Append one record; records are never updated in place
    async fn append(&self, record: &UsageRecord) -> Result<()>;

    /// Matching records, newest first
    async fn query(&self, filter: &UsageFilter) -> Result<Vec<UsageRecord>>;

    async fn totals(&self, filter: &UsageFilter) -> Result<UsageTotals> {
        let records = self.query(&unbounded(filter)).await?;
        Ok(fold_totals(&records))
    }

    async fn totals_by_model(&self, filter: &UsageFilter) -> Result<Vec<ModelTotals>> {
        let records = self.query(&unbounded(filter)).await?;
        Ok(fold_by_model(&records))
    }

    /// Get storage statistics
    async fn stats(&self) -> Result<StorageStats>;

    /// Health check
    async fn health(&self) -> Result<bool> {
        Ok(true)
    }
}

fn unbounded(filter: &UsageFilter) -> UsageFilter {
    UsageFilter {
        limit: None,
        ..filter.clone()
    }
}

/// Primary store plus best-effort mirrors
pub struct CompositeUsageStore {
    primary: Box<dyn UsageStore>,
    sinks: Vec<Box<dyn UsageStore>>,
    strict: bool,
}

impl CompositeUsageStore {
    pub fn new(primary: Box<dyn UsageStore>, strict: bool) -> Self {
        Self {
            primary,
            sinks: Vec::new(),
            strict,
        }
    }

    pub fn add_sink(&mut self, sink: Box<dyn UsageStore>) {
        self.sinks.push(sink);
    }
}

#[async_trait::async_trait]
impl UsageStore for CompositeUsageStore {
    async fn init(&self) -> Result<()> {
        self.primary.init().await?;
        for sink in &self.sinks {
            if let Err(e) = sink.init().await {
                if self.strict {
                    return Err(e);
                }
                tracing::warn!("Usage sink init failed: {}", e);
            }
        }
        Ok(())
    }

    async fn append(&self, record: &UsageRecord) -> Result<()> {
        self.primary.append(record).await?;
        for sink in &self.sinks {
            if let Err(e) = sink.append(record).await {
                if self.strict {
                    return Err(e);
                }
                tracing::warn!("Usage sink append failed: {}", e);
            }
        }
        Ok(())
    }

    async fn query(&self, filter: &UsageFilter) -> Result<Vec<UsageRecord>> {
        self.primary.query(filter).await
    }

    async fn totals(&self, filter: &UsageFilter) -> Result<UsageTotals> {
        self.primary.totals(filter).await
    }

    async fn totals_by_model(&self, filter: &UsageFilter) -> Result<Vec<ModelTotals>> {
        self.primary.totals_by_model(filter).await
    }

    async fn stats(&self) -> Result<StorageStats> {
        self.primary.stats().await
    }

    async fn health(&self) -> Result<bool> {
        if !self.primary.health().await? {
            return Ok(false);
        }
        if self.strict {
            for sink in &self.sinks {
                if !sink.health().await? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}
