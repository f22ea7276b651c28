//! Analytics Aggregator
//!
//! Answers "usage for gateway G over the last N days" from the usage store. Reports
//! are cached by a digest of the query for a short TTL; a cached report is returned
//! as-is even if newer records have landed since.
//!
//! Day buckets slide with the query time: bucket `i` covers
//! `[now - (i+1)d, now - i·d)`, with bucket 0 closed at `now`, so together they
//! partition the window.

use crate::cache::{digest_key, Clock, SystemClock, TtlCache};
use crate::usage::{UsageError, UsageFilter, UsageRecord, UsageStore, UsageTotals};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

pub const MIN_DAYS: u32 = 1;
pub const MAX_DAYS: u32 = 365;
pub const DEFAULT_DAYS: u32 = 30;

#[derive(Error, Debug)]
pub enum AnalyticsError {
    #[error("Analytics database not available")]
    Unavailable,
    #[error("Failed to fetch analytics: {0}")]
    Store(#[from] UsageError),
}

/// Field order is the canonical key order of the cache digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalyticsQuery {
    pub days: u32,
    pub gateway_id: String,
    pub include_logs: bool,
}

impl AnalyticsQuery {
    /// `days` is clamped into `[1, 365]`; absent means 30.
    pub fn new(gateway_id: impl Into<String>, days: Option<i64>, include_logs: bool) -> Self {
        let days = days
            .map(|d| d.clamp(MIN_DAYS as i64, MAX_DAYS as i64) as u32)
            .unwrap_or(DEFAULT_DAYS);
        Self {
            days,
            gateway_id: gateway_id.into(),
            include_logs,
        }
    }

    pub fn cache_key(&self) -> String {
        digest_key(self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AnalyticsConfig {
    pub cache_ttl_seconds: u64,
    pub cache_max_entries: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 15,
            cache_max_entries: 256,
        }
    }
}

impl AnalyticsConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cache_ttl_seconds: std::env::var("TOLLGATE_ANALYTICS_CACHE_TTL_SECONDS")
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.cache_ttl_seconds),
            cache_max_entries: std::env::var("TOLLGATE_ANALYTICS_CACHE_MAX_ENTRIES")
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.cache_max_entries),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DateRange {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub days: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Summary {
    pub total_requests: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub avg_latency: f64,
    pub min_latency: f64,
    pub max_latency: f64,
    pub error_count: u64,
    /// Percent, two decimals
    pub error_rate: f64,
    /// Percent, two decimals
    pub success_rate: f64,
    pub log_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelBreakdown {
    pub requests: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub total_tokens: u64,
    pub cost: f64,
    /// Mean over every record with a latency, failures included
    pub avg_latency: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyStat {
    /// UTC date of the bucket's end instant
    pub date: NaiveDate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub requests: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub errors: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsReport {
    pub gateway_id: String,
    pub date_range: DateRange,
    pub summary: Summary,
    pub model_breakdown: BTreeMap<String, ModelBreakdown>,
    /// Most recent day first
    pub daily_stats: Vec<DailyStat>,
    pub logs: Option<Vec<UsageRecord>>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

pub struct AnalyticsAggregator {
    store: Option<Arc<dyn UsageStore>>,
    cache: TtlCache<Arc<AnalyticsReport>>,
    clock: Arc<dyn Clock>,
}

impl AnalyticsAggregator {
    pub fn new(store: Option<Arc<dyn UsageStore>>, config: AnalyticsConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Option<Arc<dyn UsageStore>>,
        config: AnalyticsConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = TtlCache::new(
            std::time::Duration::from_secs(config.cache_ttl_seconds),
            config.cache_max_entries,
            Arc::clone(&clock),
        );
        Self {
            store,
            cache,
            clock,
        }
    }

    /// Fixed at construction; never re-probed per query.
    pub fn is_available(&self) -> bool {
        self.store.is_some()
    }

    pub async fn aggregate(
        &self,
        query: &AnalyticsQuery,
    ) -> Result<Arc<AnalyticsReport>, AnalyticsError> {
        let store = self.store.as_ref().ok_or(AnalyticsError::Unavailable)?;

        let key = query.cache_key();
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!("analytics cache hit for gateway {}", query.gateway_id);
            return Ok(hit);
        }

        let report = Arc::new(self.compute(store.as_ref(), query).await?);
        self.cache.insert(key, Arc::clone(&report));
        Ok(report)
    }

    async fn compute(
        &self,
        store: &dyn UsageStore,
        query: &AnalyticsQuery,
    ) -> Result<AnalyticsReport, AnalyticsError> {
        let end = self.clock.utc_now();
        let start = end - Duration::days(query.days as i64);
        let window = UsageFilter::for_gateway(&query.gateway_id).between(start, end, true);
        let date_range = DateRange {
            start_date: start,
            end_date: end,
            days: query.days,
        };

        let totals = store.totals(&window).await?;
        if totals.requests == 0 {
            return Ok(AnalyticsReport {
                gateway_id: query.gateway_id.clone(),
                date_range,
                summary: Summary::default(),
                model_breakdown: BTreeMap::new(),
                daily_stats: Vec::new(),
                logs: query.include_logs.then(Vec::new),
            });
        }

        let model_breakdown = store
            .totals_by_model(&window)
            .await?
            .into_iter()
            .map(|m| {
                let t = m.totals;
                let breakdown = ModelBreakdown {
                    requests: t.requests,
                    tokens_in: t.tokens_in,
                    tokens_out: t.tokens_out,
                    total_tokens: t.tokens_in + t.tokens_out,
                    cost: t.cost,
                    avg_latency: t.all_latency.mean(),
                };
                (m.model, breakdown)
            })
            .collect();

        let mut daily_stats = Vec::with_capacity(query.days as usize);
        for i in 0..query.days as i64 {
            let day_end = end - Duration::days(i);
            let day_start = day_end - Duration::days(1);
            let filter =
                UsageFilter::for_gateway(&query.gateway_id).between(day_start, day_end, i == 0);
            let day = store.totals(&filter).await?;
            daily_stats.push(daily_stat(day_start, day_end, &day));
        }

        let logs = if query.include_logs {
            Some(store.query(&window).await?)
        } else {
            None
        };

        let error_rate = percent(totals.errors, totals.requests);
        let summary = Summary {
            total_requests: totals.requests,
            tokens_in: totals.tokens_in,
            tokens_out: totals.tokens_out,
            total_tokens: totals.tokens_in + totals.tokens_out,
            total_cost: totals.cost,
            avg_latency: totals.latency.mean(),
            min_latency: totals.latency.min.unwrap_or(0.0),
            max_latency: totals.latency.max.unwrap_or(0.0),
            error_count: totals.errors,
            error_rate: round2(error_rate),
            success_rate: round2(100.0 - error_rate),
            log_count: logs.as_ref().map_or(0, Vec::len),
        };

        Ok(AnalyticsReport {
            gateway_id: query.gateway_id.clone(),
            date_range,
            summary,
            model_breakdown,
            daily_stats,
            logs,
        })
    }
}

fn daily_stat(start: DateTime<Utc>, end: DateTime<Utc>, day: &UsageTotals) -> DailyStat {
    let success_rate = if day.requests == 0 {
        0.0
    } else {
        round2(percent(day.requests - day.errors, day.requests))
    };
    DailyStat {
        date: end.date_naive(),
        start,
        end,
        requests: day.requests,
        tokens_in: day.tokens_in,
        tokens_out: day.tokens_out,
        cost: day.cost,
        errors: day.errors,
        success_rate,
    }
}
