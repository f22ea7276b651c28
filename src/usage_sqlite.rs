//! SQLite usage storage backend (feature: sqlite)
//!
//! Window totals and the per-model breakdown are computed by SQL aggregates rather
//! than by loading records.

use crate::usage::{
    LatencyStats, ModelTotals, RequestMode, Result, StorageStats, UsageError, UsageFilter,
    UsageRecord, UsageStore, UsageTotals,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Row, Sqlite};
use std::str::FromStr;
use uuid::Uuid;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

const AGGREGATE_COLUMNS: &str = r#"
    COUNT(*) AS requests,
    COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0) AS errors,
    COALESCE(SUM(tokens_prompt), 0) AS tokens_in,
    COALESCE(SUM(tokens_completion), 0) AS tokens_out,
    COALESCE(SUM(cost), 0.0) AS cost,
    COUNT(CASE WHEN success = 1 AND latency IS NOT NULL THEN 1 END) AS latency_samples,
    COALESCE(SUM(CASE WHEN success = 1 THEN latency END), 0.0) AS latency_sum,
    MIN(CASE WHEN success = 1 THEN latency END) AS latency_min,
    MAX(CASE WHEN success = 1 THEN latency END) AS latency_max,
    COUNT(latency) AS all_latency_samples,
    COALESCE(SUM(latency), 0.0) AS all_latency_sum,
    MIN(latency) AS all_latency_min,
    MAX(latency) AS all_latency_max
"#;

#[derive(Clone)]
pub struct SqliteUsageStore {
    pool: SqlitePool,
    url: String,
}

fn db_error(context: &str) -> impl Fn(sqlx::Error) -> UsageError + '_ {
    move |e| UsageError::Storage(format!("{}: {}", context, e))
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

impl SqliteUsageStore {
    /// URL format: "sqlite:path/to/usage.db" or "sqlite::memory:"
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| UsageError::Storage(format!("Invalid database URL: {}", e)))?
            .create_if_missing(true)
            .disable_statement_logging();

        // Each in-memory connection is its own database.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            5
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(db_error("SQLite connection error"))?;

        Ok(Self {
            pool,
            url: database_url.to_string(),
        })
    }

    async fn init_schema(&self) -> Result<()> {
        let schema = include_str!("usage_schema.sql");

        for statement in schema.split(';') {
            let statement = statement
                .lines()
                .filter(|line| {
                    let l = line.trim();
                    !l.is_empty() && !l.starts_with("--")
                })
                .collect::<Vec<_>>()
                .join("\n");
            if statement.trim().is_empty() {
                continue;
            }

            tracing::debug!(
                "Executing SQL: {}",
                statement.chars().take(80).collect::<String>()
            );
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(db_error("Schema creation error"))?;
        }
        Ok(())
    }

    fn where_clause(filter: &UsageFilter) -> String {
        let mut clause = String::from(" WHERE 1=1");
        let mut bind_count = 0;

        if filter.gateway_id.is_some() {
            bind_count += 1;
            clause.push_str(&format!(" AND gateway_id = ?{}", bind_count));
        }
        if filter.start.is_some() {
            bind_count += 1;
            clause.push_str(&format!(" AND timestamp_us >= ?{}", bind_count));
        }
        if filter.end.is_some() {
            bind_count += 1;
            let op = if filter.end_inclusive { "<=" } else { "<" };
            clause.push_str(&format!(" AND timestamp_us {} ?{}", op, bind_count));
        }
        clause
    }

    fn bind_filter<'q>(mut query: SqliteQuery<'q>, filter: &UsageFilter) -> SqliteQuery<'q> {
        if let Some(gateway_id) = &filter.gateway_id {
            query = query.bind(gateway_id.clone());
        }
        if let Some(start) = filter.start {
            query = query.bind(micros(start));
        }
        if let Some(end) = filter.end {
            query = query.bind(micros(end));
        }
        query
    }

    fn row_to_totals(row: &SqliteRow) -> Result<UsageTotals> {
        let get_err = db_error("Aggregate decode error");
        let samples: i64 = row.try_get("latency_samples").map_err(&get_err)?;
        let all_samples: i64 = row.try_get("all_latency_samples").map_err(&get_err)?;
        Ok(UsageTotals {
            requests: row.try_get::<i64, _>("requests").map_err(&get_err)? as u64,
            errors: row.try_get::<i64, _>("errors").map_err(&get_err)? as u64,
            tokens_in: row.try_get::<i64, _>("tokens_in").map_err(&get_err)? as u64,
            tokens_out: row.try_get::<i64, _>("tokens_out").map_err(&get_err)? as u64,
            cost: row.try_get("cost").map_err(&get_err)?,
            latency: LatencyStats {
                samples: samples as u64,
                sum: row.try_get("latency_sum").map_err(&get_err)?,
                min: row.try_get("latency_min").map_err(&get_err)?,
                max: row.try_get("latency_max").map_err(&get_err)?,
            },
            all_latency: LatencyStats {
                samples: all_samples as u64,
                sum: row.try_get("all_latency_sum").map_err(&get_err)?,
                min: row.try_get("all_latency_min").map_err(&get_err)?,
                max: row.try_get("all_latency_max").map_err(&get_err)?,
            },
        })
    }

    fn row_to_record(row: &SqliteRow) -> Result<UsageRecord> {
        let get_err = db_error("Row decode error");
        let id: String = row.try_get("id").map_err(&get_err)?;
        let timestamp_us: i64 = row.try_get("timestamp_us").map_err(&get_err)?;
        let request_type: String = row.try_get("request_type").map_err(&get_err)?;

        Ok(UsageRecord {
            id: Uuid::parse_str(&id)
                .map_err(|e| UsageError::InvalidInput(format!("Bad record id {}: {}", id, e)))?,
            response_id: row.try_get("response_id").map_err(&get_err)?,
            timestamp: DateTime::from_timestamp_micros(timestamp_us).ok_or_else(|| {
                UsageError::InvalidInput(format!("Bad timestamp {}", timestamp_us))
            })?,
            gateway_id: row.try_get("gateway_id").map_err(&get_err)?,
            model: row.try_get("model").map_err(&get_err)?,
            provider: row.try_get("provider").map_err(&get_err)?,
            tokens_prompt: row.try_get::<i64, _>("tokens_prompt").map_err(&get_err)? as u64,
            tokens_completion: row.try_get::<i64, _>("tokens_completion").map_err(&get_err)?
                as u64,
            tokens_total: row.try_get::<i64, _>("tokens_total").map_err(&get_err)? as u64,
            request_type: RequestMode::parse(&request_type).ok_or_else(|| {
                UsageError::InvalidInput(format!("Bad request type {}", request_type))
            })?,
            success: row.try_get::<i64, _>("success").map_err(&get_err)? != 0,
            cost: row.try_get("cost").map_err(&get_err)?,
            latency: row.try_get("latency").map_err(&get_err)?,
            queue_time: row.try_get("queue_time").map_err(&get_err)?,
            prompt_time: row.try_get("prompt_time").map_err(&get_err)?,
            completion_time: row.try_get("completion_time").map_err(&get_err)?,
            error_message: row.try_get("error_message").map_err(&get_err)?,
            prompt_text: row.try_get("prompt_text").map_err(&get_err)?,
            response_text: row.try_get("response_text").map_err(&get_err)?,
            http_status_code: row.try_get::<i64, _>("http_status_code").map_err(&get_err)? as u16,
            endpoint: row.try_get("endpoint").map_err(&get_err)?,
        })
    }
}

#[async_trait::async_trait]
impl UsageStore for SqliteUsageStore {
    async fn init(&self) -> Result<()> {
        self.init_schema().await
    }

    async fn append(&self, record: &UsageRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_records (
                id, response_id, timestamp_us, gateway_id, model, provider,
                tokens_prompt, tokens_completion, tokens_total, request_type, success, cost,
                latency, queue_time, prompt_time, completion_time,
                error_message, prompt_text, response_text, http_status_code, endpoint
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.response_id)
        .bind(micros(record.timestamp))
        .bind(&record.gateway_id)
        .bind(&record.model)
        .bind(&record.provider)
        .bind(record.tokens_prompt as i64)
        .bind(record.tokens_completion as i64)
        .bind(record.tokens_total as i64)
        .bind(record.request_type.as_str())
        .bind(if record.success { 1i64 } else { 0i64 })
        .bind(record.cost)
        .bind(record.latency)
        .bind(record.queue_time)
        .bind(record.prompt_time)
        .bind(record.completion_time)
        .bind(&record.error_message)
        .bind(&record.prompt_text)
        .bind(&record.response_text)
        .bind(record.http_status_code as i64)
        .bind(&record.endpoint)
        .execute(&self.pool)
        .await
        .map_err(db_error("Insert usage record error"))?;

        Ok(())
    }

    async fn query(&self, filter: &UsageFilter) -> Result<Vec<UsageRecord>> {
        let mut sql = format!(
            "SELECT * FROM usage_records{} ORDER BY timestamp_us DESC",
            Self::where_clause(filter)
        );
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let rows = Self::bind_filter(sqlx::query(&sql), filter)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Query usage records error"))?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn totals(&self, filter: &UsageFilter) -> Result<UsageTotals> {
        let sql = format!(
            "SELECT {} FROM usage_records{}",
            AGGREGATE_COLUMNS,
            Self::where_clause(filter)
        );
        let row = Self::bind_filter(sqlx::query(&sql), filter)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("Aggregate query error"))?;
        Self::row_to_totals(&row)
    }

    async fn totals_by_model(&self, filter: &UsageFilter) -> Result<Vec<ModelTotals>> {
        let sql = format!(
            "SELECT model, {} FROM usage_records{} GROUP BY model ORDER BY model",
            AGGREGATE_COLUMNS,
            Self::where_clause(filter)
        );
        let rows = Self::bind_filter(sqlx::query(&sql), filter)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Aggregate query error"))?;

        rows.iter()
            .map(|row| -> Result<ModelTotals> {
                Ok(ModelTotals {
                    model: row.try_get("model").map_err(db_error("Row decode error"))?,
                    totals: Self::row_to_totals(row)?,
                })
            })
            .collect()
    }

    async fn stats(&self) -> Result<StorageStats> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usage_records")
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("Count error"))?;

        Ok(StorageStats {
            total_records: count as usize,
            backend_type: "sqlite".to_string(),
            storage_path: Some(self.url.clone()),
        })
    }

    async fn health(&self) -> Result<bool> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error("Health check error"))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::fold_totals;
    use chrono::Duration;

    async fn store() -> SqliteUsageStore {
        let store = SqliteUsageStore::new("sqlite::memory:").await.unwrap();
        store.init().await.unwrap();
        store
    }

    fn record(model: &str, success: bool, latency: f64, hours_ago: i64) -> UsageRecord {
        let mut rec = UsageRecord::new("gw", model, "openai", RequestMode::NonStreaming)
            .with_tokens(100, 50, 150)
            .with_cost(0.25)
            .with_timestamp(Utc::now() - Duration::hours(hours_ago));
        rec.latency = Some(latency);
        if !success {
            rec = rec.with_outcome(Some("Error code: 500 - down".into()), 500);
        }
        rec
    }

    #[tokio::test]
    async fn sql_aggregates_match_fold() {
        let store = store().await;
        let records = vec![
            record("gpt-4o", true, 1.0, 1),
            record("gpt-4o", false, 9.0, 2),
            record("o3", true, 3.0, 3),
            record("o3", true, 2.0, 100),
        ];
        for rec in &records {
            store.append(rec).await.unwrap();
        }

        let now = Utc::now();
        let filter = UsageFilter::for_gateway("gw").between(now - Duration::days(1), now, true);
        let totals = store.totals(&filter).await.unwrap();
        let expected = fold_totals(records.iter().take(3));
        assert_eq!(totals.requests, expected.requests);
        assert_eq!(totals.errors, 1);
        assert_eq!(totals.tokens_in, 300);
        assert!((totals.cost - expected.cost).abs() < 1e-9);
        assert_eq!(totals.latency.samples, 2);
        assert_eq!(totals.latency.min, Some(1.0));
        assert_eq!(totals.latency.max, Some(3.0));

        let by_model = store.totals_by_model(&filter).await.unwrap();
        assert_eq!(by_model.len(), 2);
        assert_eq!(by_model[0].model, "gpt-4o");
        assert_eq!(by_model[0].totals.requests, 2);
        assert_eq!(by_model[0].totals.latency.samples, 1);
    }

    #[tokio::test]
    async fn empty_window_aggregates_to_zero() {
        let store = store().await;
        let totals = store.totals(&UsageFilter::for_gateway("nobody")).await.unwrap();
        assert_eq!(totals, UsageTotals::default());
        assert!(store
            .totals_by_model(&UsageFilter::for_gateway("nobody"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn records_round_trip_through_rows() {
        let store = store().await;
        let rec = record("gpt-4o", false, 0.5, 0)
            .with_response_id(Some("chatcmpl-1".into()))
            .with_prompt_text("[]");
        store.append(&rec).await.unwrap();

        let rows = store.query(&UsageFilter::for_gateway("gw")).await.unwrap();
        assert_eq!(rows.len(), 1);
        let got = &rows[0];
        assert_eq!(got.id, rec.id);
        assert_eq!(got.response_id.as_deref(), Some("chatcmpl-1"));
        assert!(!got.success);
        assert_eq!(got.http_status_code, 500);
        assert_eq!(got.request_type, RequestMode::NonStreaming);
        assert_eq!(got.queue_time, None);
        assert_eq!(store.stats().await.unwrap().total_records, 1);
    }
}
