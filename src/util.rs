use crate::analytics::{AnalyticsAggregator, AnalyticsConfig};
use crate::catalog::{Catalog, CatalogStats};
use crate::dispatch::Dispatcher;
use crate::gateway_auth::{GatewayAuthenticator, StaticGatewayDirectory};
use crate::orchestrator::RequestOrchestrator;
use crate::recorder::{UsageRecorder, UsageStoreConfig};
use crate::routing::RouteResolver;
use crate::upstream::{ChatUpstream, HttpUpstream};
use actix_web::HttpResponse;
use anyhow::Context;
use http::StatusCode;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize dotenv and structured tracing based on RUST_LOG.
/// - Supports explicit env file paths via ENV_FILE, DOTENV_PATH
/// - Falls back to the default .env discovery
/// - Logs the source used
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    for key in ["ENV_FILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }

    if env_source == "none" {
        if let Ok(path) = dotenvy::dotenv() {
            env_source = path.display().to_string();
        }
    }

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("Environment loaded from: {}", env_source);
}

/// Get the bind address for the HTTP server from env or default to 0.0.0.0:8088.
pub fn env_bind_addr() -> String {
    std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8088".into())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v.trim().to_ascii_lowercase())
        .map(|v| v == "1" || v == "true" || v == "yes" || v == "on")
        .unwrap_or(false)
}

/// Build an HTTP client honoring proxy and timeout environment variables.
///
/// Environment:
/// - TOLLGATE_NO_PROXY = 1|true|yes|on  -> disable all proxies
/// - TOLLGATE_PROXY_URL = <url>         -> proxy for all schemes
/// - HTTP_PROXY / http_proxy            -> HTTP proxy
/// - HTTPS_PROXY / https_proxy          -> HTTPS proxy
/// - TOLLGATE_HTTP_TIMEOUT_SECONDS      -> overall request timeout (u64)
pub fn build_http_client_from_env() -> reqwest::Client {
    let mut builder = reqwest::Client::builder();

    if let Ok(secs) = std::env::var("TOLLGATE_HTTP_TIMEOUT_SECONDS") {
        if let Ok(n) = secs.trim().parse::<u64>() {
            builder = builder.timeout(std::time::Duration::from_secs(n));
        }
    }

    if env_flag("TOLLGATE_NO_PROXY") {
        builder = builder.no_proxy();
    } else {
        if let Ok(url) = std::env::var("TOLLGATE_PROXY_URL") {
            let u = url.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::all(u) {
                    builder = builder.proxy(p);
                }
            }
        }
        if let Ok(http_p) = std::env::var("HTTP_PROXY").or_else(|_| std::env::var("http_proxy")) {
            let u = http_p.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::http(u) {
                    builder = builder.proxy(p);
                }
            }
        }
        if let Ok(https_p) = std::env::var("HTTPS_PROXY").or_else(|_| std::env::var("https_proxy"))
        {
            let u = https_p.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::https(u) {
                    builder = builder.proxy(p);
                }
            }
        }
    }

    builder = builder.user_agent(format!("tollgate/{}", env!("CARGO_PKG_VERSION")));

    builder.build().unwrap_or_else(|e| {
        tracing::warn!("Falling back to default HTTP client: {}", e);
        reqwest::Client::new()
    })
}

/// Shared application state used by the HTTP server and handlers.
pub struct AppState {
    pub orchestrator: RequestOrchestrator,
    pub analytics: Arc<AnalyticsAggregator>,
    /// Checks x-gateway-id / x-gateway-authorization before any work is done
    pub authenticator: Arc<dyn GatewayAuthenticator>,
    pub recorder: UsageRecorder,
    /// Table sizes for /status
    pub catalog: CatalogStats,
}

impl AppState {
    pub fn new(
        catalog: &Catalog,
        upstream: Arc<dyn ChatUpstream>,
        recorder: UsageRecorder,
        authenticator: Arc<dyn GatewayAuthenticator>,
        analytics: AnalyticsAggregator,
    ) -> Self {
        let orchestrator = RequestOrchestrator::new(
            Arc::new(RouteResolver::from_catalog(catalog)),
            Arc::new(catalog.price_table()),
            Dispatcher::new(upstream),
            recorder.clone(),
        );
        Self {
            orchestrator,
            analytics: Arc::new(analytics),
            authenticator,
            recorder,
            catalog: catalog.stats(),
        }
    }

    /// Wire everything from the environment: catalog, gateway directory, usage store.
    pub async fn from_env() -> anyhow::Result<Self> {
        let catalog = Catalog::from_env().context("failed to load provider catalog")?;
        Self::with_catalog(catalog).await
    }

    /// Like [`AppState::from_env`] with an already loaded catalog.
    pub async fn with_catalog(catalog: Catalog) -> anyhow::Result<Self> {
        let gateways =
            StaticGatewayDirectory::from_env().context("failed to load gateway directory")?;
        let recorder = UsageRecorder::connect(&UsageStoreConfig::from_env()).await;
        let analytics = AnalyticsAggregator::new(recorder.store(), AnalyticsConfig::from_env());

        let stats = catalog.stats();
        tracing::info!(
            "Catalog: {} models, {} providers, {} prices; {} gateways",
            stats.models,
            stats.providers,
            stats.prices,
            gateways.len()
        );

        Ok(Self::new(
            &catalog,
            Arc::new(HttpUpstream::from_env()),
            recorder,
            Arc::new(gateways),
            analytics,
        ))
    }
}

fn actix_status(status: StatusCode) -> actix_web::http::StatusCode {
    actix_web::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR)
}

/// Build a JSON error response with the given HTTP status and message.
pub fn error_response(status: StatusCode, msg: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": { "message": msg } });
    HttpResponse::build(actix_status(status)).json(body)
}

/// Same as [`error_response`] for a raw (possibly non-standard) status code.
pub fn error_response_code(code: u16, msg: &str) -> HttpResponse {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(status, msg)
}

/// Build CORS configuration from environment variables.
///
/// Environment:
/// - CORS_ALLOWED_ORIGINS: "*" or comma-separated origins
/// - CORS_ALLOWED_METHODS: "*" or comma-separated methods
/// - CORS_ALLOWED_HEADERS: "*" or comma-separated headers
/// - CORS_ALLOW_CREDENTIALS: 1|true|yes|on
/// - CORS_MAX_AGE: seconds
///
/// Defaults are permissive when not configured.
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default();

    match std::env::var("CORS_ALLOWED_ORIGINS") {
        Ok(origins) if origins.trim() != "*" => {
            for p in split_list(&origins) {
                cors = cors.allowed_origin(p);
            }
        }
        _ => cors = cors.allow_any_origin(),
    }

    match std::env::var("CORS_ALLOWED_METHODS") {
        Ok(methods) if methods.trim() != "*" => {
            let methods = split_list(&methods);
            if !methods.is_empty() {
                cors = cors.allowed_methods(methods);
            }
        }
        _ => cors = cors.allow_any_method(),
    }

    match std::env::var("CORS_ALLOWED_HEADERS") {
        Ok(headers) if headers.trim() != "*" => {
            for h in split_list(&headers) {
                cors = cors.allowed_header(h);
            }
        }
        _ => cors = cors.allow_any_header(),
    }

    if env_flag("CORS_ALLOW_CREDENTIALS") {
        cors = cors.supports_credentials();
    }

    if let Ok(secs) = std::env::var("CORS_MAX_AGE") {
        if let Ok(n) = secs.trim().parse::<usize>() {
            cors = cors.max_age(n);
        }
    }

    cors
}

fn split_list(raw: &str) -> Vec<&str> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn error_response_is_nested_message() {
        let resp = error_response(StatusCode::BAD_REQUEST, "Unknown model: x");
        assert_eq!(resp.status().as_u16(), 400);
        let body = to_bytes(resp.into_body()).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["error"]["message"], "Unknown model: x");
    }

    #[actix_web::test]
    async fn error_response_code_keeps_upstream_status() {
        assert_eq!(error_response_code(429, "slow down").status().as_u16(), 429);
        assert_eq!(error_response_code(499, "gone").status().as_u16(), 499);
        assert_eq!(error_response_code(42, "nonsense").status().as_u16(), 500);
    }

    #[test]
    fn split_list_drops_blanks() {
        assert_eq!(split_list(" a, ,b ,"), vec!["a", "b"]);
    }
}
