use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use serde::Deserialize;
use tracing::warn;

use crate::analytics::{AnalyticsError, AnalyticsQuery};
use crate::gateway_auth::{GATEWAY_ID_HEADER, GATEWAY_SECRET_HEADER};
use crate::models::ChatCompletionRequest;
use crate::orchestrator::{ChatReply, InboundChat};
use crate::util::{error_response, error_response_code, AppState};

/// Request body cap for chat completions.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

const ROUTES: &[&str] = &[
    "/status",
    "/chat/completions",
    "/v1/chat/completions",
    "/analytics/{gateway_id}",
];

/// Configure Actix-web routes with AppState.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .app_data(web::PayloadConfig::new(MAX_BODY_BYTES))
            .route("/status", web::get().to(status))
            .route("/chat/completions", web::post().to(chat_completions))
            .route("/v1/chat/completions", web::post().to(chat_completions))
            .route("/analytics/{gateway_id}", web::get().to(gateway_analytics)),
    );
}

/// Service status: routes, catalog sizes and usage recording health.
async fn status(state: web::Data<AppState>) -> impl Responder {
    let usage_stats = match state.recorder.store() {
        Some(store) => store.stats().await.ok(),
        None => None,
    };

    web::Json(serde_json::json!({
        "name": "tollgate",
        "version": env!("CARGO_PKG_VERSION"),
        "routes": ROUTES,
        "catalog": state.catalog,
        "features": {
            "usage": {
                "enabled": state.recorder.is_enabled(),
                "store": usage_stats,
                "recorder": state.recorder.stats()
            },
            "analytics": {
                "enabled": state.analytics.is_available()
            }
        }
    }))
}

fn header_str<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Caller's upstream key from `Authorization: Bearer <key>`.
fn bearer_credential(req: &HttpRequest) -> Option<String> {
    header_str(req, header::AUTHORIZATION.as_str()).and_then(|s| {
        if s.len() >= 7 && s[..6].eq_ignore_ascii_case("bearer") {
            Some(s[6..].trim().to_string()).filter(|k| !k.is_empty())
        } else {
            None
        }
    })
}

/// OpenAI-compatible chat completions, buffered or as an event stream.
async fn chat_completions(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> impl Responder {
    let gateway = match state
        .authenticator
        .authenticate(
            header_str(&req, GATEWAY_ID_HEADER),
            header_str(&req, GATEWAY_SECRET_HEADER),
        )
        .await
    {
        Ok(gateway) => gateway,
        Err(e) => {
            warn!("Gateway authentication failed: {}", e);
            return error_response(
                http::StatusCode::UNAUTHORIZED,
                "Invalid Gateway ID or Authorization",
            );
        }
    };

    // Body is only parsed once the gateway is known
    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                http::StatusCode::BAD_REQUEST,
                &format!("Invalid chat completion request: {}", e),
            )
        }
    };

    let inbound = InboundChat {
        gateway_id: gateway.id,
        endpoint: req.path().to_string(),
        credential: bearer_credential(&req),
        request,
    };

    match state.orchestrator.handle(inbound).await {
        Ok(ChatReply::Completion(completion)) => HttpResponse::Ok().json(completion),
        Ok(ChatReply::Failed { status, message }) => error_response_code(status, &message),
        Ok(ChatReply::Stream(frames)) => HttpResponse::Ok()
            .insert_header(("content-type", "text/event-stream"))
            .insert_header(("cache-control", "no-cache"))
            .insert_header(("connection", "keep-alive"))
            .streaming(frames),
        Err(e) => {
            warn!("Route resolution failed: {}", e);
            error_response(e.status(), &e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnalyticsParams {
    /// Look-back window in days; clamped to [1, 365]
    days: Option<i64>,
    #[serde(default)]
    include_logs: bool,
}

/// Windowed usage report for one gateway.
async fn gateway_analytics(
    state: web::Data<AppState>,
    path: web::Path<String>,
    params: web::Query<AnalyticsParams>,
) -> impl Responder {
    let params = params.into_inner();
    let query = AnalyticsQuery::new(path.into_inner(), params.days, params.include_logs);

    match state.analytics.aggregate(&query).await {
        Ok(report) => HttpResponse::Ok().json(report.as_ref()),
        Err(e @ AnalyticsError::Unavailable) => {
            HttpResponse::ServiceUnavailable().json(serde_json::json!({ "error": e.to_string() }))
        }
        Err(e) => {
            tracing::error!("Analytics query for {} failed: {}", query.gateway_id, e);
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}
