#![forbid(unsafe_code)]
#![doc = r#"
Tollgate

A metered gateway for OpenAI-compatible chat completions. Every request is routed to a
provider, forwarded (buffered or as an event stream), priced, and recorded as one usage
record that the analytics endpoint aggregates per gateway.

Crate highlights
- Routing: `RouteResolver::resolve` maps a model id (or `provider/model`, or the free tier) to a provider endpoint.
- Pricing: `PriceTable::cost` turns token counts into money; unpriced models cost zero.
- Dispatch: buffered completions and a metered SSE stream that always ends in `[DONE]` or one error frame.
- Usage: append-only stores (memory, JSONL, sled, SQLite) behind `UsageStore`, written fire-and-forget.
- Analytics: windowed per-gateway reports with a short-lived TTL cache.

Modules
- `catalog`: Static model/provider/price tables.
- `routing`, `pricing`: Route resolution and cost calculation.
- `models`, `upstream`, `sse`, `dispatch`: Wire types, upstream client, SSE framing, dispatcher.
- `usage*`, `recorder`: Usage records, stores and the recorder.
- `cache`, `analytics`: TTL cache and aggregation.
- `gateway_auth`, `orchestrator`, `server`, `util`: Request pipeline and HTTP surface.
"#]

pub mod analytics;
pub mod cache;
pub mod catalog;
pub mod dispatch;
pub mod gateway_auth;
pub mod models;
pub mod orchestrator;
pub mod pricing;
pub mod recorder;
pub mod routing;
pub mod server;
pub mod sse;
pub mod upstream;
pub mod usage;
pub mod usage_jsonl;
pub mod usage_memory;
#[cfg(feature = "sled")]
pub mod usage_sled;
#[cfg(feature = "sqlite")]
pub mod usage_sqlite;
pub mod util;

pub use crate::analytics::{AnalyticsAggregator, AnalyticsConfig, AnalyticsQuery, AnalyticsReport};
pub use crate::cache::{Clock, ManualClock, SystemClock, TtlCache};
pub use crate::catalog::{Catalog, CatalogError, FreeTier};
pub use crate::dispatch::{DispatchOutcome, DispatchStatus, Dispatcher, StreamState, Timings};
pub use crate::gateway_auth::{GatewayAuthError, GatewayAuthenticator, StaticGatewayDirectory};
pub use crate::orchestrator::{ChatReply, InboundChat, RequestOrchestrator};
pub use crate::pricing::{ModelPrice, PriceTable};
pub use crate::recorder::{UsageRecorder, UsageStoreConfig};
pub use crate::routing::{ResolvedRoute, RouteError, RouteResolver};
pub use crate::upstream::{ChatUpstream, HttpUpstream, UpstreamError};
pub use crate::usage::{RequestMode, UsageError, UsageFilter, UsageRecord, UsageStore};
