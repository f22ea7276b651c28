//! Request Orchestrator
//!
//! Resolve, dispatch, price, record. Once a route resolves, exactly one usage record
//! is written for the request: after the buffered call returns, or from the stream's
//! finish hook (completion, failure or caller disconnect). A routing failure writes
//! nothing.

use crate::dispatch::{DispatchOutcome, Dispatcher, FinishHook};
use crate::models::{ChatCompletionRequest, ChatCompletionResponse};
use crate::pricing::PriceTable;
use crate::recorder::UsageRecorder;
use crate::routing::{RouteError, RouteResolver};
use crate::usage::UsageRecord;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;

/// One authenticated chat request.
#[derive(Debug, Clone)]
pub struct InboundChat {
    pub gateway_id: String,
    /// Route path the request arrived on
    pub endpoint: String,
    /// Caller's upstream key, forwarded unless the route overrides it
    pub credential: Option<String>,
    pub request: ChatCompletionRequest,
}

pub enum ChatReply {
    Completion(ChatCompletionResponse),
    /// Upstream failure on the buffered path
    Failed { status: u16, message: String },
    /// Caller-ready SSE frames
    Stream(BoxStream<'static, Result<Bytes, std::io::Error>>),
}

/// What the usage record needs besides the dispatch outcome.
struct RecordContext {
    gateway_id: String,
    endpoint: String,
    model: String,
    provider: String,
    prompt_text: String,
    pricing: Arc<PriceTable>,
}

impl RecordContext {
    fn build(&self, outcome: &DispatchOutcome) -> UsageRecord {
        let usage = outcome.usage.unwrap_or_default();
        let cost = match outcome.usage {
            Some(u) => self.pricing.cost(
                &self.provider,
                &self.model,
                u.prompt_tokens,
                u.completion_tokens,
            ),
            None => 0.0,
        };

        UsageRecord::new(
            self.gateway_id.clone(),
            self.model.clone(),
            self.provider.clone(),
            outcome.mode,
        )
        .with_response_id(outcome.response_id.clone())
        .with_tokens(usage.prompt_tokens, usage.completion_tokens, usage.total())
        .with_cost(cost)
        .with_timings(&outcome.timings)
        .with_outcome(outcome.error_message(), outcome.http_status())
        .with_prompt_text(self.prompt_text.clone())
        .with_response_text(outcome.text.clone())
        .with_endpoint(self.endpoint.clone())
    }
}

#[derive(Clone)]
pub struct RequestOrchestrator {
    resolver: Arc<RouteResolver>,
    pricing: Arc<PriceTable>,
    dispatcher: Dispatcher,
    recorder: UsageRecorder,
}

impl RequestOrchestrator {
    pub fn new(
        resolver: Arc<RouteResolver>,
        pricing: Arc<PriceTable>,
        dispatcher: Dispatcher,
        recorder: UsageRecorder,
    ) -> Self {
        Self {
            resolver,
            pricing,
            dispatcher,
            recorder,
        }
    }

    pub fn recorder(&self) -> &UsageRecorder {
        &self.recorder
    }

    pub async fn handle(&self, inbound: InboundChat) -> Result<ChatReply, RouteError> {
        let InboundChat {
            gateway_id,
            endpoint,
            credential,
            request,
        } = inbound;

        let route = self.resolver.resolve(&request.model)?;
        tracing::debug!(
            "gateway {} -> {} ({}) stream={}",
            gateway_id,
            route.provider,
            route.model,
            request.stream
        );
        let credential = route.effective_credential(credential);
        let context = RecordContext {
            gateway_id,
            endpoint,
            model: route.model.clone(),
            provider: route.provider.clone(),
            prompt_text: request.prompt_text(),
            pricing: Arc::clone(&self.pricing),
        };

        if request.stream {
            let body = request.upstream_body(&route.model, true);
            let recorder = self.recorder.clone();
            let on_finish: FinishHook =
                Box::new(move |outcome| recorder.record(context.build(&outcome)));
            let frames = self.dispatcher.stream(route, credential, body, on_finish);
            return Ok(ChatReply::Stream(frames.boxed()));
        }

        let body = request.upstream_body(&route.model, false);
        let dispatch = self
            .dispatcher
            .complete(&route, credential.as_deref(), &body)
            .await;
        self.recorder.record(context.build(&dispatch.outcome));

        Ok(match dispatch.completion {
            Ok(completion) => ChatReply::Completion(ChatCompletionResponse::from_upstream(
                &completion,
                &route.model,
            )),
            Err(err) => ChatReply::Failed {
                status: dispatch.outcome.http_status(),
                message: err.to_string(),
            },
        })
    }
}
