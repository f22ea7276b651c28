//! Upstream Dispatcher
//!
//! Sends a resolved chat request upstream and reports what happened.
//!
//! Buffered requests end in exactly one of two states, and the caller never sees a
//! partial body. Streaming requests move through
//! `Idle -> Connected -> Receiving -> {Completed, Failed}`. Every decoded upstream frame
//! is forwarded as soon as it arrives. Content deltas and the last usage/timing payload
//! are accumulated on the side in a [`StreamMeter`]. The meter reports a terminal
//! [`DispatchOutcome`] exactly once, including when the caller drops the stream early
//! (`Cancelled`).

use crate::models::{ChatCompletion, ChatCompletionChunk, TimeInfo, Usage};
use crate::routing::ResolvedRoute;
use crate::sse::{data_frame, error_frame, SseDecoder, SseEvent, DONE_FRAME};
use crate::upstream::{ChatUpstream, UpstreamError};
use crate::usage::RequestMode;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Message recorded when the caller goes away mid-stream.
pub const CLIENT_DISCONNECTED: &str = "client disconnected";

/// Status recorded for caller-initiated cancellation (nginx convention).
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connected,
    Receiving,
    Completed,
    Failed,
    Cancelled,
}

/// Latency and sub-timings in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Timings {
    pub latency: f64,
    pub queue_time: Option<f64>,
    pub prompt_time: Option<f64>,
    pub completion_time: Option<f64>,
}

impl Timings {
    /// Provider-reported timings win. Without them only wall-clock latency is known and
    /// the breakdown stays unset.
    pub fn resolve(time_info: Option<&TimeInfo>, elapsed: Duration) -> Self {
        let wall = elapsed.as_secs_f64();
        match time_info {
            Some(info) => Self {
                latency: info.total_time.unwrap_or(wall),
                queue_time: info.queue_time,
                prompt_time: info.prompt_time,
                completion_time: info.completion_time,
            },
            None => Self {
                latency: wall,
                ..Self::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchStatus {
    Completed,
    Failed { message: String, status_code: u16 },
    Cancelled,
}

/// Everything the orchestrator needs to write the usage record.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub mode: RequestMode,
    pub response_id: Option<String>,
    pub text: String,
    pub usage: Option<Usage>,
    pub timings: Timings,
    pub status: DispatchStatus,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, DispatchStatus::Completed)
    }

    pub fn error_message(&self) -> Option<String> {
        match &self.status {
            DispatchStatus::Completed => None,
            DispatchStatus::Failed { message, .. } => Some(message.clone()),
            DispatchStatus::Cancelled => Some(CLIENT_DISCONNECTED.to_string()),
        }
    }

    pub fn http_status(&self) -> u16 {
        match &self.status {
            DispatchStatus::Completed => 200,
            DispatchStatus::Failed { status_code, .. } => *status_code,
            DispatchStatus::Cancelled => CLIENT_CLOSED_REQUEST,
        }
    }
}

/// Invoked once with the terminal outcome of a stream.
pub type FinishHook = Box<dyn FnOnce(DispatchOutcome) + Send + 'static>;

/// Side-channel accumulator for one streaming dispatch.
pub struct StreamMeter {
    state: StreamState,
    started: Instant,
    response_id: Option<String>,
    text: String,
    usage: Option<Usage>,
    time_info: Option<TimeInfo>,
    chunks: usize,
    on_finish: Option<FinishHook>,
}

impl StreamMeter {
    pub fn new(on_finish: FinishHook) -> Self {
        Self {
            state: StreamState::Idle,
            started: Instant::now(),
            response_id: None,
            text: String::new(),
            usage: None,
            time_info: None,
            chunks: 0,
            on_finish: Some(on_finish),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    fn transition(&mut self, next: StreamState) {
        debug!("stream state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub fn connected(&mut self) {
        self.transition(StreamState::Connected);
    }

    /// Account for one upstream `data:` payload.
    pub fn observe(&mut self, payload: &str) -> Result<(), UpstreamError> {
        let chunk: ChatCompletionChunk =
            serde_json::from_str(payload).map_err(|e| UpstreamError::Decode(e.to_string()))?;
        if let Some(err) = &chunk.error {
            return Err(UpstreamError::Provider(err.to_string()));
        }
        if self.state == StreamState::Connected {
            self.transition(StreamState::Receiving);
        }
        self.chunks += 1;
        if self.response_id.is_none() {
            self.response_id = chunk.id.clone();
        }
        for delta in chunk.content_deltas() {
            self.text.push_str(delta);
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        if chunk.time_info.is_some() {
            self.time_info = chunk.time_info;
        }
        Ok(())
    }

    pub fn complete(&mut self) {
        self.finish(StreamState::Completed, DispatchStatus::Completed);
    }

    /// Mark the stream failed and build the single error frame sent to the caller.
    pub fn fail(&mut self, err: &UpstreamError) -> Bytes {
        let message = err.to_string();
        let status_code = err.status_code();
        warn!(
            "upstream stream failed after {} chunks: {}",
            self.chunks, message
        );
        self.finish(
            StreamState::Failed,
            DispatchStatus::Failed {
                message: message.clone(),
                status_code,
            },
        );
        error_frame(&message, status_code)
    }

    fn finish(&mut self, state: StreamState, status: DispatchStatus) {
        let Some(hook) = self.on_finish.take() else {
            return;
        };
        self.transition(state);
        let outcome = DispatchOutcome {
            mode: RequestMode::Streaming,
            response_id: self.response_id.take(),
            text: std::mem::take(&mut self.text),
            usage: self.usage,
            timings: Timings::resolve(self.time_info.as_ref(), self.started.elapsed()),
            status,
        };
        hook(outcome);
    }
}

impl Drop for StreamMeter {
    fn drop(&mut self) {
        if self.on_finish.is_some() {
            self.finish(StreamState::Cancelled, DispatchStatus::Cancelled);
        }
    }
}

/// Result of a buffered dispatch: the upstream answer plus its accounting.
pub struct CompletionDispatch {
    pub completion: Result<ChatCompletion, UpstreamError>,
    pub outcome: DispatchOutcome,
}

#[derive(Clone)]
pub struct Dispatcher {
    upstream: Arc<dyn ChatUpstream>,
}

impl Dispatcher {
    pub fn new(upstream: Arc<dyn ChatUpstream>) -> Self {
        Self { upstream }
    }

    pub async fn complete(
        &self,
        route: &ResolvedRoute,
        credential: Option<&str>,
        body: &Value,
    ) -> CompletionDispatch {
        let started = Instant::now();
        let completion = self.upstream.complete(route, credential, body).await;
        let elapsed = started.elapsed();

        let outcome = match &completion {
            Ok(c) => DispatchOutcome {
                mode: RequestMode::NonStreaming,
                response_id: c.id.clone(),
                text: c.content().unwrap_or_default().to_string(),
                usage: c.usage,
                timings: Timings::resolve(c.time_info.as_ref(), elapsed),
                status: DispatchStatus::Completed,
            },
            Err(err) => {
                warn!(
                    "upstream {} ({}) failed: {}",
                    route.provider, route.model, err
                );
                DispatchOutcome {
                    mode: RequestMode::NonStreaming,
                    response_id: None,
                    text: String::new(),
                    usage: None,
                    timings: Timings::resolve(None, elapsed),
                    status: DispatchStatus::Failed {
                        message: err.to_string(),
                        status_code: err.status_code(),
                    },
                }
            }
        };

        CompletionDispatch {
            completion,
            outcome,
        }
    }

    /// Streaming dispatch. The returned stream yields caller-ready SSE frames and ends
    /// with either `[DONE]` or a single error frame. `on_finish` runs exactly once: on
    /// completion, on failure, or when the stream is dropped early.
    pub fn stream(
        &self,
        route: ResolvedRoute,
        credential: Option<String>,
        body: Value,
        on_finish: FinishHook,
    ) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
        let upstream = Arc::clone(&self.upstream);
        let mut meter = StreamMeter::new(on_finish);

        async_stream::stream! {
            let mut source = match upstream.stream(&route, credential.as_deref(), &body).await {
                Ok(source) => source,
                Err(err) => {
                    yield Ok(meter.fail(&err));
                    return;
                }
            };
            meter.connected();

            let mut decoder = SseDecoder::new();
            loop {
                let events = match source.next().await {
                    Some(Ok(bytes)) => match decoder.push(&bytes) {
                        Ok(events) => events,
                        Err(e) => {
                            yield Ok(meter.fail(&UpstreamError::Stream(e.to_string())));
                            return;
                        }
                    },
                    Some(Err(e)) => {
                        let err = UpstreamError::Stream(e.to_string());
                        yield Ok(meter.fail(&err));
                        return;
                    }
                    None => {
                        let mut tail = decoder.finish();
                        tail.push(SseEvent::Done);
                        tail
                    }
                };

                for event in events {
                    match event {
                        SseEvent::Data(payload) => {
                            if let Err(err) = meter.observe(&payload) {
                                yield Ok(meter.fail(&err));
                                return;
                            }
                            yield Ok(data_frame(&payload));
                        }
                        SseEvent::Done => {
                            drop(source);
                            meter.complete();
                            yield Ok(Bytes::from_static(DONE_FRAME));
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::MAX_PENDING_BYTES;
    use crate::upstream::ByteStream;
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::Mutex;

    struct ScriptedUpstream {
        frames: Mutex<Option<Vec<Result<Bytes, std::io::Error>>>>,
        connect_error: Option<UpstreamError>,
        completion: Option<ChatCompletion>,
    }

    impl ScriptedUpstream {
        fn streaming(frames: Vec<Result<Bytes, std::io::Error>>) -> Self {
            Self {
                frames: Mutex::new(Some(frames)),
                connect_error: None,
                completion: None,
            }
        }

        fn refusing(err: UpstreamError) -> Self {
            Self {
                frames: Mutex::new(None),
                connect_error: Some(err),
                completion: None,
            }
        }
    }

    #[async_trait]
    impl ChatUpstream for ScriptedUpstream {
        async fn complete(
            &self,
            _route: &ResolvedRoute,
            _credential: Option<&str>,
            _body: &Value,
        ) -> Result<ChatCompletion, UpstreamError> {
            if let Some(err) = &self.connect_error {
                return Err(err.clone());
            }
            Ok(self.completion.clone().unwrap_or_default())
        }

        async fn stream(
            &self,
            _route: &ResolvedRoute,
            _credential: Option<&str>,
            _body: &Value,
        ) -> Result<ByteStream, UpstreamError> {
            if let Some(err) = &self.connect_error {
                return Err(err.clone());
            }
            let frames = self.frames.lock().unwrap().take().unwrap_or_default();
            Ok(stream::iter(frames).boxed())
        }
    }

    fn route() -> ResolvedRoute {
        ResolvedRoute {
            model: "gpt-4o".into(),
            provider: "openai".into(),
            base_url: "http://upstream.invalid/v1".into(),
            override_credential: None,
            free_tier: false,
        }
    }

    fn chunk(id: &str, content: &str) -> Bytes {
        let payload = serde_json::json!({
            "id": id,
            "choices": [{"index": 0, "delta": {"content": content}}]
        });
        data_frame(&payload.to_string())
    }

    fn capture() -> (FinishHook, Arc<Mutex<Vec<DispatchOutcome>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let hook: FinishHook = Box::new(move |outcome| sink.lock().unwrap().push(outcome));
        (hook, seen)
    }

    async fn run(upstream: ScriptedUpstream) -> (Vec<Bytes>, Vec<DispatchOutcome>) {
        let dispatcher = Dispatcher::new(Arc::new(upstream));
        let (hook, seen) = capture();
        let frames: Vec<Bytes> = dispatcher
            .stream(route(), None, serde_json::json!({}), hook)
            .map(|frame| frame.unwrap())
            .collect()
            .await;
        let outcomes = seen.lock().unwrap().clone();
        (frames, outcomes)
    }

    #[tokio::test]
    async fn stream_forwards_frames_and_ends_with_sentinel() {
        let usage = serde_json::json!({
            "id": "chatcmpl-1",
            "choices": [],
            "usage": {"prompt_tokens": 9, "completion_tokens": 2, "total_tokens": 11},
            "time_info": {"queue_time": 0.1, "total_time": 0.75}
        });
        let upstream = ScriptedUpstream::streaming(vec![
            Ok(chunk("chatcmpl-1", "Hel")),
            Ok(chunk("chatcmpl-1", "lo")),
            Ok(data_frame(&usage.to_string())),
            Ok(Bytes::from_static(DONE_FRAME)),
        ]);

        let (frames, outcomes) = run(upstream).await;
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0], chunk("chatcmpl-1", "Hel"));
        assert_eq!(&frames[3][..], DONE_FRAME);

        assert_eq!(outcomes.len(), 1);
        let outcome = &outcomes[0];
        assert!(outcome.is_success());
        assert_eq!(outcome.mode, RequestMode::Streaming);
        assert_eq!(outcome.text, "Hello");
        assert_eq!(outcome.response_id.as_deref(), Some("chatcmpl-1"));
        assert_eq!(outcome.usage, Some(Usage::new(9, 2)));
        assert_eq!(outcome.timings.latency, 0.75);
        assert_eq!(outcome.timings.queue_time, Some(0.1));
        assert_eq!(outcome.timings.prompt_time, None);
    }

    #[tokio::test]
    async fn eof_without_done_still_completes() {
        let upstream = ScriptedUpstream::streaming(vec![Ok(Bytes::from_static(
            b"data: {\"id\":\"x\",\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}",
        ))]);
        let (frames, outcomes) = run(upstream).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[1][..], DONE_FRAME);
        assert_eq!(outcomes[0].text, "tail");
        assert!(outcomes[0].is_success());
        assert!(outcomes[0].timings.queue_time.is_none());
    }

    #[tokio::test]
    async fn mid_stream_failure_emits_one_error_frame() {
        let upstream = ScriptedUpstream::streaming(vec![
            Ok(chunk("c", "a")),
            Ok(chunk("c", "b")),
            Ok(chunk("c", "c")),
            Err(std::io::Error::other("connection reset")),
            Ok(chunk("c", "never")),
        ]);
        let (frames, outcomes) = run(upstream).await;

        assert_eq!(frames.len(), 4);
        let last = std::str::from_utf8(&frames[3]).unwrap();
        assert!(last.starts_with("data: {\"error\""));
        assert!(!frames.iter().any(|f| &f[..] == DONE_FRAME));

        assert_eq!(outcomes.len(), 1);
        let outcome = &outcomes[0];
        assert!(!outcome.is_success());
        assert_eq!(outcome.text, "abc");
        assert!(outcome
            .error_message()
            .unwrap()
            .contains("connection reset"));
        assert_eq!(outcome.http_status(), 500);
    }

    #[tokio::test]
    async fn multi_line_event_is_forwarded_as_valid_frame() {
        let split: &[u8] =
            b"data: {\"id\":\"m\",\ndata: \"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n";
        let upstream = ScriptedUpstream::streaming(vec![
            Ok(Bytes::from_static(split)),
            Ok(Bytes::from_static(DONE_FRAME)),
        ]);
        let (frames, outcomes) = run(upstream).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], split);
        assert!(std::str::from_utf8(&frames[0])
            .unwrap()
            .lines()
            .all(|line| line.is_empty() || line.starts_with("data: ")));
        assert_eq!(outcomes[0].text, "hi");
        assert!(outcomes[0].is_success());
    }

    #[tokio::test]
    async fn runaway_event_fails_the_stream() {
        let huge = vec![b'x'; MAX_PENDING_BYTES + 1];
        let upstream = ScriptedUpstream::streaming(vec![
            Ok(chunk("c", "ok")),
            Ok(Bytes::from_static(b"data: ")),
            Ok(Bytes::from(huge)),
            Ok(Bytes::from_static(DONE_FRAME)),
        ]);
        let (frames, outcomes) = run(upstream).await;
        assert_eq!(frames.len(), 2);
        assert!(std::str::from_utf8(&frames[1])
            .unwrap()
            .contains("without an event boundary"));
        assert!(!frames.iter().any(|f| &f[..] == DONE_FRAME));
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].is_success());
        assert_eq!(outcomes[0].text, "ok");
    }

    #[tokio::test]
    async fn in_band_error_chunk_is_a_failure() {
        let upstream = ScriptedUpstream::streaming(vec![
            Ok(chunk("c", "partial")),
            Ok(data_frame(
                r#"{"error": {"message": "overloaded", "code": 503}}"#,
            )),
        ]);
        let (frames, outcomes) = run(upstream).await;
        assert_eq!(frames.len(), 2);
        let json: Value = serde_json::from_str(
            std::str::from_utf8(&frames[1])
                .unwrap()
                .trim_start_matches("data: ")
                .trim(),
        )
        .unwrap();
        assert_eq!(json["error"]["code"], 503);
        assert_eq!(outcomes[0].http_status(), 503);
        assert_eq!(outcomes[0].text, "partial");
    }

    #[tokio::test]
    async fn connect_failure_reports_status() {
        let upstream = ScriptedUpstream::refusing(UpstreamError::Status {
            status: 401,
            body: "bad key".into(),
        });
        let (frames, outcomes) = run(upstream).await;
        assert_eq!(frames.len(), 1);
        assert!(std::str::from_utf8(&frames[0])
            .unwrap()
            .contains("Error code: 401 - bad key"));
        assert_eq!(outcomes[0].http_status(), 401);
        assert!(outcomes[0].usage.is_none());
        assert!(outcomes[0].text.is_empty());
    }

    #[tokio::test]
    async fn dropping_the_stream_records_cancellation() {
        let upstream = ScriptedUpstream::streaming(vec![
            Ok(chunk("c", "first")),
            Ok(chunk("c", "second")),
            Ok(Bytes::from_static(DONE_FRAME)),
        ]);
        let dispatcher = Dispatcher::new(Arc::new(upstream));
        let (hook, seen) = capture();
        let mut frames = Box::pin(dispatcher.stream(route(), None, Value::Null, hook));

        let first = frames.next().await.unwrap().unwrap();
        assert_eq!(first, chunk("c", "first"));
        assert!(seen.lock().unwrap().is_empty());
        drop(frames);

        let outcomes = seen.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, DispatchStatus::Cancelled);
        assert_eq!(outcomes[0].text, "first");
        assert_eq!(outcomes[0].http_status(), CLIENT_CLOSED_REQUEST);
        assert_eq!(
            outcomes[0].error_message().as_deref(),
            Some(CLIENT_DISCONNECTED)
        );
    }

    #[tokio::test]
    async fn unpolled_stream_still_reports_once() {
        let dispatcher = Dispatcher::new(Arc::new(ScriptedUpstream::streaming(vec![])));
        let (hook, seen) = capture();
        drop(dispatcher.stream(route(), None, Value::Null, hook));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn buffered_dispatch_uses_wall_clock_without_time_info() {
        let completion: ChatCompletion = serde_json::from_value(serde_json::json!({
            "id": "chatcmpl-9",
            "choices": [{"message": {"role": "assistant", "content": "hi"}}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
        }))
        .unwrap();
        let upstream = ScriptedUpstream {
            frames: Mutex::new(None),
            connect_error: None,
            completion: Some(completion),
        };
        let dispatcher = Dispatcher::new(Arc::new(upstream));
        let result = dispatcher.complete(&route(), None, &Value::Null).await;
        assert!(result.completion.is_ok());
        let outcome = result.outcome;
        assert!(outcome.is_success());
        assert_eq!(outcome.mode, RequestMode::NonStreaming);
        assert_eq!(outcome.text, "hi");
        assert!(outcome.timings.latency >= 0.0);
        assert_eq!(outcome.timings.queue_time, None);
        assert_eq!(outcome.timings.completion_time, None);
    }

    #[tokio::test]
    async fn buffered_failure_carries_extracted_status() {
        let upstream = ScriptedUpstream::refusing(UpstreamError::Provider(
            r#"{"code": 429, "message": "slow down"}"#.into(),
        ));
        let dispatcher = Dispatcher::new(Arc::new(upstream));
        let result = dispatcher.complete(&route(), None, &Value::Null).await;
        assert!(result.completion.is_err());
        assert_eq!(result.outcome.http_status(), 429);
        assert!(result.outcome.usage.is_none());
    }

    #[test]
    fn time_info_without_total_falls_back_to_wall_clock() {
        let info = TimeInfo {
            prompt_time: Some(0.2),
            ..TimeInfo::default()
        };
        let t = Timings::resolve(Some(&info), Duration::from_millis(1500));
        assert_eq!(t.latency, 1.5);
        assert_eq!(t.prompt_time, Some(0.2));
        assert_eq!(t.queue_time, None);
    }
}
