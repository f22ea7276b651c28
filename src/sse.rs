//! Server-sent event framing
//!
//! Incremental decoder for upstream `text/event-stream` bodies and the encoders for the
//! frames the gateway emits downstream.

use bytes::Bytes;
use thiserror::Error;

/// End-of-stream sentinel sent after a successful stream.
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Largest incomplete event the decoder will hold.
pub const MAX_PENDING_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Joined `data:` lines of one event
    Data(String),
    /// The `[DONE]` sentinel
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SseError {
    #[error("event stream exceeded {limit} bytes without an event boundary")]
    Oversized { limit: usize },
}

/// Buffers partial input until a blank line completes an event.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no boundary
    scanned: usize,
    limit: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_PENDING_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            limit,
        }
    }

    /// Feed bytes, returning every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<SseEvent>, SseError> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some((end, delimiter)) = find_boundary(&self.buffer, self.scanned) {
            let raw: Vec<u8> = self.buffer.drain(..end + delimiter).collect();
            self.scanned = 0;
            if let Some(event) = parse_event(&raw[..end]) {
                events.push(event);
            }
        }
        // A delimiter may straddle the next read
        self.scanned = self.buffer.len().saturating_sub(3);
        if self.buffer.len() > self.limit {
            self.buffer.clear();
            self.scanned = 0;
            return Err(SseError::Oversized { limit: self.limit });
        }
        Ok(events)
    }

    /// Flush a trailing event that arrived without its terminating blank line.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let raw = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        parse_event(&raw).into_iter().collect()
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn find_boundary(buffer: &[u8], from: usize) -> Option<(usize, usize)> {
    let tail = buffer.get(from..)?;
    let lf = tail.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = tail
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    let (pos, delimiter) = match (lf, crlf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (a, b) => a.or(b)?,
    };
    Some((from + pos, delimiter))
}

fn parse_event(raw: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(raw);
    let mut data: Vec<&str> = Vec::new();
    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data.is_empty() {
        return None;
    }
    let payload = data.join("\n");
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed == "[DONE]" {
        Some(SseEvent::Done)
    } else {
        Some(SseEvent::Data(trimmed.to_string()))
    }
}

/// One event; every line of `payload` gets its own `data:` field.
pub fn data_frame(payload: &str) -> Bytes {
    let mut frame = String::with_capacity(payload.len() + 8);
    for line in payload.split('\n') {
        frame.push_str("data: ");
        frame.push_str(line.strip_suffix('\r').unwrap_or(line));
        frame.push('\n');
    }
    frame.push('\n');
    Bytes::from(frame)
}

/// Terminal error frame: `data: {"error": {"message": ..., "code": ...}}`.
pub fn error_frame(message: &str, code: u16) -> Bytes {
    let body = serde_json::json!({ "error": { "message": message, "code": code } });
    data_frame(&body.to_string())
}
