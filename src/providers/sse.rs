// SSE and NDJSON framing for streamed backend responses
// Author: kelexine (https://github.com/kelexine)

use crate::error::{BridgeError, Result};
use futures::stream::Stream;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

/// One server-sent event. `data` joins multi-line payloads with `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    /// Parse `data` as JSON. Non-JSON payloads are reported and skipped by callers.
    pub fn json(&self) -> Option<Value> {
        match serde_json::from_str(&self.data) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Failed to parse SSE JSON: {}", e);
                None
            }
        }
    }
}

/// Split a byte stream into SSE events. Stops after `[DONE]`.
pub fn sse_events<S, B>(byte_stream: S) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send,
{
    async_stream::stream! {
        // Raw bytes: a multibyte character may straddle two chunks
        let mut buffer: Vec<u8> = Vec::new();
        futures::pin_mut!(byte_stream);

        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(chunk) => {
                    buffer.extend(chunk.as_ref().iter().copied().filter(|b| *b != b'\r'));

                    while let Some(frame) = take_frame(&mut buffer, b"\n\n") {
                        let raw = match decode(&frame) {
                            Ok(raw) => raw,
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        };
                        if let Some(event) = parse_event(raw) {
                            let done = event.is_done();
                            yield Ok(event);
                            if done {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Stream error: {}", e);
                    yield Err(BridgeError::from(e));
                    return;
                }
            }
        }

        // Final event without a trailing blank line
        match decode(&buffer) {
            Ok(rest) => {
                if let Some(event) = parse_event(rest) {
                    yield Ok(event);
                }
            }
            Err(e) => yield Err(e),
        }
        debug!("SSE stream ended");
    }
}

/// Remove and return everything up to and including the first `delimiter`.
fn take_frame(buffer: &mut Vec<u8>, delimiter: &[u8]) -> Option<Vec<u8>> {
    let end = buffer
        .windows(delimiter.len())
        .position(|w| w == delimiter)?;
    Some(buffer.drain(..end + delimiter.len()).collect())
}

/// Frames are complete here, so invalid UTF-8 is a backend fault, not a split.
fn decode(frame: &[u8]) -> Result<&str> {
    std::str::from_utf8(frame)
        .map_err(|e| BridgeError::InvalidResponse(format!("stream is not UTF-8: {}", e)))
}

/// Parse one raw SSE block. Comment-only and data-less blocks yield `None`.
pub fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(name) = line.strip_prefix("event:") {
            event = Some(name.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }

    if data.is_empty() {
        return None;
    }

    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

/// Split a byte stream into newline-delimited JSON objects.
pub fn ndjson_values<S, B>(byte_stream: S) -> impl Stream<Item = Result<Value>> + Send
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send,
{
    async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        futures::pin_mut!(byte_stream);

        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(chunk) => {
                    buffer.extend_from_slice(chunk.as_ref());
                    while let Some(line) = take_frame(&mut buffer, b"\n") {
                        let parsed = decode(&line).map(parse_json_line);
                        match parsed {
                            Ok(Some(value)) => yield value,
                            Ok(None) => {}
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    yield Err(BridgeError::from(e));
                    return;
                }
            }
        }

        match decode(&buffer).map(parse_json_line) {
            Ok(Some(value)) => yield value,
            Ok(None) => {}
            Err(e) => yield Err(e),
        }
    }
}

fn parse_json_line(line: &str) -> Option<Result<Value>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(serde_json::from_str(line).map_err(|e| {
        BridgeError::InvalidResponse(format!("malformed stream line: {}", e))
    }))
}
