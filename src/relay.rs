//! SSE relay
//!
//! A line-oriented stream adapter that forwards an upstream SSE body to the
//! client byte-for-byte while observing `data:` payloads to accumulate
//! token usage. The client sees lines in upstream order, one chunk per
//! line, so event boundaries (blank lines) flush naturally.

use bytes::Bytes;
use futures_util::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::models::{AnthropicStreamEvent, ChatCompletionChunk, Dialect, Usage};

/// How many relayed response bytes are kept for the audit entry.
const AUDIT_CAPTURE_LIMIT: usize = 8192;

/// Usage accumulated while relaying a stream.
#[derive(Debug, Default, Clone)]
pub struct StreamAccounting {
    /// Model name the upstream echoed, when any event carried one.
    pub model: String,
    pub usage: Option<Usage>,
}

impl StreamAccounting {
    /// Interpret one `data:` payload according to the dialect.
    ///
    /// OpenAI chunks may carry `model` and a terminal `usage`. Anthropic
    /// streams open with `message_start` (model + input tokens) and update
    /// output tokens through `message_delta` events.
    fn observe(&mut self, dialect: Dialect, payload: &str) {
        if payload == "[DONE]" {
            return;
        }
        match dialect {
            Dialect::OpenAi => {
                if let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(payload) {
                    if !chunk.model.is_empty() {
                        self.model = chunk.model;
                    }
                    if let Some(usage) = chunk.usage {
                        self.usage = Some(usage);
                    }
                }
            }
            Dialect::Anthropic => {
                if let Ok(event) = serde_json::from_str::<AnthropicStreamEvent>(payload) {
                    match event.event_type.as_str() {
                        "message_start" => {
                            if let Some(message) = event.message {
                                if !message.model.is_empty() {
                                    self.model = message.model;
                                }
                                if let Some(usage) = message.usage {
                                    self.usage = Some(usage.to_usage());
                                }
                            }
                        }
                        "message_delta" => {
                            if let Some(delta_usage) = event.usage {
                                let usage = self.usage.get_or_insert_with(Usage::default);
                                usage.completion_tokens = delta_usage.output_tokens;
                                usage.total_tokens =
                                    usage.prompt_tokens + delta_usage.output_tokens;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Everything the relay hands back once the upstream stream ends.
pub struct StreamOutcome {
    pub accounting: StreamAccounting,
    /// Relayed response bytes, capped at 8 KiB for auditing.
    pub response_body: String,
}

type FinalizeFn = Box<dyn FnOnce(StreamOutcome) + Send>;

/// Relays an upstream byte stream to the client one line at a time.
///
/// When the upstream ends, the finalizer receives the accumulated usage and
/// captured body; it runs exactly once, on the relay task, and is expected
/// to hand persistence off to a detached task.
pub struct SseRelay<S> {
    inner: S,
    dialect: Dialect,
    buffer: Vec<u8>,
    done: bool,
    accounting: StreamAccounting,
    captured: Vec<u8>,
    finalize: Option<FinalizeFn>,
}

impl<S> SseRelay<S>
where
    S: Stream<Item = std::result::Result<Bytes, std::io::Error>> + Unpin,
{
    pub fn new(inner: S, dialect: Dialect, finalize: FinalizeFn) -> Self {
        Self {
            inner,
            dialect,
            buffer: Vec::new(),
            done: false,
            accounting: StreamAccounting::default(),
            captured: Vec::new(),
            finalize: Some(finalize),
        }
    }

    fn capture(&mut self, line: &[u8]) {
        let remaining = AUDIT_CAPTURE_LIMIT.saturating_sub(self.captured.len());
        if remaining > 0 {
            let take = remaining.min(line.len() + 1);
            if take > line.len() {
                self.captured.extend_from_slice(line);
                self.captured.push(b'\n');
            } else {
                self.captured.extend_from_slice(&line[..take]);
            }
        }
    }

    /// Pop the next complete line from the buffer, returning the chunk to
    /// relay. Trailing CR is stripped so CRLF streams relay as plain LF,
    /// matching the line-oriented contract.
    fn next_line(&mut self) -> Option<Bytes> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..pos + 1).collect();
        line.pop(); // '\n'
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(self.emit_line(line))
    }

    fn emit_line(&mut self, mut line: Vec<u8>) -> Bytes {
        self.capture(&line);

        if let Some(payload) = line.strip_prefix(b"data: ".as_slice()) {
            if let Ok(payload) = std::str::from_utf8(payload) {
                let dialect = self.dialect;
                self.accounting.observe(dialect, payload.trim_end());
            }
        }

        line.push(b'\n');
        Bytes::from(line)
    }

    fn finish(&mut self) {
        if let Some(finalize) = self.finalize.take() {
            finalize(StreamOutcome {
                accounting: self.accounting.clone(),
                response_body: String::from_utf8_lossy(&self.captured).into_owned(),
            });
        }
    }
}

impl<S> Stream for SseRelay<S>
where
    S: Stream<Item = std::result::Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = std::result::Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(chunk) = this.next_line() {
                return Poll::Ready(Some(Ok(chunk)));
            }

            if this.done {
                if this.buffer.is_empty() {
                    this.finish();
                    return Poll::Ready(None);
                }
                // Trailing partial line without a terminator still relays.
                let line = std::mem::take(&mut this.buffer);
                return Poll::Ready(Some(Ok(this.emit_line(line))));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(err))) => {
                    tracing::warn!("upstream stream error: {}", err);
                    this.done = true;
                }
                Poll::Ready(None) => {
                    this.done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
