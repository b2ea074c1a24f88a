use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures_util::Stream;
use serde_json::Value;

use crate::dispatch::ByteStream;
use crate::error::{ErrorKind, classify, classify_event};
use crate::tokens::TokenCounter;
use crate::usage::{Lease, UsageManager};

/// Reassembles Server-Sent-Events frames from arbitrary byte chunks.
///
/// Providers split frames wherever their transport feels like it; a JSON
/// payload routinely arrives across several chunks. The decoder buffers
/// until a blank line completes a frame and returns the joined `data:`
/// payload. Anything else on the wire (comments, `event:`/`id:` fields)
/// is dropped.
pub struct SseDecoder {
    buffer: BytesMut,
    max_event_bytes: usize,
}

/// Buffered data grew past the configured ceiling without completing a
/// frame; the stream is broken or hostile.
#[derive(Debug, PartialEq, Eq)]
pub struct EventTooLarge {
    pub buffered: usize,
}

impl SseDecoder {
    pub fn new(max_event_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_event_bytes,
        }
    }

    /// Append a chunk. Fails when the unframed backlog exceeds the ceiling.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), EventTooLarge> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > self.max_event_bytes {
            return Err(EventTooLarge {
                buffered: self.buffer.len(),
            });
        }
        Ok(())
    }

    /// Next complete `data:` payload, or `None` until more bytes arrive.
    /// Multi-line data fields are joined with `\n`, as SSE framing requires.
    pub fn next_frame(&mut self) -> Option<String> {
        loop {
            let end = find_frame_end(&self.buffer)?;
            let raw = self.buffer.split_to(end);
            let text = String::from_utf8_lossy(&raw);

            let mut data_lines: Vec<&str> = Vec::new();
            for line in text.lines() {
                if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
                }
            }
            if data_lines.is_empty() {
                // Comment or metadata-only frame; keep scanning.
                continue;
            }
            return Some(data_lines.join("\n"));
        }
    }
}

/// Index just past the blank line terminating the first complete frame.
fn find_frame_end(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' {
            if buf[i + 1] == b'\n' {
                return Some(i + 2);
            }
            if buf[i + 1] == b'\r' && buf.get(i + 2) == Some(&b'\n') {
                return Some(i + 3);
            }
        }
        i += 1;
    }
    None
}

enum StreamOutcome {
    Success,
    Failure(ErrorKind),
}

struct Finalizer {
    lease: Lease,
    usage: Arc<UsageManager>,
    counter: Arc<dyn TokenCounter>,
    /// Bare model name; keys the cooldown map and the price table.
    model: String,
    prompt_tokens_estimate: u64,
    provider_usage: Option<(u64, u64)>,
    content: String,
}

/// Streaming response handed to the caller: an async iterator of provider
/// JSON events.
///
/// The wrapper owns the lease for its key and performs finalization
/// exactly once: on `[DONE]`, on upstream end or error, on a mid-stream
/// error event, or on drop when the consumer abandons the stream. By the
/// time a caller holds one of these, at least one content event has been
/// committed, so mid-stream errors are emitted as terminal events rather
/// than recovered silently (pre-content recovery happens in the
/// dispatcher, before handoff).
pub struct CompletionStream {
    upstream: Option<ByteStream>,
    decoder: SseDecoder,
    pending: VecDeque<Value>,
    done: bool,
    fin: Option<Finalizer>,
}

impl CompletionStream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        upstream: ByteStream,
        decoder: SseDecoder,
        buffered: VecDeque<Value>,
        lease: Lease,
        usage: Arc<UsageManager>,
        counter: Arc<dyn TokenCounter>,
        model: impl Into<String>,
        prompt_tokens_estimate: u64,
    ) -> Self {
        let mut stream = Self {
            upstream: Some(upstream),
            decoder,
            pending: VecDeque::new(),
            done: false,
            fin: Some(Finalizer {
                lease,
                usage,
                counter,
                model: model.into(),
                prompt_tokens_estimate,
                provider_usage: None,
                content: String::new(),
            }),
        };
        // Events the dispatcher consumed while probing still count toward
        // usage and content accumulation.
        for event in buffered {
            stream.absorb(&event);
            stream.pending.push_back(event);
        }
        stream
    }

    /// Track usage payloads and content deltas for final accounting.
    fn absorb(&mut self, event: &Value) {
        let Some(fin) = self.fin.as_mut() else {
            return;
        };
        if let Some(usage) = event.get("usage") {
            let prompt = usage.get("prompt_tokens").and_then(Value::as_u64);
            let completion = usage.get("completion_tokens").and_then(Value::as_u64);
            if let (Some(p), Some(c)) = (prompt, completion) {
                fin.provider_usage = Some((p, c));
            }
        }
        if let Some(delta) = content_delta(event) {
            fin.content.push_str(delta);
        }
    }

    fn handle_frame(&mut self, frame: &str) {
        if frame.trim() == "[DONE]" {
            self.finalize(StreamOutcome::Success);
            self.done = true;
            return;
        }

        let Ok(event) = serde_json::from_str::<Value>(frame) else {
            // A complete frame that isn't JSON is provider noise; skip it.
            tracing::debug!(bytes = frame.len(), "skipping unparseable stream frame");
            return;
        };

        if let Some(kind) = classify_event(&event) {
            // Output already reached the consumer: surface, don't swallow.
            tracing::warn!(kind = kind.as_str(), "mid-stream error event");
            self.pending.push_back(event);
            self.finalize(StreamOutcome::Failure(kind));
            self.done = true;
            return;
        }

        self.absorb(&event);
        self.pending.push_back(event);
    }

    /// One-time teardown: close the upstream, record usage exactly once,
    /// release the key. Safe to call repeatedly; only the first call acts.
    fn finalize(&mut self, outcome: StreamOutcome) {
        let Some(mut fin) = self.fin.take() else {
            return;
        };
        self.upstream = None;

        match outcome {
            StreamOutcome::Success => {
                let (prompt, completion) = fin.provider_usage.unwrap_or_else(|| {
                    // No usage event: estimate completion tokens from what
                    // was actually streamed.
                    let estimated = u64::from(fin.counter.count(&fin.model, &fin.content));
                    (fin.prompt_tokens_estimate, estimated)
                });
                fin.usage
                    .record_success(fin.lease.fingerprint(), &fin.model, prompt, completion);
            }
            StreamOutcome::Failure(kind) => {
                fin.usage
                    .record_failure(fin.lease.fingerprint(), &fin.model, kind);
            }
        }
        fin.lease.release();
    }

    /// True once finalization has run (for tests and diagnostics).
    pub fn finalized(&self) -> bool {
        self.fin.is_none()
    }
}

impl Stream for CompletionStream {
    type Item = Value;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(event));
            }
            if this.done {
                return Poll::Ready(None);
            }

            // Frames may already be buffered (handed over by the dispatcher's
            // probe, or left from the last chunk); drain them before asking
            // the upstream for more bytes.
            while !this.done {
                let Some(frame) = this.decoder.next_frame() else {
                    break;
                };
                this.handle_frame(&frame);
            }
            if !this.pending.is_empty() || this.done {
                continue;
            }

            let Some(upstream) = this.upstream.as_mut() else {
                return Poll::Ready(None);
            };

            match upstream.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    // Upstream closed without [DONE]; what streamed stands.
                    this.finalize(StreamOutcome::Success);
                    this.done = true;
                }
                Poll::Ready(Some(Err(e))) => {
                    let kind = classify(&e);
                    tracing::warn!(kind = kind.as_str(), "stream transport error: {e}");
                    this.pending.push_back(synthetic_error(&e.to_string()));
                    this.finalize(StreamOutcome::Failure(kind));
                    this.done = true;
                }
                Poll::Ready(Some(Ok(chunk))) => {
                    if let Err(e) = this.decoder.push(&chunk) {
                        tracing::warn!(buffered = e.buffered, "stream event exceeds size ceiling");
                        this.pending.push_back(synthetic_error(&format!(
                            "stream event exceeds {} buffered bytes",
                            e.buffered
                        )));
                        this.finalize(StreamOutcome::Failure(ErrorKind::TransientServer));
                        this.done = true;
                    }
                    // New bytes land in the decoder; the next loop pass
                    // drains whatever frames completed.
                }
            }
        }
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        // Consumer walked away: account for what was delivered.
        self.finalize(StreamOutcome::Success);
    }
}

/// Content text carried by an OpenAI-style delta event, if any.
pub(crate) fn content_delta(event: &Value) -> Option<&str> {
    event
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
}

fn synthetic_error(message: &str) -> Value {
    serde_json::json!({
        "error": {
            "message": message,
            "type": "stream_error",
        }
    })
}
