//! Signed HTTP transport to the remote endpoint.
//!
//! The trait seam allows orchestrator tests to inject a scripted transport;
//! [`SignedTransport`] is the production implementation.

pub mod client;

pub use client::SignedTransport;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::Stream;
use serde_json::Value;

use crate::models::ProxyError;

/// Lazy, forward-only sequence of streamed response chunks. Finite; the end
/// marker is consumed internally, so stream termination is the end of the
/// sequence. Not restartable: re-issuing requires a brand-new signed request.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Value, ProxyError>> + Send>>;

/// Transport seam between the orchestrator and the signed endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST the payload to the invocation route and return the full response
    /// document.
    async fn invoke_buffered(&self, payload: &Value) -> Result<Value, ProxyError>;

    /// POST the payload to the invocation route and return the response as a
    /// chunk stream.
    async fn invoke_streaming(&self, payload: &Value) -> Result<ChunkStream, ProxyError>;

    /// Signed no-op against the health route, confirming reachability.
    async fn health_check(&self) -> Result<(), ProxyError>;
}

/// Capped exponential backoff with jitter, bounded to a fixed number of
/// attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based). A server
    /// `Retry-After` larger than the computed backoff replaces it, capped at
    /// `max_delay`.
    #[must_use]
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        let jittered = exp.mul_f64(0.5 + fastrand::f64() * 0.5);
        match retry_after {
            Some(hint) if hint > jittered => hint.min(self.max_delay),
            _ => jittered,
        }
    }
}

/// One parsed server-sent event.
#[derive(Debug)]
pub(crate) enum SseEvent {
    Chunk(Value),
    Done,
}

/// Incremental `text/event-stream` parser. Chunks are the `data:` payloads,
/// each one JSON value; `event:`/`id:`/`retry:` fields and comment lines are
/// ignored; multi-line `data:` within one event is joined with `\n` before
/// parsing. `data: [DONE]` is the end marker.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buf: BytesMut,
    data: Vec<String>,
}

impl SseParser {
    pub(crate) fn feed(
        &mut self,
        input: &[u8],
        out: &mut Vec<SseEvent>,
    ) -> Result<(), ProxyError> {
        self.buf.extend_from_slice(input);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            let text = std::str::from_utf8(&line)
                .map_err(|_| malformed_chunk("non-UTF-8 bytes in event stream"))?;
            self.line(text.trim_end_matches(['\r', '\n']), out)?;
            if matches!(out.last(), Some(SseEvent::Done)) {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Flush a trailing event terminated by end of stream instead of a blank
    /// line.
    pub(crate) fn finish(&mut self, out: &mut Vec<SseEvent>) -> Result<(), ProxyError> {
        if !self.buf.is_empty() {
            let rest = self.buf.split();
            let text = std::str::from_utf8(&rest)
                .map_err(|_| malformed_chunk("non-UTF-8 bytes in event stream"))?;
            self.line(text.trim_end_matches('\r'), out)?;
        }
        self.dispatch(out)
    }

    fn line(&mut self, line: &str, out: &mut Vec<SseEvent>) -> Result<(), ProxyError> {
        if line.is_empty() {
            return self.dispatch(out);
        }
        if let Some(rest) = line.strip_prefix("data:") {
            self.data
                .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
        Ok(())
    }

    fn dispatch(&mut self, out: &mut Vec<SseEvent>) -> Result<(), ProxyError> {
        if self.data.is_empty() {
            return Ok(());
        }
        let payload = self.data.join("\n");
        self.data.clear();
        if payload.trim() == "[DONE]" {
            out.push(SseEvent::Done);
            return Ok(());
        }
        let value = serde_json::from_str(&payload)
            .map_err(|err| malformed_chunk(format!("malformed chunk payload: {err}")))?;
        out.push(SseEvent::Chunk(value));
        Ok(())
    }
}

/// A malformed streamed chunk terminates the sequence; the bytes were
/// already partially delivered, so this is never retried.
fn malformed_chunk(message: impl Into<String>) -> ProxyError {
    ProxyError::Remote {
        status: 200,
        message: message.into(),
        retry_after: None,
    }
}
