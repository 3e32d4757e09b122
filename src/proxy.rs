//! The proxy orchestrator: one session over a stream pair.
//!
//! The run loop decodes inbound records, dispatches them through the
//! session's correlation table, and spawns one task per in-flight request.
//! Every call receives exactly one terminal outbound record; the guard is
//! `Session::complete`, which removes the pending entry exactly once.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{self, Decoded, MessageWriter};
use crate::config::ProxyConfig;
use crate::http::{RetryPolicy, Transport};
use crate::models::{ErrorObject, InboundRecord, OutboundRecord, ProxyError, RequestId};
use crate::session::{Admission, Session};

use futures::StreamExt;

/// Terminal outcome of one forwarded call.
enum Terminal {
    /// Result payload for a buffered call.
    Result(Value),
    /// Error envelope passed through from the remote response.
    Error(ErrorObject),
    /// A streamed sequence ended; chunks were already written.
    StreamEnd,
}

/// One proxy instance: configuration, transport, and session state wired
/// together. Multiple independent instances can coexist in one process.
pub struct Proxy {
    config: Arc<ProxyConfig>,
    transport: Arc<dyn Transport>,
    session: Arc<Session>,
    limiter: Arc<Semaphore>,
}

impl Proxy {
    #[must_use]
    pub fn new(config: ProxyConfig, transport: Arc<dyn Transport>) -> Self {
        let session = Arc::new(Session::new(config.duplicate_policy));
        let limiter = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            config: Arc::new(config),
            transport,
            session,
            limiter,
        }
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Serve one session: decode inbound records until the stream closes,
    /// then drain every still-pending request with a cancellation error.
    ///
    /// # Errors
    ///
    /// Returns the session-fatal error on unrecoverable framing, an inbound
    /// read error, or a broken outbound stream. Clean end of stream is `Ok`.
    pub async fn run<R, W>(&self, reader: R, writer: W) -> Result<(), ProxyError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.run_until(reader, writer, std::future::pending::<()>())
            .await
    }

    /// Like [`Self::run`], but also stops when `shutdown` resolves (signal
    /// teardown). Both exits pass through the drain, so pending ids get their
    /// cancellation record either way.
    ///
    /// # Errors
    ///
    /// Same as [`Self::run`]; a shutdown-triggered exit is `Ok`.
    pub async fn run_until<R, W, S>(
        &self,
        mut reader: R,
        writer: W,
        shutdown: S,
    ) -> Result<(), ProxyError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let writer = Arc::new(MessageWriter::new(writer));
        let mut buf = Vec::new();
        let result = loop {
            let next = tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown requested, tearing down");
                    break Ok(());
                }
                next = codec::next_line(&mut reader, &mut buf) => next,
            };
            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(err) => {
                    warn!(error = %err, "inbound stream unrecoverable, tearing down");
                    break Err(err);
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match codec::decode_line(&line) {
                Decoded::Invalid { id, error } => {
                    debug!(error = %error, "rejecting malformed inbound record");
                    if let Err(err) = writer.write(&OutboundRecord::error(id, &error)).await {
                        break Err(err);
                    }
                }
                Decoded::Notification(record) => self.spawn_notification(record).await,
                Decoded::Call { id, record } => {
                    if let Err(err) = self.dispatch_call(id, record, &writer).await {
                        break Err(err);
                    }
                }
            }
        };
        self.drain(&writer).await;
        result
    }

    /// Admit one call and spawn its task. Only outbound write failures are
    /// returned; everything else is answered on the stream.
    async fn dispatch_call<W>(
        &self,
        id: RequestId,
        record: InboundRecord,
        writer: &Arc<MessageWriter<W>>,
    ) -> Result<(), ProxyError>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let token = match self.session.admit(&id, &record.method) {
            Admission::Duplicate => {
                warn!(%id, method = %record.method, "duplicate correlation id while original is pending");
                let err = ProxyError::DuplicateCorrelation(id.to_string());
                return writer.write(&OutboundRecord::error(Some(id), &err)).await;
            }
            Admission::Closed => {
                let err = ProxyError::Cancelled("session is closed".to_string());
                return writer.write(&OutboundRecord::error(Some(id), &err)).await;
            }
            Admission::Superseded { old, token } => {
                warn!(%id, method = %old.method, "superseding pending request with the same id");
                let err =
                    ProxyError::Cancelled("superseded by a new request with the same id".to_string());
                writer
                    .write(&OutboundRecord::error(Some(id.clone()), &err))
                    .await?;
                token
            }
            Admission::New(token) => token,
        };

        // Backpressure: the read loop waits here once the concurrency bound
        // is reached.
        let Ok(permit) = Arc::clone(&self.limiter).acquire_owned().await else {
            return Ok(());
        };
        let transport = Arc::clone(&self.transport);
        let session = Arc::clone(&self.session);
        let config = Arc::clone(&self.config);
        let writer = Arc::clone(writer);
        tokio::spawn(async move {
            let _permit = permit;
            debug!(%id, method = %record.method, "request started");
            let outcome =
                execute(&*transport, &config, &session, &writer, &id, token, &record).await;
            if !session.complete(&id, token) {
                // Drained at teardown or superseded; the terminal record for
                // this id was already written elsewhere.
                return;
            }
            let terminal = match outcome {
                Ok(Terminal::Result(value)) => OutboundRecord::success(id, value),
                Ok(Terminal::Error(error)) => OutboundRecord::remote_error(id, error),
                Ok(Terminal::StreamEnd) => OutboundRecord::stream_end(id),
                Err(err) => {
                    warn!(error = %err, kind = err.kind(), "request failed");
                    OutboundRecord::error(Some(id), &err)
                }
            };
            if let Err(err) = writer.write(&terminal).await {
                warn!(error = %err, "failed to write terminal record");
            }
        });
        Ok(())
    }

    /// Forward a notification; it occupies a concurrency slot but never
    /// produces an outbound record. Streaming-declared methods go out on the
    /// streaming path like a call, with the chunks drained and discarded.
    async fn spawn_notification(&self, record: InboundRecord) {
        let Ok(permit) = Arc::clone(&self.limiter).acquire_owned().await else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        let streaming = self.config.streaming_methods.contains(&record.method);
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = if streaming {
                drain_chunks(&*transport, &record.to_wire()).await
            } else {
                transport.invoke_buffered(&record.to_wire()).await.map(|_| ())
            };
            match outcome {
                Ok(()) => debug!(method = %record.method, "notification forwarded"),
                Err(err) => {
                    warn!(method = %record.method, error = %err, "notification forwarding failed");
                }
            }
        });
    }

    async fn drain<W>(&self, writer: &MessageWriter<W>)
    where
        W: AsyncWrite + Send + Unpin,
    {
        let pending = self.session.close();
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "session closing, cancelling pending requests");
        let err = ProxyError::Cancelled("session closed before the request completed".to_string());
        for (id, entry) in pending {
            debug!(%id, method = %entry.method, "cancelling pending request");
            if writer
                .write(&OutboundRecord::error(Some(id), &err))
                .await
                .is_err()
            {
                break;
            }
        }
    }
}

/// Drive one request end-to-end against the transport. For streaming
/// methods, chunks are written here and the returned terminal closes the
/// sequence.
async fn execute<W>(
    transport: &dyn Transport,
    config: &ProxyConfig,
    session: &Session,
    writer: &MessageWriter<W>,
    id: &RequestId,
    token: u64,
    record: &InboundRecord,
) -> Result<Terminal, ProxyError>
where
    W: AsyncWrite + Send + Unpin,
{
    // The health side-channel bypasses payload translation entirely.
    if record.method == "ping" {
        transport.health_check().await?;
        return Ok(Terminal::Result(json!({})));
    }

    let payload = record.to_wire();
    if !config.streaming_methods.contains(&record.method) {
        // Whole-request deadline derived from the per-attempt timeout and the
        // retry budget. Nothing has been written for this id yet, so dropping
        // the in-flight call cannot corrupt framing.
        let deadline = request_deadline(config);
        let body = match timeout(deadline, transport.invoke_buffered(&payload)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProxyError::Cancelled(format!(
                    "request exceeded the {deadline:?} deadline"
                )));
            }
        };
        return Ok(unwrap_envelope(body));
    }

    let mut chunks = transport.invoke_streaming(&payload).await?;
    loop {
        match timeout(config.timeout, chunks.next()).await {
            Err(_) => {
                return Err(ProxyError::Cancelled(format!(
                    "no response data within {:?}",
                    config.timeout
                )));
            }
            Ok(None) => return Ok(Terminal::StreamEnd),
            Ok(Some(Err(err))) => return Err(err),
            Ok(Some(Ok(chunk))) => {
                // The pending check runs under the writer lock: a teardown
                // that already wrote this id's terminal record has removed
                // the entry first, so the chunk is skipped, never appended.
                let written = writer
                    .write_when(&OutboundRecord::chunk(id.clone(), chunk), || {
                        session.is_current(id, token)
                    })
                    .await?;
                if !written {
                    return Err(ProxyError::Cancelled("request no longer pending".to_string()));
                }
            }
        }
    }
}

/// Consume a streamed response without forwarding anything.
async fn drain_chunks(transport: &dyn Transport, payload: &Value) -> Result<(), ProxyError> {
    let mut chunks = transport.invoke_streaming(payload).await?;
    while let Some(next) = chunks.next().await {
        next?;
    }
    Ok(())
}

/// Upper bound on one buffered request: every attempt at its full timeout
/// plus the backoff between attempts, with a little slack.
fn request_deadline(config: &ProxyConfig) -> Duration {
    let backoff = RetryPolicy::default()
        .max_delay
        .saturating_mul(config.max_retries.saturating_sub(1));
    config
        .timeout
        .saturating_mul(config.max_retries.max(1))
        .saturating_add(backoff)
        .saturating_add(Duration::from_secs(1))
}

/// Forward the members of a remote JSON-RPC response envelope; any other
/// document becomes the result as-is.
fn unwrap_envelope(body: Value) -> Terminal {
    if let Value::Object(obj) = &body {
        if obj.contains_key("jsonrpc") {
            if let Some(error) = obj.get("error") {
                if let Ok(error) = serde_json::from_value::<ErrorObject>(error.clone()) {
                    return Terminal::Error(error);
                }
            }
            if let Some(result) = obj.get("result") {
                return Terminal::Result(result.clone());
            }
        }
    }
    Terminal::Result(body)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use serde_json::json;

    use super::*;

    #[test]
    fn envelopes_are_unwrapped() {
        let body = json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}});
        let Terminal::Result(result) = unwrap_envelope(body) else {
            panic!("expected result");
        };
        assert_eq!(result, json!({"tools": []}));

        let body = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "nope"}});
        let Terminal::Error(error) = unwrap_envelope(body) else {
            panic!("expected error passthrough");
        };
        assert_eq!(error.code, -32601);
    }

    #[test]
    fn derived_deadline_covers_every_attempt() {
        let config = ProxyConfig {
            endpoint: "https://example.invalid".to_string(),
            region: "us-east-1".to_string(),
            timeout: Duration::from_secs(30),
            max_concurrency: 8,
            max_retries: 3,
            streaming_methods: std::collections::HashSet::new(),
            duplicate_policy: crate::config::DuplicatePolicy::Reject,
        };
        let deadline = request_deadline(&config);
        assert!(deadline >= Duration::from_secs(90));
        assert!(deadline <= Duration::from_secs(120));
    }

    #[test]
    fn raw_documents_become_the_result() {
        let Terminal::Result(result) = unwrap_envelope(json!({"plain": true})) else {
            panic!("expected result");
        };
        assert_eq!(result, json!({"plain": true}));

        let Terminal::Result(result) = unwrap_envelope(json!([1, 2, 3])) else {
            panic!("expected result");
        };
        assert_eq!(result, json!([1, 2, 3]));
    }
}
