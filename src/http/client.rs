//! Production transport: pooled reqwest clients plus SigV4 signing.
//!
//! Two clients share the same pool settings: a middleware-wrapped client
//! with per-request tracing spans for buffered calls, and a bare client for
//! streaming calls, where middleware must not sit between the proxy and the
//! chunked body. The retry loop lives here rather than in middleware
//! because every attempt must be re-signed with a fresh timestamp.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{StreamExt, stream};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use reqwest::{Client, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_tracing::{SpanBackendWithUrl, TracingMiddleware};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::auth::{Credential, sigv4};
use crate::config::ProxyConfig;
use crate::http::{ChunkStream, RetryPolicy, SseEvent, SseParser, Transport};
use crate::models::ProxyError;

const INVOKE_ROUTE: &str = "/mcp";
const HEALTH_ROUTE: &str = "/health";
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 8;
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const ERROR_BODY_LIMIT: usize = 512;

/// Signed HTTP client for the remote endpoint.
pub struct SignedTransport {
    buffered: ClientWithMiddleware,
    streaming: Client,
    endpoint: String,
    host: String,
    base_path: String,
    credential: Credential,
    retry: RetryPolicy,
}

impl SignedTransport {
    /// Build the client pair for `config.endpoint`.
    ///
    /// # Errors
    ///
    /// Fails when the endpoint URL is invalid or the TLS backend cannot be
    /// initialized.
    pub fn new(config: &ProxyConfig, credential: Credential) -> Result<Self, ProxyError> {
        let url = Url::parse(&config.endpoint)
            .map_err(|err| ProxyError::Transport(format!("invalid endpoint URL: {err}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::Transport("endpoint URL has no host".to_string()))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let base_path = url.path().trim_end_matches('/').to_string();

        let buffered_inner = pooled(Client::builder())
            .timeout(config.timeout)
            .build()
            .map_err(|err| ProxyError::Transport(format!("building HTTP client: {err}")))?;
        let buffered = ClientBuilder::new(buffered_inner)
            .with(TracingMiddleware::<SpanBackendWithUrl>::new())
            .build();
        // The streaming client bounds the connect and per-read waits instead
        // of the whole call, which would kill long streams.
        let streaming = pooled(Client::builder())
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout)
            .build()
            .map_err(|err| ProxyError::Transport(format!("building HTTP client: {err}")))?;

        Ok(Self {
            buffered,
            streaming,
            endpoint: config.endpoint.clone(),
            host,
            base_path,
            credential,
            retry: RetryPolicy {
                max_attempts: config.max_retries,
                ..RetryPolicy::default()
            },
        })
    }

    fn sign(
        &self,
        method: &str,
        route: &str,
        body: &[u8],
        content_type: Option<&str>,
    ) -> Result<sigv4::SignatureHeaders, ProxyError> {
        let mut headers = vec![("host".to_string(), self.host.clone())];
        if let Some(content_type) = content_type {
            headers.push(("content-type".to_string(), content_type.to_string()));
        }
        let request = sigv4::CanonicalRequest {
            method: method.to_string(),
            path: format!("{}{route}", self.base_path),
            query: Vec::new(),
            headers,
            payload_hash: sigv4::sha256_hex(body),
            timestamp: Utc::now(),
        };
        sigv4::sign(&self.credential, &request)
    }

    async fn buffered_attempt(&self, body: &[u8], accept: &str) -> Result<Value, ProxyError> {
        let signature = self.sign("POST", INVOKE_ROUTE, body, Some("application/json"))?;
        let mut request = self
            .buffered
            .post(format!("{}{INVOKE_ROUTE}", self.endpoint))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, accept)
            .header("x-amz-date", &signature.amz_date)
            .header(AUTHORIZATION, &signature.authorization);
        if let Some(token) = &signature.security_token {
            request = request.header("x-amz-security-token", token);
        }
        let response = request
            .body(body.to_vec())
            .send()
            .await
            .map_err(middleware_error)?;
        let response = check_status(response).await?;

        if is_event_stream(response.headers()) {
            // The endpoint streamed a buffered call: drain the stream and
            // return the last data payload as the document.
            let text = response.text().await.map_err(reqwest_error)?;
            return Ok(drain_event_stream(&text)?.unwrap_or(Value::Null));
        }
        let status = response.status().as_u16();
        response.json::<Value>().await.map_err(|err| ProxyError::Remote {
            status,
            message: format!("invalid JSON body: {err}"),
            retry_after: None,
        })
    }

    async fn streaming_attempt(&self, body: &[u8]) -> Result<reqwest::Response, ProxyError> {
        let signature = self.sign("POST", INVOKE_ROUTE, body, Some("application/json"))?;
        let mut request = self
            .streaming
            .post(format!("{}{INVOKE_ROUTE}", self.endpoint))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "text/event-stream, application/json")
            .header("x-amz-date", &signature.amz_date)
            .header(AUTHORIZATION, &signature.authorization);
        if let Some(token) = &signature.security_token {
            request = request.header("x-amz-security-token", token);
        }
        let response = request
            .body(body.to_vec())
            .send()
            .await
            .map_err(reqwest_error)?;
        check_status(response).await
    }

    async fn health_attempt(&self) -> Result<(), ProxyError> {
        let signature = self.sign("GET", HEALTH_ROUTE, b"", None)?;
        let mut request = self
            .buffered
            .get(format!("{}{HEALTH_ROUTE}", self.endpoint))
            .header("x-amz-date", &signature.amz_date)
            .header(AUTHORIZATION, &signature.authorization);
        if let Some(token) = &signature.security_token {
            request = request.header("x-amz-security-token", token);
        }
        let response = request.send().await.map_err(middleware_error)?;
        check_status(response).await.map(|_| ())
    }
}

#[async_trait]
impl Transport for SignedTransport {
    async fn invoke_buffered(&self, payload: &Value) -> Result<Value, ProxyError> {
        let body = encode_body(payload)?;
        let mut attempt: u32 = 1;
        loop {
            match self.buffered_attempt(&body, "application/json").await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt, err.retry_after());
                    warn!(attempt, delay = ?delay, error = %err, "transient failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn invoke_streaming(&self, payload: &Value) -> Result<ChunkStream, ProxyError> {
        let body = encode_body(payload)?;
        // Only obtaining the response head may be retried: once any chunk
        // has been delivered downstream, a retry would duplicate output.
        let mut attempt: u32 = 1;
        let response = loop {
            match self.streaming_attempt(&body).await {
                Ok(response) => break response,
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt, err.retry_after());
                    warn!(attempt, delay = ?delay, error = %err, "transient failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };

        if !is_event_stream(response.headers()) {
            // Plain JSON answer to a streaming call: one chunk, then end.
            let status = response.status().as_u16();
            let value = response.json::<Value>().await.map_err(|err| ProxyError::Remote {
                status,
                message: format!("invalid JSON body: {err}"),
                retry_after: None,
            })?;
            return Ok(Box::pin(stream::iter(vec![Ok(value)])));
        }
        debug!("forwarding event stream");
        Ok(chunk_stream(response))
    }

    async fn health_check(&self) -> Result<(), ProxyError> {
        let mut attempt: u32 = 1;
        loop {
            match self.health_attempt().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt, err.retry_after());
                    warn!(attempt, delay = ?delay, error = %err, "transient failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn pooled(builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
    builder
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .tcp_keepalive(TCP_KEEPALIVE)
}

fn encode_body(payload: &Value) -> Result<Vec<u8>, ProxyError> {
    serde_json::to_vec(payload)
        .map_err(|err| ProxyError::Transport(format!("encoding request body: {err}")))
}

fn reqwest_error(err: reqwest::Error) -> ProxyError {
    ProxyError::Transport(err.to_string())
}

fn middleware_error(err: reqwest_middleware::Error) -> ProxyError {
    match err {
        reqwest_middleware::Error::Reqwest(err) => reqwest_error(err),
        reqwest_middleware::Error::Middleware(err) => ProxyError::Transport(err.to_string()),
    }
}

/// Map a non-2xx response to `RemoteError`, capturing `Retry-After` and a
/// bounded slice of the body for diagnostics.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProxyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(ProxyError::Remote {
        status: status.as_u16(),
        message: body.chars().take(ERROR_BODY_LIMIT).collect(),
        retry_after,
    })
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .trim_start()
                .to_ascii_lowercase()
                .starts_with("text/event-stream")
        })
}

/// Drain a complete event-stream document, returning the last data payload.
fn drain_event_stream(text: &str) -> Result<Option<Value>, ProxyError> {
    let mut parser = SseParser::default();
    let mut events = Vec::new();
    parser.feed(text.as_bytes(), &mut events)?;
    parser.finish(&mut events)?;
    let mut last = None;
    for event in events {
        match event {
            SseEvent::Chunk(value) => last = Some(value),
            SseEvent::Done => break,
        }
    }
    Ok(last)
}

/// Forward the response body through the SSE parser into a bounded channel.
/// Dropping the returned stream stops the reader task on its next send.
fn chunk_stream(response: reqwest::Response) -> ChunkStream {
    let (tx, rx) = mpsc::channel::<Result<Value, ProxyError>>(16);
    tokio::spawn(async move {
        let mut parser = SseParser::default();
        let mut body = response.bytes_stream();
        let mut events = Vec::new();
        while let Some(next) = body.next().await {
            let bytes = match next {
                Ok(bytes) => bytes,
                Err(err) => {
                    let _ = tx.send(Err(reqwest_error(err))).await;
                    return;
                }
            };
            if let Err(err) = parser.feed(&bytes, &mut events) {
                let _ = tx.send(Err(err)).await;
                return;
            }
            for event in events.drain(..) {
                match event {
                    SseEvent::Chunk(value) => {
                        if tx.send(Ok(value)).await.is_err() {
                            return;
                        }
                    }
                    SseEvent::Done => return,
                }
            }
        }
        // Clean EOF without an end marker: flush any trailing event.
        if let Err(err) = parser.finish(&mut events) {
            let _ = tx.send(Err(err)).await;
            return;
        }
        for event in events {
            if let SseEvent::Chunk(value) = event {
                if tx.send(Ok(value)).await.is_err() {
                    return;
                }
            }
        }
    });
    Box::pin(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}
