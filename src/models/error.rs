//! Error taxonomy for the proxy.
//!
//! Every failure that can reach the outbound stream is one of these variants;
//! the JSON-RPC rendering (code + `data.kind`) is derived here so the wire
//! format stays in one place.

use std::time::Duration;

use thiserror::Error;

/// Errors produced while bridging a request to the remote endpoint.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A required credential field was missing or empty at sign time.
    #[error("invalid credential: {0}")]
    Credential(String),

    /// A malformed inbound record. `parse` distinguishes unparseable JSON
    /// (-32700) from a structurally invalid record (-32600).
    #[error("protocol error: {message}")]
    Protocol { message: String, parse: bool },

    /// A correlation id was reused while the original request was pending.
    #[error("duplicate correlation id: {0}")]
    DuplicateCorrelation(String),

    /// Network-level failure (connect, reset, timeout). Retryable.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Non-2xx status from the remote endpoint, or a malformed 2xx body.
    #[error("remote endpoint error (status {status}): {message}")]
    Remote {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Session teardown or a per-request deadline.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl ProxyError {
    /// A structurally invalid (but parseable) record.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            parse: false,
        }
    }

    /// An unparseable record.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            parse: true,
        }
    }

    /// Taxonomy tag carried in `error.data.kind` on the outbound stream.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Credential(_) => "CredentialError",
            Self::Protocol { .. } => "ProtocolError",
            Self::DuplicateCorrelation(_) => "DuplicateCorrelationError",
            Self::Transport(_) => "TransportError",
            Self::Remote { .. } => "RemoteError",
            Self::Cancelled(_) => "CancellationError",
        }
    }

    /// JSON-RPC error code for the outbound rendering.
    #[must_use]
    pub const fn code(&self) -> i64 {
        match self {
            Self::Protocol { parse: true, .. } => -32700,
            Self::Protocol { parse: false, .. } | Self::DuplicateCorrelation(_) => -32600,
            _ => -32603,
        }
    }

    /// Whether the transport may re-issue the request (with a fresh
    /// signature). Only transient network failures and throttling/5xx
    /// statuses qualify.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Remote { status, .. } => *status == 429 || (*status >= 500 && *status <= 599),
            _ => false,
        }
    }

    /// Server-suggested retry delay, when the response carried one.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Remote { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
