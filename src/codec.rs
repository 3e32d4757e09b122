//! Framing and classification for the newline-delimited JSON-RPC streams.
//!
//! Decoding reassembles one logical message per line regardless of how the
//! underlying reads split it; encoding serializes writers behind a mutex so
//! interleaved records from concurrent tasks never corrupt framing.

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::models::{InboundRecord, OutboundRecord, ProxyError, RequestId};

/// Lines longer than this indicate boundary desynchronization and tear the
/// session down.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// One classified inbound record.
#[derive(Debug)]
pub enum Decoded {
    /// A call carrying a correlation id.
    Call { id: RequestId, record: InboundRecord },
    /// A record with a method but no id; forwarded without a response.
    Notification(InboundRecord),
    /// A malformed record, failed on its own without touching the stream.
    Invalid {
        id: Option<RequestId>,
        error: ProxyError,
    },
}

/// Read the next line from the inbound stream, reassembling messages split
/// across reads. Returns `None` on clean end of stream.
///
/// # Errors
///
/// Fails on an inbound read error or when a line exceeds
/// [`MAX_FRAME_BYTES`]; both are session-fatal.
pub async fn next_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Option<String>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    loop {
        let (complete, used) = {
            let available = reader
                .fill_buf()
                .await
                .map_err(|err| ProxyError::Transport(format!("inbound read: {err}")))?;
            if available.is_empty() {
                (true, 0)
            } else if let Some(pos) = available.iter().position(|&b| b == b'\n') {
                buf.extend_from_slice(&available[..pos]);
                (true, pos + 1)
            } else {
                buf.extend_from_slice(available);
                (false, available.len())
            }
        };
        reader.consume(used);
        if buf.len() > MAX_FRAME_BYTES {
            return Err(ProxyError::protocol(
                "inbound frame exceeds the maximum size, stream desynchronized",
            ));
        }
        if complete {
            if used == 0 && buf.is_empty() {
                return Ok(None);
            }
            break;
        }
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

/// Parse and classify one inbound line.
#[must_use]
pub fn decode_line(line: &str) -> Decoded {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            return Decoded::Invalid {
                id: None,
                error: ProxyError::parse(format!("invalid JSON: {err}")),
            };
        }
    };
    let Some(obj) = value.as_object() else {
        return Decoded::Invalid {
            id: None,
            error: ProxyError::protocol("record is not a JSON object"),
        };
    };

    let id = match obj.get("id") {
        None => None,
        Some(Value::String(s)) => Some(RequestId::String(s.clone())),
        Some(Value::Number(n)) if n.as_i64().is_some() => n.as_i64().map(RequestId::Number),
        Some(_) => {
            return Decoded::Invalid {
                id: None,
                error: ProxyError::protocol("correlation id must be a string or an integer"),
            };
        }
    };

    if let Some(version) = obj.get("jsonrpc") {
        if version.as_str() != Some("2.0") {
            return Decoded::Invalid {
                id,
                error: ProxyError::protocol("unsupported jsonrpc version"),
            };
        }
    }

    let method = match obj.get("method").and_then(Value::as_str) {
        Some(method) if !method.is_empty() => method.to_string(),
        _ => {
            return Decoded::Invalid {
                id,
                error: ProxyError::protocol("missing method"),
            };
        }
    };

    let record = InboundRecord {
        jsonrpc: Some("2.0".to_string()),
        id: id.clone(),
        method,
        params: obj.get("params").cloned(),
    };
    match id {
        Some(id) => Decoded::Call { id, record },
        None => Decoded::Notification(record),
    }
}

/// Serialized writer for the outbound stream. Each record becomes exactly
/// one line, written and flushed under the lock.
pub struct MessageWriter<W> {
    inner: Mutex<W>,
}

impl<W> MessageWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    /// Encode one outbound record onto the stream.
    ///
    /// # Errors
    ///
    /// Fails when the record cannot be serialized or the stream is broken;
    /// write failures are session-fatal.
    pub async fn write(&self, record: &OutboundRecord) -> Result<(), ProxyError> {
        self.write_when(record, || true).await.map(|_| ())
    }

    /// Encode one outbound record iff `permitted` still holds once the lock
    /// is held. The check and the write are atomic with respect to other
    /// writers, so a record gated on session state can never land after a
    /// terminal record written for the same id. Returns whether the record
    /// was written.
    ///
    /// # Errors
    ///
    /// Same as [`Self::write`].
    pub async fn write_when<F>(
        &self,
        record: &OutboundRecord,
        permitted: F,
    ) -> Result<bool, ProxyError>
    where
        F: FnOnce() -> bool,
    {
        let mut line = serde_json::to_vec(record)
            .map_err(|err| ProxyError::protocol(format!("encoding outbound record: {err}")))?;
        line.push(b'\n');
        let mut writer = self.inner.lock().await;
        if !permitted() {
            return Ok(false);
        }
        writer
            .write_all(&line)
            .await
            .map_err(|err| ProxyError::Transport(format!("outbound write: {err}")))?;
        writer
            .flush()
            .await
            .map_err(|err| ProxyError::Transport(format!("outbound flush: {err}")))?;
        Ok(true)
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use serde_json::json;
    use tokio::io::BufReader;

    use super::*;

    async fn lines_from(input: &[u8]) -> Vec<String> {
        let mut reader = BufReader::new(input);
        let mut buf = Vec::new();
        let mut out = Vec::new();
        while let Some(line) = next_line(&mut reader, &mut buf).await.unwrap() {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn lines_are_reassembled_across_small_buffers() {
        let input = b"{\"id\":1}\n{\"id\":2}\r\n{\"id\":3}";
        // A 3-byte buffer forces every record to span multiple reads.
        let mut reader = BufReader::with_capacity(3, &input[..]);
        let mut buf = Vec::new();
        let mut out = Vec::new();
        while let Some(line) = next_line(&mut reader, &mut buf).await.unwrap() {
            out.push(line);
        }
        assert_eq!(out, vec!["{\"id\":1}", "{\"id\":2}", "{\"id\":3}"]);
    }

    #[tokio::test]
    async fn empty_stream_yields_nothing() {
        assert!(lines_from(b"").await.is_empty());
    }

    #[tokio::test]
    async fn oversized_line_is_desynchronization() {
        let mut input = vec![b'a'; MAX_FRAME_BYTES + 1];
        input.push(b'\n');
        let mut reader = BufReader::new(&input[..]);
        let mut buf = Vec::new();
        let err = next_line(&mut reader, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), "ProtocolError");
    }

    #[test]
    fn call_and_notification_are_classified() {
        let decoded = decode_line(r#"{"jsonrpc":"2.0","id":"a","method":"tools/list"}"#);
        let Decoded::Call { id, record } = decoded else {
            panic!("expected a call");
        };
        assert_eq!(id, RequestId::String("a".to_string()));
        assert_eq!(record.method, "tools/list");

        let decoded = decode_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#);
        assert!(matches!(decoded, Decoded::Notification(_)));
    }

    #[test]
    fn missing_jsonrpc_member_is_tolerated() {
        let decoded = decode_line(r#"{"id":7,"method":"ping"}"#);
        let Decoded::Call { id, record } = decoded else {
            panic!("expected a call");
        };
        assert_eq!(id, RequestId::Number(7));
        assert_eq!(record.jsonrpc.as_deref(), Some("2.0"));
    }

    #[test]
    fn malformed_records_fail_alone() {
        let Decoded::Invalid { id, error } = decode_line("{nope") else {
            panic!("expected invalid");
        };
        assert!(id.is_none());
        assert_eq!(error.code(), -32700);

        let Decoded::Invalid { id, error } = decode_line(r#"{"jsonrpc":"2.0","id":5}"#) else {
            panic!("expected invalid");
        };
        assert_eq!(id, Some(RequestId::Number(5)));
        assert_eq!(error.code(), -32600);

        let Decoded::Invalid { error, .. } = decode_line(r#"{"id":1.5,"method":"x"}"#) else {
            panic!("expected invalid");
        };
        assert_eq!(error.code(), -32600);

        let Decoded::Invalid { error, .. } =
            decode_line(r#"{"jsonrpc":"1.0","id":1,"method":"x"}"#)
        else {
            panic!("expected invalid");
        };
        assert_eq!(error.code(), -32600);

        assert!(matches!(decode_line("[1,2]"), Decoded::Invalid { .. }));
    }

    #[tokio::test]
    async fn gated_write_skips_when_no_longer_permitted() {
        let writer = MessageWriter::new(Vec::new());
        let record = OutboundRecord::chunk(RequestId::Number(1), json!({"seq": 1}));
        assert!(!writer.write_when(&record, || false).await.unwrap());
        assert!(writer.write_when(&record, || true).await.unwrap());
        let out = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(out.lines().count(), 1, "the skipped record left no bytes");
    }

    #[tokio::test]
    async fn writer_emits_one_line_per_record() {
        let writer = MessageWriter::new(Vec::new());
        writer
            .write(&OutboundRecord::success(RequestId::Number(1), json!({"a": 1})))
            .await
            .unwrap();
        writer
            .write(&OutboundRecord::stream_end(RequestId::Number(2)))
            .await
            .unwrap();
        let out = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["id"], json!(1));
        assert_eq!(first["final"], json!(true));
    }
}
