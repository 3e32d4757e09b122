//! The signed transport against real HTTP servers: mockito for signing,
//! status mapping, and streaming; a raw TCP listener for the retry path,
//! where two different responses on consecutive connections are needed.

#![allow(clippy::unwrap_used)]

use std::collections::HashSet;
use std::time::Duration;

use futures::StreamExt;
use mockito::Matcher;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_test::assert_ok;

use lambda_mcp_proxy::auth::Credential;
use lambda_mcp_proxy::config::{DuplicatePolicy, ProxyConfig};
use lambda_mcp_proxy::http::{SignedTransport, Transport};

fn credential() -> Credential {
    Credential {
        access_key: "AKIDTEST".to_string(),
        secret_key: "test-secret".to_string(),
        session_token: None,
        region: "us-east-1".to_string(),
    }
}

fn config_for(endpoint: &str) -> ProxyConfig {
    ProxyConfig {
        endpoint: endpoint.trim_end_matches('/').to_string(),
        region: "us-east-1".to_string(),
        timeout: Duration::from_secs(5),
        max_concurrency: 4,
        max_retries: 3,
        streaming_methods: HashSet::new(),
        duplicate_policy: DuplicatePolicy::Reject,
    }
}

const AUTHORIZATION_PATTERN: &str = r"^AWS4-HMAC-SHA256 Credential=AKIDTEST/\d{8}/us-east-1/execute-api/aws4_request, SignedHeaders=[a-z0-9;-]+, Signature=[0-9a-f]{64}$";

#[tokio::test]
async fn buffered_call_is_signed_and_decoded() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/mcp")
        .match_header(
            "authorization",
            Matcher::Regex(AUTHORIZATION_PATTERN.to_string()),
        )
        .match_header("x-amz-date", Matcher::Regex(r"^\d{8}T\d{6}Z$".to_string()))
        .match_header("content-type", "application/json")
        .with_header("content-type", "application/json")
        .with_body(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#)
        .create_async()
        .await;

    let transport = SignedTransport::new(&config_for(&server.url()), credential()).unwrap();
    let payload = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
    let value = transport.invoke_buffered(&payload).await.unwrap();

    assert_eq!(value["result"], json!({"tools": []}));
    mock.assert_async().await;
}

#[tokio::test]
async fn session_token_is_forwarded_when_present() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/mcp")
        .match_header("x-amz-security-token", "SESSION-TOKEN")
        .match_header(
            "authorization",
            Matcher::Regex("x-amz-security-token".to_string()),
        )
        .with_header("content-type", "application/json")
        .with_body("{}")
        .create_async()
        .await;

    let mut credential = credential();
    credential.session_token = Some("SESSION-TOKEN".to_string());
    let transport = SignedTransport::new(&config_for(&server.url()), credential).unwrap();
    transport
        .invoke_buffered(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .await
        .unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn client_errors_are_terminal_without_retry() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/mcp")
        .with_status(400)
        .with_body("bad request")
        .expect(1)
        .create_async()
        .await;

    let transport = SignedTransport::new(&config_for(&server.url()), credential()).unwrap();
    let err = transport
        .invoke_buffered(&json!({"jsonrpc": "2.0", "id": 1, "method": "x"}))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "RemoteError");
    assert!(err.to_string().contains("400"));
    mock.assert_async().await;
}

#[tokio::test]
async fn empty_credential_fails_before_any_network_io() {
    let config = config_for("https://unreachable.invalid");
    let mut credential = credential();
    credential.secret_key.clear();
    let transport = SignedTransport::new(&config, credential).unwrap();
    let err = transport
        .invoke_buffered(&json!({"jsonrpc": "2.0", "id": 1, "method": "x"}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "CredentialError");
}

#[tokio::test]
async fn event_stream_yields_chunks_until_the_end_marker() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/mcp")
        .with_header("content-type", "text/event-stream")
        .with_body(
            "data: {\"seq\":1}\n\nevent: progress\ndata: {\"seq\":2}\n\ndata: [DONE]\n\ndata: {\"after\":true}\n\n",
        )
        .create_async()
        .await;

    let transport = SignedTransport::new(&config_for(&server.url()), credential()).unwrap();
    let mut chunks = transport
        .invoke_streaming(&json!({"jsonrpc": "2.0", "id": 1, "method": "stream"}))
        .await
        .unwrap();

    let mut collected = Vec::new();
    while let Some(next) = chunks.next().await {
        collected.push(next.unwrap());
    }
    assert_eq!(collected, vec![json!({"seq": 1}), json!({"seq": 2})]);
}

#[tokio::test]
async fn plain_json_answer_to_a_streaming_call_is_one_chunk() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/mcp")
        .with_header("content-type", "application/json")
        .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"whole"}"#)
        .create_async()
        .await;

    let transport = SignedTransport::new(&config_for(&server.url()), credential()).unwrap();
    let mut chunks = transport
        .invoke_streaming(&json!({"jsonrpc": "2.0", "id": 1, "method": "stream"}))
        .await
        .unwrap();

    let first = chunks.next().await.unwrap().unwrap();
    assert_eq!(first["result"], json!("whole"));
    assert!(chunks.next().await.is_none());
}

#[tokio::test]
async fn streamed_answer_to_a_buffered_call_is_drained() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/mcp")
        .with_header("content-type", "text/event-stream")
        .with_body("data: {\"seq\":1}\n\ndata: {\"seq\":2}\n\ndata: [DONE]\n\n")
        .create_async()
        .await;

    let transport = SignedTransport::new(&config_for(&server.url()), credential()).unwrap();
    let value = transport
        .invoke_buffered(&json!({"jsonrpc": "2.0", "id": 1, "method": "x"}))
        .await
        .unwrap();
    assert_eq!(value, json!({"seq": 2}));
}

#[tokio::test]
async fn health_check_hits_the_signed_health_route() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/health")
        .match_header(
            "authorization",
            Matcher::Regex(AUTHORIZATION_PATTERN.to_string()),
        )
        .with_body("ok")
        .create_async()
        .await;

    let transport = SignedTransport::new(&config_for(&server.url()), credential()).unwrap();
    tokio_test::assert_ok!(transport.health_check().await);
    mock.assert_async().await;
}

#[tokio::test]
async fn unhealthy_endpoint_surfaces_the_status() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/health")
        .with_status(403)
        .create_async()
        .await;

    let transport = SignedTransport::new(&config_for(&server.url()), credential()).unwrap();
    let err = transport.health_check().await.unwrap_err();
    assert_eq!(err.kind(), "RemoteError");
}

/// Read one HTTP/1.1 request (headers plus content-length body) off a raw
/// socket.
async fn read_request(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut tmp = [0_u8; 1024];
    loop {
        let n = stream.read(&mut tmp).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
            let content_length = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= pos + 4 + content_length {
                break;
            }
        }
    }
    buf
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[tokio::test]
async fn transient_failure_is_retried_and_each_attempt_is_signed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut first, _) = listener.accept().await.unwrap();
        let first_request = read_request(&mut first).await;
        first
            .write_all(
                b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        first.shutdown().await.unwrap();

        let (mut second, _) = listener.accept().await.unwrap();
        let second_request = read_request(&mut second).await;
        let body = br#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#;
        let head = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            body.len()
        );
        second.write_all(head.as_bytes()).await.unwrap();
        second.write_all(body).await.unwrap();
        (first_request, second_request)
    });

    let transport =
        SignedTransport::new(&config_for(&format!("http://{addr}")), credential()).unwrap();
    let value = transport
        .invoke_buffered(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call"}))
        .await
        .unwrap();
    assert_eq!(value["result"], json!({"ok": true}));

    let (first_request, second_request) = server.await.unwrap();
    // Both attempts carried a full signature.
    assert!(find(&first_request, b"AWS4-HMAC-SHA256 Credential=AKIDTEST/").is_some());
    assert!(find(&second_request, b"AWS4-HMAC-SHA256 Credential=AKIDTEST/").is_some());
}
