//! Integration tests for the reqwest-backed transport against a canned HTTP
//! server.

#[path = "common/test_constants.rs"]
#[expect(dead_code, reason = "these tests talk to a local server, not the unroutable URL")]
mod test_constants;

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use multyvac::config::MultyvacConfig;
use multyvac::retry::{RetryPolicy, RetryingRequester};
use multyvac::transport::{ApiRequest, HttpTransport};
use multyvac::ClientError;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use test_constants::{TEST_API_KEY, TEST_API_SECRET};

/// Serves one canned response and returns the raw request it received.
async fn serve_once(status_line: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|err| panic!("bind: {err}"));
    let address = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("local addr: {err}"));
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener
            .accept()
            .await
            .unwrap_or_else(|err| panic!("accept: {err}"));
        let request = read_request(&mut socket).await;
        let response = format!(
            "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        socket
            .write_all(response.as_bytes())
            .await
            .unwrap_or_else(|err| panic!("write: {err}"));
        socket.shutdown().await.ok();
        request
    });
    (format!("http://{address}"), handle)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut received = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        let read = socket
            .read(&mut chunk)
            .await
            .unwrap_or_else(|err| panic!("read: {err}"));
        if read == 0 {
            break;
        }
        received.extend(chunk.iter().take(read));
        let text = String::from_utf8_lossy(&received);
        if let Some((head, body)) = text.split_once("\r\n\r\n")
            && body.len() >= content_length(head)
        {
            break;
        }
    }
    String::from_utf8_lossy(&received).into_owned()
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

fn requester(api_url: &str) -> RetryingRequester<HttpTransport> {
    let config = MultyvacConfig::with_credentials(api_url, TEST_API_KEY, TEST_API_SECRET);
    let transport = HttpTransport::new(config).unwrap_or_else(|err| panic!("transport: {err}"));
    RetryingRequester::new(transport).with_policy(RetryPolicy::no_retry())
}

#[tokio::test]
async fn requests_carry_basic_auth_and_query() {
    let (url, server) = serve_once("200 OK", r#"{"jobs": []}"#).await;

    let value = requester(&url)
        .send(&ApiRequest::get("/job").query("jid", 7))
        .await
        .unwrap_or_else(|err| panic!("send: {err}"));
    let raw = server.await.unwrap_or_else(|err| panic!("server: {err}"));

    assert_eq!(value, json!({"jobs": []}));
    assert!(raw.starts_with("GET /job?jid=7 HTTP/1.1"), "{raw}");
    let token = BASE64.encode(format!("{TEST_API_KEY}:{TEST_API_SECRET}"));
    assert!(
        raw.to_ascii_lowercase()
            .contains(&format!("authorization: basic {}", token.to_ascii_lowercase())),
        "{raw}"
    );
}

#[tokio::test]
async fn form_bodies_are_url_encoded() {
    let (url, server) = serve_once("200 OK", r#"{"status": "ok"}"#).await;

    requester(&url)
        .send(&ApiRequest::post("/job/kill").form("jid", 1).form("jid", 2))
        .await
        .unwrap_or_else(|err| panic!("send: {err}"));
    let raw = server.await.unwrap_or_else(|err| panic!("server: {err}"));

    assert!(raw.starts_with("POST /job/kill HTTP/1.1"), "{raw}");
    assert!(raw.ends_with("jid=1&jid=2"), "{raw}");
}

#[tokio::test]
async fn service_errors_are_decoded() {
    let (url, server) = serve_once(
        "400 Bad Request",
        r#"{"error": {"code": "bad", "message": "nope", "hint": "fix it", "retry": false}}"#,
    )
    .await;

    let err = requester(&url).send(&ApiRequest::get("/job")).await.err();
    server.await.unwrap_or_else(|err| panic!("server: {err}"));

    let Some(ClientError::Request(request_error)) = err else {
        panic!("expected request error, got {err:?}");
    };
    assert_eq!(request_error.http_status, 400);
    assert_eq!(request_error.code.as_deref(), Some("bad"));
    assert_eq!(request_error.message, "nope");
    assert_eq!(request_error.hint.as_deref(), Some("fix it"));
}

#[tokio::test]
async fn refused_connection_is_a_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|err| panic!("bind: {err}"));
    let address = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("local addr: {err}"));
    drop(listener);

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        requester(&format!("http://{address}")).send(&ApiRequest::get("/job")),
    )
    .await
    .unwrap_or_else(|_| panic!("request did not finish"));

    assert!(
        matches!(result, Err(ClientError::Connection { .. })),
        "unexpected result: {result:?}"
    );
}
