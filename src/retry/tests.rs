//! Unit tests for the retry loop and backoff arithmetic.

use super::*;
use crate::error::RequestError;
use crate::test_support::ScriptedTransport;
use rstest::{fixture, rstest};
use serde_json::json;
use tokio::time::Instant;

fn connection_error() -> ClientError {
    ClientError::Connection {
        message: String::from("connection reset"),
    }
}

fn service_error(status: u16, retry: bool) -> ClientError {
    ClientError::Request(RequestError {
        http_status: status,
        code: None,
        message: String::from("scripted"),
        hint: None,
        retry,
    })
}

#[fixture]
fn transport() -> ScriptedTransport {
    ScriptedTransport::new()
}

fn requester(transport: &ScriptedTransport) -> RetryingRequester<ScriptedTransport> {
    RetryingRequester::new(transport.clone()).with_jitter(|| 0.0)
}

#[rstest]
fn backoff_never_drops_below_floor() {
    let floor = Duration::from_secs(1);
    for attempt in 0..12 {
        for sample in [0.0, 0.25, 0.5, 0.99] {
            assert!(backoff_delay(attempt, sample, floor) >= floor);
        }
    }
}

#[rstest]
#[case(0.1)]
#[case(0.5)]
#[case(0.9)]
fn backoff_is_monotonic_for_fixed_sample(#[case] sample: f64) {
    let floor = Duration::from_secs(1);
    let delays: Vec<Duration> = (1..12)
        .map(|attempt| backoff_delay(attempt, sample, floor))
        .collect();
    assert!(delays.windows(2).all(|pair| matches!(pair, [a, b] if a <= b)));
}

#[rstest]
fn backoff_is_bounded_by_exponential_ceiling() {
    let floor = Duration::from_secs(1);
    for attempt in 1..10 {
        let ceiling = Duration::from_secs(1 << attempt).max(floor);
        assert!(backoff_delay(attempt, 0.999, floor) <= ceiling);
    }
}

#[rstest]
fn rate_limit_widens_budget_by_one_and_raises_floor() {
    let mut state = RetryState::new(RetryPolicy::default());
    let decision = state.record_failure(&service_error(429, true), 0.0);
    assert_eq!(state.max_attempts(), 6);
    assert_eq!(decision, RetryDecision::Retry(Duration::from_secs(5)));
}

#[rstest]
fn rate_limit_widening_is_capped() {
    let policy = RetryPolicy::default();
    let mut state = RetryState::new(policy);
    let mut failures = 0;
    while state.record_failure(&service_error(429, true), 0.0) != RetryDecision::GiveUp {
        failures += 1;
        assert!(failures < 100, "rate limit retries must terminate");
    }
    assert_eq!(
        state.max_attempts(),
        policy.max_attempts + policy.max_rate_limit_extensions
    );
}

#[rstest]
fn non_retry_safe_error_gives_up_immediately() {
    let mut state = RetryState::new(RetryPolicy::default());
    assert_eq!(
        state.record_failure(&service_error(400, false), 0.5),
        RetryDecision::GiveUp
    );
    assert_eq!(state.attempt(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn returns_first_success_without_retry(transport: ScriptedTransport) {
    transport.push_json(json!({"status": "ok"}));
    let value = requester(&transport)
        .send(&ApiRequest::get("/job"))
        .await
        .unwrap_or_else(|err| panic!("send: {err}"));
    assert_eq!(value, json!({"status": "ok"}));
    assert_eq!(transport.request_count(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn connection_errors_are_retried_with_backoff(transport: ScriptedTransport) {
    transport.push_error(connection_error());
    transport.push_error(connection_error());
    transport.push_json(json!({"jids": [7]}));

    let start = Instant::now();
    let value = requester(&transport)
        .send(&ApiRequest::post("/job"))
        .await
        .unwrap_or_else(|err| panic!("send: {err}"));

    assert_eq!(value, json!({"jids": [7]}));
    assert_eq!(transport.request_count(), 3);
    assert_eq!(start.elapsed(), Duration::from_secs(2));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn non_retry_safe_error_is_returned_unmodified(transport: ScriptedTransport) {
    let error = service_error(400, false);
    transport.push_error(error.clone());
    transport.push_json(json!({}));

    let result = requester(&transport).send(&ApiRequest::get("/job")).await;
    assert_eq!(result, Err(error));
    assert_eq!(transport.request_count(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn exhausted_budget_surfaces_last_error(transport: ScriptedTransport) {
    for _ in 0..5 {
        transport.push_error(connection_error());
    }
    let result = requester(&transport).send(&ApiRequest::get("/job")).await;
    assert_eq!(result, Err(connection_error()));
    assert_eq!(transport.request_count(), 5);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn rate_limited_requests_extend_budget_up_to_cap(transport: ScriptedTransport) {
    for _ in 0..12 {
        transport.push_error(service_error(429, true));
    }
    let start = Instant::now();
    let result = requester(&transport).send(&ApiRequest::get("/job")).await;

    assert_eq!(result, Err(service_error(429, true)));
    assert_eq!(transport.request_count(), 10);
    assert_eq!(start.elapsed(), Duration::from_secs(45));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn cancellation_stops_backoff(transport: ScriptedTransport) {
    transport.push_error(connection_error());
    transport.push_json(json!({}));
    let (handle, token) = Cancellation::pair();
    handle.cancel();

    let result = requester(&transport)
        .with_cancellation(token)
        .send(&ApiRequest::get("/job"))
        .await;
    assert_eq!(result, Err(ClientError::Cancelled));
    assert_eq!(transport.request_count(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn send_as_reports_schema_mismatch(transport: ScriptedTransport) {
    #[derive(Debug, serde::Deserialize)]
    struct Jids {
        #[expect(dead_code, reason = "field only exercised through deserialisation")]
        jids: Vec<u64>,
    }

    transport.push_json(json!({"jids": "not-a-list"}));
    let result = requester(&transport)
        .send_as::<Jids>(&ApiRequest::post("/job"))
        .await;
    let Err(ClientError::UnexpectedResponse { context, .. }) = result else {
        panic!("expected schema mismatch, got {result:?}");
    };
    assert_eq!(context, "/job");
}
