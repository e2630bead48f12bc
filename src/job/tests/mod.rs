//! Unit tests for job decoding and the job client.

use std::sync::Arc;

use rstest::{fixture, rstest};
use serde_json::{Value, json};
use tempfile::TempDir;

use super::*;
use crate::config::MultyvacConfig;
use crate::error::ClientError;
use crate::retry::{RetryPolicy, RetryingRequester};
use crate::test_support::{ScriptedTransport, job_json};
use crate::transport::{ApiRequest, RequestBody};


fn config() -> MultyvacConfig {
    let mut config = MultyvacConfig::with_credentials("https://api.example.test", "key", "secret");
    config.config_dir = String::from("/keys");
    config
}

fn decode(value: Value) -> Job {
    serde_json::from_value(value).unwrap_or_else(|err| panic!("decode job: {err}"))
}

fn client(transport: &ScriptedTransport) -> JobClient<ScriptedTransport> {
    let requester = RetryingRequester::new(transport.clone()).with_policy(RetryPolicy::no_retry());
    JobClient::new(Arc::new(requester), Arc::new(config()))
}

/// Job client whose key directory lives under `dir`.
fn client_in(transport: &ScriptedTransport, dir: &TempDir) -> JobClient<ScriptedTransport> {
    let mut config = config();
    config.config_dir = dir.path().to_string_lossy().into_owned();
    let requester = RetryingRequester::new(transport.clone()).with_policy(RetryPolicy::no_retry());
    JobClient::new(Arc::new(requester), Arc::new(config))
}

fn key_dir() -> TempDir {
    TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"))
}

fn request_at(transport: &ScriptedTransport, index: usize) -> ApiRequest {
    transport
        .requests()
        .into_iter()
        .nth(index)
        .unwrap_or_else(|| panic!("no request recorded at {index}"))
}

#[fixture]
fn transport() -> ScriptedTransport {
    ScriptedTransport::new()
}

#[test]
fn tags_of_any_json_type_decode() {
    let job = decode(json!({
        "jid": 5,
        "status": "processing",
        "tags": {"name": "train", "priority": 3, "system": true, "extra": {"k": [1]}}
    }));

    assert_eq!(job.name.as_deref(), Some("train"));
    assert_eq!(job.tags.get("priority"), Some(&json!(3)));
    assert_eq!(job.tags.get("system"), Some(&json!(true)));
    assert_eq!(job.tags.get("extra"), Some(&json!({"k": [1]})));
}

#[test]
fn non_string_name_tag_leaves_name_unset() {
    let job = decode(json!({"jid": 5, "status": "queued", "tags": {"name": 7}}));

    assert_eq!(job.name, None);
    assert_eq!(job.tags.get("name"), Some(&json!(7)));
}

#[rstest]
#[tokio::test]
async fn batch_with_numerically_tagged_job_decodes(transport: ScriptedTransport) {
    transport.push_jobs(vec![
        json!({"jid": 1, "status": "done", "tags": {"priority": 1}}),
        json!({"jid": 2, "status": "done", "tags": {"system": true}}),
    ]);

    let jobs = client(&transport)
        .get_many(&[JobId::new(1), JobId::new(2)], &[])
        .await
        .unwrap_or_else(|err| panic!("get_many: {err}"));

    let ids: Vec<JobId> = jobs.iter().map(|job| job.jid).collect();
    assert_eq!(ids, vec![JobId::new(1), JobId::new(2)]);
}

#[test]
fn full_job_document_decodes() {
    let job = decode(json!({
        "jid": 42,
        "status": "done",
        "cmd": "python run.py",
        "core": "c2",
        "multicore": 2,
        "tags": {"name": "nightly", "team": "ml"},
        "created_at": "2014-03-01 10:00:00.250000",
        "started_at": "2014-03-01 10:00:05",
        "finished_at": null,
        "runtime": 12.5,
        "max_runtime": 30,
        "collected": {
            "cputime_user": 1.25,
            "memory_max_usage": 1024,
            "ports": {"tcp": {"22": {"address": "1.2.3.4", "port": 40022}}}
        },
        "result": "aGVsbG8=",
        "result_type": "binary",
        "return_code": 0,
        "stdout": "ok\n"
    }));

    assert_eq!(job.jid, JobId::new(42));
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.name.as_deref(), Some("nightly"));
    assert_eq!(job.tags.get("team"), Some(&json!("ml")));
    assert_eq!(
        job.created_at.map(|ts| ts.to_string()).as_deref(),
        Some("2014-03-01 10:00:00.250")
    );
    assert!(job.started_at.is_some());
    assert_eq!(job.finished_at, None);
    assert_eq!(job.metrics.cputime_user, Some(1.25));
    assert_eq!(job.metrics.memory_max_usage, Some(1024));
    assert_eq!(
        job.tcp_port(22),
        Some(&PortEndpoint {
            address: String::from("1.2.3.4"),
            port: 40022,
        })
    );
    assert_eq!(job.tcp_port(80), None);
    assert_eq!(job.result, Some(JobResult::Binary(b"hello".to_vec())));
    assert!(job.is_terminal());
}

#[test]
fn unknown_result_type_is_kept_raw() {
    let job = decode(json!({"jid": 1, "status": "done", "result": {"x": 1}, "result_type": "json"}));
    assert_eq!(job.result, Some(JobResult::Raw(json!({"x": 1}))));
}

#[rstest]
#[case(json!({"jid": 1, "status": "exploded"}))]
#[case(json!({"jid": 1, "status": "done", "created_at": "yesterday"}))]
#[case(json!({"jid": 1, "status": "done", "result": "***", "result_type": "binary"}))]
fn malformed_documents_are_rejected(#[case] value: Value) {
    assert!(serde_json::from_value::<Job>(value).is_err());
}

#[test]
fn terminal_statuses_are_exactly_the_final_four() {
    let terminal: Vec<JobStatus> = JobStatus::ALL
        .into_iter()
        .filter(|status| status.is_terminal())
        .collect();
    assert_eq!(
        terminal,
        vec![
            JobStatus::Done,
            JobStatus::Error,
            JobStatus::Killed,
            JobStatus::Stalled
        ]
    );
    for status in JobStatus::ALL {
        assert_eq!(StatusSet::terminal().contains(status), status.is_terminal());
    }
}

#[rstest]
#[tokio::test]
async fn get_returns_matching_job(transport: ScriptedTransport) {
    transport.push_jobs(vec![job_json(7, "queued")]);

    let job = client(&transport)
        .get(JobId::new(7))
        .await
        .unwrap_or_else(|err| panic!("get: {err}"));

    assert_eq!(job.map(|job| job.status), Some(JobStatus::Queued));
    let request = request_at(&transport, 0);
    assert_eq!(request.path(), "/job");
    assert_eq!(request.query_values("jid"), vec!["7"]);
    assert_eq!(request.query_values("limit"), vec!["1"]);
}

#[rstest]
#[tokio::test]
async fn get_of_unknown_job_is_none(transport: ScriptedTransport) {
    transport.push_jobs(Vec::new());
    let job = client(&transport)
        .get(JobId::new(7))
        .await
        .unwrap_or_else(|err| panic!("get: {err}"));
    assert_eq!(job, None);
}

#[rstest]
#[tokio::test]
async fn get_many_chunks_and_preserves_order(transport: ScriptedTransport) {
    let jids: Vec<JobId> = (1..=120).rev().map(JobId::new).collect();
    for chunk in jids.chunks(JOB_FETCH_CHUNK) {
        // Responses arrive in a different order than requested.
        let mut jobs: Vec<Value> = chunk
            .iter()
            .map(|jid| job_json(jid.get(), "done"))
            .collect();
        jobs.reverse();
        transport.push_jobs(jobs);
    }

    let jobs = client(&transport)
        .get_many(&jids, &["stdout"])
        .await
        .unwrap_or_else(|err| panic!("get_many: {err}"));

    assert_eq!(transport.request_count(), 3);
    assert_eq!(jobs.iter().map(|job| job.jid).collect::<Vec<_>>(), jids);
    let first = request_at(&transport, 0);
    assert_eq!(first.query_values("jid").len(), 50);
    assert_eq!(request_at(&transport, 2).query_values("jid").len(), 20);
    assert_eq!(
        first.query_values("field"),
        vec!["jid", "status", "stdout"]
    );
}

#[rstest]
#[tokio::test]
async fn get_many_reports_missing_jobs(transport: ScriptedTransport) {
    transport.push_jobs(vec![job_json(1, "done")]);

    let err = client(&transport)
        .get_many(&[JobId::new(1), JobId::new(2)], &[])
        .await
        .err();

    assert_eq!(err, Some(ClientError::JobNotFound { jid: JobId::new(2) }));
    assert!(request_at(&transport, 0).query_values("field").is_empty());
}

#[rstest]
#[tokio::test]
async fn shell_submit_wraps_job_and_returns_first_id(transport: ScriptedTransport) {
    transport.push_json(json!({"jids": [99]}));

    let jid = client(&transport)
        .shell_submit(&ShellJob::new("echo hi").name("greeting"))
        .await
        .unwrap_or_else(|err| panic!("submit: {err}"));

    assert_eq!(jid, JobId::new(99));
    let request = request_at(&transport, 0);
    assert_eq!(request.path(), "/job");
    let RequestBody::Json(body) = request.body() else {
        panic!("expected JSON body, got {:?}", request.body());
    };
    let submitted = &body["jobs"][0];
    assert_eq!(submitted["cmd"], json!("echo hi"));
    assert_eq!(submitted["name"], json!("greeting"));
}

#[rstest]
#[tokio::test]
async fn shell_submit_without_ids_is_unexpected(transport: ScriptedTransport) {
    transport.push_json(json!({"jids": []}));
    let err = client(&transport).shell_submit(&ShellJob::new("true")).await.err();
    assert!(matches!(err, Some(ClientError::UnexpectedResponse { .. })));
}

#[rstest]
#[tokio::test]
async fn kill_many_sends_form_ids(transport: ScriptedTransport) {
    transport.push_json(json!({"status": "ok"}));

    let acknowledged = client(&transport)
        .kill_many(&[JobId::new(3), JobId::new(4)])
        .await
        .unwrap_or_else(|err| panic!("kill: {err}"));

    assert!(acknowledged);
    let request = request_at(&transport, 0);
    assert_eq!(request.path(), "/job/kill");
    assert_eq!(
        request.body(),
        &RequestBody::Form(vec![
            (String::from("jid"), String::from("3")),
            (String::from("jid"), String::from("4")),
        ])
    );
}

#[rstest]
#[tokio::test]
async fn kill_all_reports_refusal(transport: ScriptedTransport) {
    transport.push_json(json!({"status": "denied"}));
    let acknowledged = client(&transport)
        .kill_all()
        .await
        .unwrap_or_else(|err| panic!("kill_all: {err}"));
    assert!(!acknowledged);
}

#[rstest]
#[tokio::test]
async fn queue_stats_are_returned(transport: ScriptedTransport) {
    transport.push_json(json!({"stats": {"queued": 4, "processing": 1}}));
    let stats = client(&transport)
        .queue_stats()
        .await
        .unwrap_or_else(|err| panic!("stats: {err}"));
    assert_eq!(stats.counters.get("queued"), Some(&json!(4)));
}

#[rstest]
#[tokio::test]
async fn list_sends_filters(transport: ScriptedTransport) {
    transport.push_jobs(vec![job_json(5, "error")]);
    let query = JobQuery {
        name: Some(String::from("nightly")),
        status: Some(JobStatus::Error),
        limit: 10,
        ..JobQuery::default()
    };

    let jobs = client(&transport)
        .list(&query)
        .await
        .unwrap_or_else(|err| panic!("list: {err}"));

    assert_eq!(jobs.len(), 1);
    let request = request_at(&transport, 0);
    assert_eq!(request.query_values("name"), vec!["nightly"]);
    assert_eq!(request.query_values("status"), vec!["error"]);
    assert_eq!(request.query_values("limit"), vec!["10"]);
}

#[rstest]
#[tokio::test]
async fn get_result_of_failed_job_is_an_error(transport: ScriptedTransport) {
    let job = decode(json!({"jid": 8, "status": "error", "stderr": "Traceback"}));

    let err = client(&transport).get_result(job).await.err();

    assert_eq!(
        err,
        Some(ClientError::JobFailed {
            jid: JobId::new(8),
            status: JobStatus::Error,
            stderr: String::from("Traceback"),
        })
    );
    assert_eq!(transport.request_count(), 0);
}

#[rstest]
#[tokio::test]
async fn get_result_of_done_job_returns_result(transport: ScriptedTransport) {
    let job = decode(json!({"jid": 8, "status": "done", "result": "AQI=", "result_type": "pickle"}));
    let result = client(&transport)
        .get_result(job)
        .await
        .unwrap_or_else(|err| panic!("result: {err}"));
    assert_eq!(result, Some(JobResult::Serialized(vec![1, 2])));
}
