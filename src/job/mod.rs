//! Job snapshots, status model, and the job client.
//!
//! A [`Job`] is an immutable point-in-time view of a remote job. Polling
//! produces new snapshots through [`JobClient::refresh`]; nothing mutates a
//! snapshot in place.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod batch;
mod client;
mod port;
mod submit;
mod wait;

pub use batch::{BatchOutcome, batch_sleep};
pub(crate) use client::StatusResponse;
pub use client::{DEFAULT_LIST_LIMIT, JOB_FETCH_CHUNK, JobClient, JobQuery, QueueStats};
pub use port::{OpenPort, PORT_POLL_ATTEMPTS, PORT_POLL_INTERVAL};
pub use submit::{FunctionJob, LayerMount, ShellJob};
pub use wait::{PollSchedule, StatusSet, WaitOutcome};

/// Server-assigned job identifier.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    /// Wraps a raw identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<&Job> for JobId {
    fn from(value: &Job) -> Self {
        value.jid
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Lifecycle status of a job.
///
/// Transitions are monotonic: `waiting → queued → processing → terminal`.
/// `killed` is reachable from any non-terminal state; `stalled` only from
/// `processing`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting on dependencies.
    Waiting,
    /// Accepted and queued for a worker.
    Queued,
    /// Running on a worker.
    Processing,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Error,
    /// Killed on request.
    Killed,
    /// Lost contact with its worker.
    Stalled,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Waiting,
        Self::Queued,
        Self::Processing,
        Self::Done,
        Self::Error,
        Self::Killed,
        Self::Stalled,
    ];

    /// Returns `true` for `done`, `error`, `killed`, and `stalled`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        match self {
            Self::Done | Self::Error | Self::Killed | Self::Stalled => true,
            Self::Waiting | Self::Queued | Self::Processing => false,
        }
    }

    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Error => "error",
            Self::Killed => "killed",
            Self::Stalled => "stalled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network endpoint a job exposed for one of its ports.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PortEndpoint {
    /// Publicly reachable address.
    pub address: String,
    /// Publicly reachable port.
    pub port: u16,
}

/// Resource usage collected by the worker.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct CollectedMetrics {
    /// User CPU time in seconds.
    pub cputime_user: Option<f64>,
    /// System CPU time in seconds.
    pub cputime_system: Option<f64>,
    /// Number of times the memory limit was hit.
    pub memory_failcnt: Option<u64>,
    /// Peak memory usage in bytes.
    pub memory_max_usage: Option<u64>,
}

/// Decoded job result.
#[derive(Clone, Debug, PartialEq)]
pub enum JobResult {
    /// Raw bytes (`result_type = "binary"`).
    Binary(Vec<u8>),
    /// Serialized function return value (`result_type = "pickle"`). Kept
    /// opaque; decoding is the caller's concern.
    Serialized(Vec<u8>),
    /// Any other result type, as sent by the service.
    Raw(Value),
}

/// Immutable snapshot of a remote job.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(try_from = "RawJob")]
pub struct Job {
    /// Job identifier.
    pub jid: JobId,
    /// Status at the time of the snapshot.
    pub status: JobStatus,
    /// Name taken from the `name` tag.
    pub name: Option<String>,
    /// Shell command run by the job.
    pub cmd: Option<String>,
    /// Core type the job runs on.
    pub core: Option<String>,
    /// Number of cores requested.
    pub multicore: Option<u32>,
    /// Metadata tags. Values may be any JSON type since other clients can
    /// tag jobs too.
    pub tags: BTreeMap<String, Value>,
    /// Submission time (UTC).
    pub created_at: Option<NaiveDateTime>,
    /// Start time (UTC).
    pub started_at: Option<NaiveDateTime>,
    /// Completion time (UTC).
    pub finished_at: Option<NaiveDateTime>,
    /// Run time in seconds.
    pub runtime: Option<f64>,
    /// Maximum run time in minutes, enforced by the service.
    pub max_runtime: Option<u64>,
    /// Seconds spent queued.
    pub queue_delay: Option<f64>,
    /// Seconds of scheduling overhead.
    pub overhead_delay: Option<f64>,
    /// Opened ports, keyed by protocol then port number.
    pub ports: BTreeMap<String, BTreeMap<String, PortEndpoint>>,
    /// Collected resource usage.
    pub metrics: CollectedMetrics,
    /// Decoded result, when the job produced one.
    pub result: Option<JobResult>,
    /// Process exit code.
    pub return_code: Option<i32>,
    /// Captured standard output.
    pub stdout: Option<String>,
    /// Captured standard error.
    pub stderr: Option<String>,
}

impl Job {
    /// Returns `true` once the job reached a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the endpoint for an opened TCP port.
    #[must_use]
    pub fn tcp_port(&self, port: u16) -> Option<&PortEndpoint> {
        self.ports.get("tcp")?.get(&port.to_string())
    }
}

#[derive(Deserialize)]
struct RawCollected {
    #[serde(flatten)]
    metrics: CollectedMetrics,
    #[serde(default)]
    ports: Option<BTreeMap<String, BTreeMap<String, PortEndpoint>>>,
}

#[derive(Deserialize)]
struct RawJob {
    jid: JobId,
    status: JobStatus,
    cmd: Option<String>,
    core: Option<String>,
    multicore: Option<u32>,
    tags: Option<BTreeMap<String, Value>>,
    created_at: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
    runtime: Option<f64>,
    max_runtime: Option<u64>,
    queue_delay: Option<f64>,
    overhead_delay: Option<f64>,
    collected: Option<RawCollected>,
    result: Option<Value>,
    result_type: Option<String>,
    return_code: Option<i32>,
    stdout: Option<String>,
    stderr: Option<String>,
}

impl TryFrom<RawJob> for Job {
    type Error = String;

    fn try_from(raw: RawJob) -> Result<Self, Self::Error> {
        let tags = raw.tags.unwrap_or_default();
        let (metrics, ports) = raw.collected.map_or_else(
            || (CollectedMetrics::default(), BTreeMap::new()),
            |collected| (collected.metrics, collected.ports.unwrap_or_default()),
        );
        Ok(Self {
            jid: raw.jid,
            status: raw.status,
            name: tags.get("name").and_then(Value::as_str).map(str::to_owned),
            cmd: raw.cmd,
            core: raw.core,
            multicore: raw.multicore,
            created_at: parse_timestamp(raw.created_at.as_deref())?,
            started_at: parse_timestamp(raw.started_at.as_deref())?,
            finished_at: parse_timestamp(raw.finished_at.as_deref())?,
            tags,
            runtime: raw.runtime,
            max_runtime: raw.max_runtime,
            queue_delay: raw.queue_delay,
            overhead_delay: raw.overhead_delay,
            ports,
            metrics,
            result: decode_result(raw.result, raw.result_type.as_deref())?,
            return_code: raw.return_code,
            stdout: raw.stdout,
            stderr: raw.stderr,
        })
    }
}

fn parse_timestamp(raw: Option<&str>) -> Result<Option<NaiveDateTime>, String> {
    let Some(text) = raw else {
        return Ok(None);
    };
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S"))
        .map(Some)
        .map_err(|err| format!("invalid timestamp {text:?}: {err}"))
}

/// Deserializes an optional service timestamp (`%Y-%m-%d %H:%M:%S[.f]`,
/// UTC).
pub(crate) fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    parse_timestamp(raw.as_deref()).map_err(serde::de::Error::custom)
}

fn decode_result(raw: Option<Value>, result_type: Option<&str>) -> Result<Option<JobResult>, String> {
    let Some(value) = raw.filter(|value| !value.is_null()) else {
        return Ok(None);
    };
    let decode = |value: &Value| -> Result<Vec<u8>, String> {
        let text = value
            .as_str()
            .ok_or_else(|| String::from("encoded result must be a string"))?;
        BASE64
            .decode(text)
            .map_err(|err| format!("invalid base64 result: {err}"))
    };
    let result = match result_type {
        Some("binary") => JobResult::Binary(decode(&value)?),
        Some("pickle") => JobResult::Serialized(decode(&value)?),
        _ => JobResult::Raw(value),
    };
    Ok(Some(result))
}

#[cfg(test)]
mod tests;
