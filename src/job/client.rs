//! Job lookups, submission, and termination.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::MultyvacConfig;
use crate::error::ClientError;
use crate::retry::RetryingRequester;
use crate::ssh::{CommandRunner, RemoteCommandOutput, RemoteShell};
use crate::transport::{ApiRequest, Transport};

use super::{FunctionJob, Job, JobId, JobResult, JobStatus, OpenPort, ShellJob, StatusSet};

/// Largest number of job ids sent in one lookup.
pub const JOB_FETCH_CHUNK: usize = 50;

/// Default page size for [`JobClient::list`].
pub const DEFAULT_LIST_LIMIT: u32 = 50;

#[derive(Deserialize)]
struct JobsResponse {
    jobs: Vec<Job>,
}

#[derive(Deserialize)]
struct SubmitResponse {
    jids: Vec<JobId>,
}

#[derive(Deserialize)]
pub(crate) struct StatusResponse {
    status: String,
}

impl StatusResponse {
    pub(crate) fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Queue counters reported by `/job/queue_stats`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct QueueStats {
    /// Counter name to value.
    pub counters: BTreeMap<String, Value>,
}

#[derive(Deserialize)]
struct QueueStatsResponse {
    stats: QueueStats,
}

/// Filters for [`JobClient::list`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobQuery {
    /// Restrict to these ids.
    pub jids: Vec<JobId>,
    /// Restrict to jobs with this name.
    pub name: Option<String>,
    /// Maximum number of jobs returned.
    pub limit: u32,
    /// Only jobs submitted before this id.
    pub before: Option<JobId>,
    /// Only jobs submitted after this id.
    pub after: Option<JobId>,
    /// Only jobs in this status.
    pub status: Option<JobStatus>,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            jids: Vec::new(),
            name: None,
            limit: DEFAULT_LIST_LIMIT,
            before: None,
            after: None,
            status: None,
        }
    }
}

impl JobQuery {
    fn to_request(&self) -> ApiRequest {
        ApiRequest::get("/job")
            .query_all("jid", &self.jids)
            .query_opt("name", self.name.as_deref())
            .query("limit", self.limit)
            .query_opt("before", self.before)
            .query_opt("after", self.after)
            .query_opt("status", self.status)
    }
}

/// Client for the `/job` endpoints.
#[derive(Debug)]
pub struct JobClient<T> {
    requester: Arc<RetryingRequester<T>>,
    config: Arc<MultyvacConfig>,
}

impl<T> Clone for JobClient<T> {
    fn clone(&self) -> Self {
        Self {
            requester: Arc::clone(&self.requester),
            config: Arc::clone(&self.config),
        }
    }
}

impl<T: Transport> JobClient<T> {
    /// Builds a job client sharing `requester`.
    #[must_use]
    pub const fn new(requester: Arc<RetryingRequester<T>>, config: Arc<MultyvacConfig>) -> Self {
        Self { requester, config }
    }

    /// Returns the underlying requester.
    #[must_use]
    pub fn requester(&self) -> &RetryingRequester<T> {
        &self.requester
    }

    pub(crate) fn shared_requester(&self) -> Arc<RetryingRequester<T>> {
        Arc::clone(&self.requester)
    }

    pub(crate) fn config(&self) -> &MultyvacConfig {
        &self.config
    }

    /// Fetches one job, returning `None` when the service does not know it.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn get(&self, jid: JobId) -> Result<Option<Job>, ClientError> {
        let request = ApiRequest::get("/job").query("jid", jid).query("limit", 1);
        let response: JobsResponse = self.requester.send_as(&request).await?;
        Ok(response.jobs.into_iter().find(|job| job.jid == jid))
    }

    /// Fetches several jobs in chunks of [`JOB_FETCH_CHUNK`], preserving the
    /// requested order. `fields` limits the returned attributes; `jid` and
    /// `status` are always included.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::JobNotFound`] when any requested job is missing
    /// from the responses.
    pub async fn get_many(&self, jids: &[JobId], fields: &[&str]) -> Result<Vec<Job>, ClientError> {
        let fields = required_fields(fields);
        let mut found: HashMap<JobId, Job> = HashMap::with_capacity(jids.len());
        for chunk in jids.chunks(JOB_FETCH_CHUNK) {
            let request = ApiRequest::get("/job")
                .query_all("jid", chunk)
                .query_all("field", &fields);
            let response: JobsResponse = self.requester.send_as(&request).await?;
            found.extend(response.jobs.into_iter().map(|job| (job.jid, job)));
        }

        jids.iter()
            .map(|jid| {
                found
                    .get(jid)
                    .cloned()
                    .ok_or(ClientError::JobNotFound { jid: *jid })
            })
            .collect()
    }

    /// Fetches the most recent job with `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn get_by_name(&self, name: &str) -> Result<Option<Job>, ClientError> {
        let query = JobQuery {
            name: Some(name.to_owned()),
            limit: 1,
            ..JobQuery::default()
        };
        Ok(self.list(&query).await?.into_iter().next())
    }

    /// Lists jobs matching `query`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn list(&self, query: &JobQuery) -> Result<Vec<Job>, ClientError> {
        let response: JobsResponse = self.requester.send_as(&query.to_request()).await?;
        Ok(response.jobs)
    }

    /// Returns a fresh snapshot of `job`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::JobNotFound`] when the job disappeared.
    pub async fn refresh(&self, job: &Job) -> Result<Job, ClientError> {
        self.get(job.jid)
            .await?
            .ok_or(ClientError::JobNotFound { jid: job.jid })
    }

    /// Submits a shell command and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails or the response lacks a
    /// job id.
    pub async fn shell_submit(&self, job: &ShellJob) -> Result<JobId, ClientError> {
        let request = ApiRequest::post("/job").json(json!({"jobs": [job.to_json()]}));
        let response: SubmitResponse = self.requester.send_as(&request).await?;
        let jid = response
            .jids
            .first()
            .copied()
            .ok_or_else(|| ClientError::unexpected("/job", "response contained no job ids"))?;
        debug!(%jid, "submitted job");
        Ok(jid)
    }

    /// Submits a serialized function payload and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn submit_payload(&self, job: FunctionJob) -> Result<JobId, ClientError> {
        self.shell_submit(&job.into_shell_job()).await
    }

    /// Kills one job. Returns `true` when the service acknowledged it.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn kill(&self, jid: JobId) -> Result<bool, ClientError> {
        self.kill_many(&[jid]).await
    }

    /// Kills several jobs in one request.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn kill_many(&self, jids: &[JobId]) -> Result<bool, ClientError> {
        let request = jids
            .iter()
            .fold(ApiRequest::post("/job/kill"), |request, jid| {
                request.form("jid", jid)
            });
        let response: StatusResponse = self.requester.send_as(&request).await?;
        Ok(response.is_ok())
    }

    /// Kills every job owned by the account.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn kill_all(&self) -> Result<bool, ClientError> {
        let response: StatusResponse = self
            .requester
            .send_as(&ApiRequest::post("/job/kill_all"))
            .await?;
        Ok(response.is_ok())
    }

    /// Returns the account's queue counters.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn queue_stats(&self) -> Result<QueueStats, ClientError> {
        let response: QueueStatsResponse = self
            .requester
            .send_as(&ApiRequest::get("/job/queue_stats"))
            .await?;
        Ok(response.stats)
    }

    /// Waits for `job` to finish and returns its result.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::JobFailed`] when the job ends in any status
    /// other than `done`.
    pub async fn get_result(&self, job: Job) -> Result<Option<JobResult>, ClientError> {
        let finished = self
            .wait(job, StatusSet::terminal(), None)
            .await?
            .into_job();
        if finished.status == JobStatus::Done {
            return Ok(finished.result);
        }
        Err(ClientError::JobFailed {
            jid: finished.jid,
            status: finished.status,
            stderr: finished.stderr.unwrap_or_default(),
        })
    }

    /// Waits for the job's SSH port and runs `command` there.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::PortNotOpened`] when the job never opens its
    /// SSH port, or any error from the remote shell.
    pub async fn run_command<R: CommandRunner>(
        &self,
        job: &Job,
        command: &str,
        shell: &RemoteShell<R>,
    ) -> Result<RemoteCommandOutput, ClientError> {
        let endpoint = self.require_ssh(job).await?;
        Ok(shell.run_command(&endpoint, command).await?)
    }

    /// Waits for the job's SSH port and returns it, or
    /// [`ClientError::PortNotOpened`].
    pub(crate) async fn require_ssh(&self, job: &Job) -> Result<OpenPort, ClientError> {
        self.wait_for_open_port(job.clone(), 22, None)
            .await?
            .ok_or(ClientError::PortNotOpened {
                jid: job.jid,
                port: 22,
            })
    }
}

fn required_fields<'a>(fields: &[&'a str]) -> Vec<&'a str> {
    if fields.is_empty() {
        return Vec::new();
    }
    let mut merged = vec!["jid", "status"];
    merged.extend(
        fields
            .iter()
            .copied()
            .filter(|field| !matches!(*field, "jid" | "status")),
    );
    merged
}
