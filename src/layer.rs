//! Layers: named filesystem images jobs run on.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::json;

use crate::config::MultyvacConfig;
use crate::error::ClientError;
use crate::job::{
    Job, JobClient, JobId, LayerMount, OpenPort, ShellJob, StatusResponse, StatusSet, WaitOutcome,
    deserialize_timestamp,
};
use crate::resource::{ContentClient, ResourceKind};
use crate::retry::RetryingRequester;
use crate::ssh::{CommandRunner, RemoteShell};
use crate::transport::{ApiRequest, Transport};

/// Default lifetime of a layer modification job.
pub const DEFAULT_MODIFY_RUNTIME: Duration = Duration::from_secs(3_600);

/// Signal sent to the modification job to snapshot the layer.
const SNAPSHOT_COMMAND: &str = "killall -10 python";

/// A named filesystem image.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Layer {
    /// Unique layer name.
    pub name: String,
    /// Size in bytes.
    pub size: Option<u64>,
    /// Creation time (UTC).
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub created_at: Option<NaiveDateTime>,
}

#[derive(Deserialize)]
struct LayersResponse {
    layers: Vec<Layer>,
}

/// Client for the `/layer` endpoints.
#[derive(Debug)]
pub struct LayerClient<T> {
    requester: Arc<RetryingRequester<T>>,
    jobs: JobClient<T>,
}

impl<T> Clone for LayerClient<T> {
    fn clone(&self) -> Self {
        Self {
            requester: Arc::clone(&self.requester),
            jobs: self.jobs.clone(),
        }
    }
}

impl<T: Transport> LayerClient<T> {
    /// Builds a layer client sharing `requester`.
    #[must_use]
    pub fn new(requester: Arc<RetryingRequester<T>>, config: Arc<MultyvacConfig>) -> Self {
        Self {
            jobs: JobClient::new(Arc::clone(&requester), config),
            requester,
        }
    }

    /// Lists layers, restricted to `names` when non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn list(&self, names: &[&str]) -> Result<Vec<Layer>, ClientError> {
        let request = ApiRequest::get("/layer").query_all("name", names);
        let response: LayersResponse = self.requester.send_as(&request).await?;
        Ok(response.layers)
    }

    /// Fetches one layer by name.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn get(&self, name: &str) -> Result<Option<Layer>, ClientError> {
        Ok(self.list(&[name]).await?.into_iter().next())
    }

    /// Creates an empty layer.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn create(&self, name: &str) -> Result<bool, ClientError> {
        let request = ApiRequest::post("/layer").json(json!({"layer": {"name": name}}));
        let response: StatusResponse = self.requester.send_as(&request).await?;
        Ok(response.is_ok())
    }

    /// Returns a client for the files inside `name`.
    #[must_use]
    pub fn contents(&self, name: &str) -> ContentClient<T> {
        ContentClient::new(Arc::clone(&self.requester), ResourceKind::Layer, name)
    }

    /// Starts a job with `layer` mounted read-write. Changes made over SSH
    /// become part of the layer once [`ModifyLayerJob::snapshot`] runs.
    /// The job sleeps for `max_runtime` and is then reaped by the service.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when submission fails.
    pub async fn modify(
        &self,
        layer: &str,
        volumes: &[&str],
        max_runtime: Duration,
    ) -> Result<ModifyLayerJob<T>, ClientError> {
        let spec = volumes.iter().fold(
            ShellJob::new(format!("sleep {}", max_runtime.as_secs()))
                .name(format!("layer modify {layer}"))
                .layer_mount(LayerMount::read_write(layer))
                .tag("system", "true"),
            |spec, volume| spec.volume(*volume),
        );
        let jid = self.jobs.shell_submit(&spec).await?;
        self.modify_job(jid).await
    }

    /// Recovers the handle for an earlier [`LayerClient::modify`] job.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::JobNotFound`] when the job is unknown.
    pub async fn modify_job(&self, jid: JobId) -> Result<ModifyLayerJob<T>, ClientError> {
        let job = self
            .jobs
            .get(jid)
            .await?
            .ok_or(ClientError::JobNotFound { jid })?;
        Ok(ModifyLayerJob {
            job,
            jobs: self.jobs.clone(),
        })
    }
}

/// A running layer modification job.
#[derive(Clone, Debug)]
pub struct ModifyLayerJob<T> {
    job: Job,
    jobs: JobClient<T>,
}

impl<T: Transport> ModifyLayerJob<T> {
    /// Returns the snapshot taken when the handle was created.
    #[must_use]
    pub const fn job(&self) -> &Job {
        &self.job
    }

    /// Waits for the job's SSH endpoint. Returns `None` when the job never
    /// serves SSH.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when polling fails.
    pub async fn ssh_info(&self) -> Result<Option<OpenPort>, ClientError> {
        self.jobs.wait_for_open_port(self.job.clone(), 22, None).await
    }

    /// Saves the layer changes and waits for the job to finish.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the job cannot be reached over SSH or
    /// polling fails.
    pub async fn snapshot<R: CommandRunner>(self, shell: &RemoteShell<R>) -> Result<Job, ClientError> {
        self.jobs.run_command(&self.job, SNAPSHOT_COMMAND, shell).await?;
        let outcome: WaitOutcome = self.jobs.wait(self.job, StatusSet::terminal(), None).await?;
        Ok(outcome.into_job())
    }

    /// Discards the layer changes by killing the job.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the kill request fails.
    pub async fn abort(self) -> Result<bool, ClientError> {
        self.jobs.kill(self.job.jid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::test_support::{ScriptedRunner, ScriptedTransport, job_json, job_with_port};
    use crate::transport::RequestBody;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    fn config() -> MultyvacConfig {
        MultyvacConfig::with_credentials("https://api.example.test", "key", "secret")
    }

    fn client(transport: &ScriptedTransport) -> LayerClient<ScriptedTransport> {
        client_with(transport, config())
    }

    fn client_with(
        transport: &ScriptedTransport,
        config: MultyvacConfig,
    ) -> LayerClient<ScriptedTransport> {
        let requester = RetryingRequester::new(transport.clone()).with_policy(RetryPolicy::no_retry());
        LayerClient::new(Arc::new(requester), Arc::new(config))
    }

    fn first_body(transport: &ScriptedTransport) -> RequestBody {
        transport
            .requests()
            .into_iter()
            .next()
            .map(|request| request.body().clone())
            .unwrap_or_default()
    }

    #[fixture]
    fn transport() -> ScriptedTransport {
        ScriptedTransport::new()
    }

    #[rstest]
    #[tokio::test]
    async fn create_posts_layer_name(transport: ScriptedTransport) {
        transport.push_json(json!({"status": "ok"}));
        client(&transport)
            .create("base")
            .await
            .unwrap_or_else(|err| panic!("create: {err}"));
        assert_eq!(
            first_body(&transport),
            RequestBody::Json(json!({"layer": {"name": "base"}}))
        );
    }

    #[rstest]
    #[tokio::test]
    async fn get_returns_first_match(transport: ScriptedTransport) {
        transport.push_json(json!({"layers": [{"name": "base", "size": 5, "created_at": null}]}));
        let layer = client(&transport)
            .get("base")
            .await
            .unwrap_or_else(|err| panic!("get: {err}"));
        assert_eq!(layer.map(|layer| layer.size), Some(Some(5)));
    }

    #[rstest]
    #[tokio::test]
    async fn modify_submits_read_write_sleep_job(transport: ScriptedTransport) {
        transport.push_json(json!({"jids": [12]}));
        transport.push_jobs(vec![job_json(12, "queued")]);

        let handle = client(&transport)
            .modify("base", &["data"], DEFAULT_MODIFY_RUNTIME)
            .await
            .unwrap_or_else(|err| panic!("modify: {err}"));

        assert_eq!(handle.job().jid, JobId::new(12));
        let RequestBody::Json(body) = first_body(&transport) else {
            panic!("expected JSON submit body");
        };
        let submitted = &body["jobs"][0];
        assert_eq!(submitted["cmd"], json!("sleep 3600"));
        assert_eq!(submitted["name"], json!("layer modify base"));
        assert_eq!(submitted["layer"], json!({"name": "base", "mount_rw": true}));
        assert_eq!(submitted["vol"], json!(["data"]));
        assert_eq!(submitted["tags"], json!({"system": "true"}));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn snapshot_signals_then_waits(transport: ScriptedTransport) {
        let keys = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let mut config = config();
        config.config_dir = keys.path().to_string_lossy().into_owned();
        transport.push_jobs(vec![job_with_port(12, 22, "10.0.0.9", 40022)]);
        transport.push_json(json!({"keys": [{"id": "key", "private_key": "PEM"}]}));
        transport.push_jobs(vec![job_json(12, "done")]);
        let runner = ScriptedRunner::new();
        runner.push_success();
        let shell = RemoteShell::new(&config, runner.clone());

        let handle = client_with(&transport, config)
            .modify_job(JobId::new(12))
            .await
            .unwrap_or_else(|err| panic!("modify_job: {err}"));
        let finished = handle
            .snapshot(&shell)
            .await
            .unwrap_or_else(|err| panic!("snapshot: {err}"));

        assert_eq!(finished.status, crate::job::JobStatus::Done);
        let command = runner
            .invocations()
            .pop()
            .map(|invocation| invocation.command_string())
            .unwrap_or_default();
        assert!(command.ends_with("multyvac@10.0.0.9 killall -10 python"), "{command}");
    }

    #[rstest]
    #[tokio::test]
    async fn abort_kills_job(transport: ScriptedTransport) {
        transport.push_jobs(vec![job_json(12, "processing")]);
        transport.push_json(json!({"status": "ok"}));

        let killed = client(&transport)
            .modify_job(JobId::new(12))
            .await
            .unwrap_or_else(|err| panic!("modify_job: {err}"))
            .abort()
            .await
            .unwrap_or_else(|err| panic!("abort: {err}"));

        assert!(killed);
    }
}
