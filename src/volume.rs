//! Volumes: named persistent storage mounted into jobs.
//!
//! Besides the content endpoints shared with layers, volumes support bulk
//! rsync transfers. A sync starts a short-lived system job that mounts the
//! volume, rsyncs over its SSH port, and is always killed afterwards.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::config::MultyvacConfig;
use crate::error::ClientError;
use crate::job::{Job, JobClient, JobId, ShellJob, StatusResponse, deserialize_timestamp};
use crate::resource::{ContentClient, ResourceKind};
use crate::retry::RetryingRequester;
use crate::ssh::{CommandRunner, RemoteShell, join_remote};
use crate::transport::{ApiRequest, Transport};

/// Command run by the helper job that serves rsync.
pub const SYNC_JOB_COMMAND: &str = "python /usr/local/lib/python2.7/dist-packages/multyvacinit/sync.py";

/// A named persistent storage area.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Volume {
    /// Unique volume name.
    pub name: String,
    /// Where jobs see the volume mounted.
    pub mount_path: String,
    /// Mount type; currently always `bind`.
    pub mount_type: Option<String>,
    /// Creation time (UTC).
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub created_at: Option<NaiveDateTime>,
    /// Size in bytes.
    pub size: Option<u64>,
    /// Free-form description.
    pub description: Option<String>,
}

/// Parameters for [`VolumeClient::create`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NewVolume {
    /// Unique volume name.
    pub name: String,
    /// Where jobs will see the volume mounted.
    pub mount_path: String,
    /// Mount type; the service defaults to `bind`.
    pub mount_type: Option<String>,
    /// Free-form description.
    pub description: Option<String>,
}

impl NewVolume {
    fn to_json(&self) -> Value {
        let mut volume = Map::new();
        volume.insert(String::from("name"), Value::from(self.name.clone()));
        volume.insert(String::from("mount_path"), Value::from(self.mount_path.clone()));
        if let Some(mount_type) = &self.mount_type {
            volume.insert(String::from("mount_type"), Value::from(mount_type.clone()));
        }
        if let Some(description) = &self.description {
            volume.insert(String::from("description"), Value::from(description.clone()));
        }
        json!({ "volume": volume })
    }
}

#[derive(Deserialize)]
struct VolumesResponse {
    volumes: Vec<Volume>,
}

/// Client for the `/volume` endpoints.
#[derive(Debug)]
pub struct VolumeClient<T> {
    requester: Arc<RetryingRequester<T>>,
    jobs: JobClient<T>,
}

impl<T> Clone for VolumeClient<T> {
    fn clone(&self) -> Self {
        Self {
            requester: Arc::clone(&self.requester),
            jobs: self.jobs.clone(),
        }
    }
}

impl<T: Transport> VolumeClient<T> {
    /// Builds a volume client sharing `requester`.
    #[must_use]
    pub fn new(requester: Arc<RetryingRequester<T>>, config: Arc<MultyvacConfig>) -> Self {
        Self {
            jobs: JobClient::new(Arc::clone(&requester), config),
            requester,
        }
    }

    /// Lists volumes, restricted to `names` when non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn list(&self, names: &[&str]) -> Result<Vec<Volume>, ClientError> {
        let request = ApiRequest::get("/volume").query_all("name", names);
        let response: VolumesResponse = self.requester.send_as(&request).await?;
        Ok(response.volumes)
    }

    /// Fetches one volume by name.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn get(&self, name: &str) -> Result<Option<Volume>, ClientError> {
        Ok(self.list(&[name]).await?.into_iter().next())
    }

    /// Creates a volume. Returns `true` when the service acknowledged it.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails, for example because
    /// the name is taken.
    pub async fn create(&self, volume: &NewVolume) -> Result<bool, ClientError> {
        let request = ApiRequest::post("/volume").json(volume.to_json());
        let response: StatusResponse = self.requester.send_as(&request).await?;
        Ok(response.is_ok())
    }

    /// Returns a client for the files inside `name`.
    #[must_use]
    pub fn contents(&self, name: &str) -> ContentClient<T> {
        ContentClient::new(Arc::clone(&self.requester), ResourceKind::Volume, name)
    }

    /// Copies `local_paths` into `remote_path`, relative to the volume root.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AbsoluteRemotePath`] for paths starting with
    /// `/`, [`ClientError::PortNotOpened`] when the helper job never serves
    /// SSH, or any rsync failure.
    pub async fn sync_up<R: CommandRunner>(
        &self,
        volume: &Volume,
        local_paths: &[Utf8PathBuf],
        remote_path: &str,
        shell: &RemoteShell<R>,
    ) -> Result<(), ClientError> {
        ensure_relative(remote_path)?;
        let job = self
            .start_sync_job(volume, format!("volume sync up to {}", volume.name))
            .await?;
        let outcome = async {
            let endpoint = self.jobs.require_ssh(&job).await?;
            info!(
                volume = %volume.name,
                remote_path,
                paths = local_paths.len(),
                "syncing up"
            );
            shell
                .sync_up(&endpoint, local_paths, &join_remote(&volume.mount_path, remote_path))
                .await
        }
        .await;
        self.finish_sync_job(job.jid, outcome).await
    }

    /// Copies `remote_path`, relative to the volume root, into `local_path`.
    ///
    /// # Errors
    ///
    /// See [`VolumeClient::sync_up`].
    pub async fn sync_down<R: CommandRunner>(
        &self,
        volume: &Volume,
        remote_path: &str,
        local_path: &Utf8Path,
        shell: &RemoteShell<R>,
    ) -> Result<(), ClientError> {
        ensure_relative(remote_path)?;
        let job = self
            .start_sync_job(volume, format!("volume sync down from {}", volume.name))
            .await?;
        let outcome = async {
            let endpoint = self.jobs.require_ssh(&job).await?;
            info!(volume = %volume.name, remote_path, %local_path, "syncing down");
            shell
                .sync_down(&endpoint, &join_remote(&volume.mount_path, remote_path), local_path)
                .await
        }
        .await;
        self.finish_sync_job(job.jid, outcome).await
    }

    async fn start_sync_job(&self, volume: &Volume, name: String) -> Result<Job, ClientError> {
        let spec = ShellJob::new(SYNC_JOB_COMMAND)
            .name(name)
            .volume(volume.name.clone())
            .tag("system", "true");
        let jid = self.jobs.shell_submit(&spec).await?;
        self.jobs
            .get(jid)
            .await?
            .ok_or(ClientError::JobNotFound { jid })
    }

    async fn finish_sync_job(
        &self,
        jid: JobId,
        outcome: Result<(), ClientError>,
    ) -> Result<(), ClientError> {
        let killed = self.jobs.kill(jid).await;
        match (outcome, killed) {
            (Err(err), Err(kill_err)) => {
                warn!(%jid, error = %kill_err, "failed to kill sync job");
                Err(err)
            }
            (Err(err), Ok(_)) => Err(err),
            (Ok(()), Err(kill_err)) => Err(kill_err),
            (Ok(()), Ok(_)) => Ok(()),
        }
    }
}

fn ensure_relative(remote_path: &str) -> Result<(), ClientError> {
    if remote_path.starts_with('/') {
        return Err(ClientError::AbsoluteRemotePath {
            path: remote_path.to_owned(),
        });
    }
    Ok(())
}
