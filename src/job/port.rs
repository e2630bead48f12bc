//! Waiting for a job to open a network port.

use std::time::Duration;

use camino::Utf8PathBuf;
use tracing::{debug, info};

use crate::api_key::ApiKeyClient;
use crate::credential_store::{path_exists, write_private_key};
use crate::error::ClientError;
use crate::ssh::{CommandRunner, RemoteShell, SshLogin};
use crate::transport::Transport;

use super::{Job, JobClient, JobStatus, StatusSet, WaitOutcome};

/// Port checks made once the job is running.
pub const PORT_POLL_ATTEMPTS: u32 = 10;
/// Sleep between port checks.
pub const PORT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Externally reachable endpoint for a port opened by a job. The address and
/// port differ from the job-local port because of NAT.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OpenPort {
    /// Public address.
    pub address: String,
    /// Public port.
    pub port: u16,
    /// Login details; present only for port 22.
    pub login: Option<SshLogin>,
}

impl OpenPort {
    /// Returns the SSH login, when this endpoint is an SSH port.
    #[must_use]
    pub const fn ssh_login(&self) -> Option<&SshLogin> {
        self.login.as_ref()
    }
}

impl<T: Transport> JobClient<T> {
    /// Waits for `job` to start and open `port`.
    ///
    /// `timeout` bounds only the wait for the job to start. Once it is
    /// processing, the port map is checked up to [`PORT_POLL_ATTEMPTS`]
    /// times, [`PORT_POLL_INTERVAL`] apart. Returns `None` when the job ends
    /// or never opens the port.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when polling fails, or when port 22 opens but
    /// its identity file cannot be located or downloaded.
    pub async fn wait_for_open_port(
        &self,
        job: Job,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<Option<OpenPort>, ClientError> {
        let target = StatusSet::terminal().with(JobStatus::Processing);
        let WaitOutcome::Reached(mut current) = self.wait(job, target, timeout).await? else {
            return Ok(None);
        };

        let mut attempt = 1;
        while current.status == JobStatus::Processing {
            if let Some(endpoint) = current.tcp_port(port) {
                return self
                    .open_port(endpoint.address.clone(), endpoint.port, port)
                    .await
                    .map(Some);
            }
            if attempt >= PORT_POLL_ATTEMPTS {
                break;
            }
            debug!(jid = %current.jid, port, attempt, "port not open yet");
            self.requester().cancellation().pause(PORT_POLL_INTERVAL).await?;
            attempt += 1;
            current = self.refresh(&current).await?;
        }
        Ok(None)
    }

    /// Builds the interactive ssh invocation for `job`. Returns `None` when
    /// the snapshot is not running or has not opened its SSH port.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the identity file cannot be located or
    /// downloaded.
    pub async fn ssh_console_command<R: CommandRunner>(
        &self,
        job: &Job,
        shell: &RemoteShell<R>,
    ) -> Result<Option<Vec<String>>, ClientError> {
        if job.status != JobStatus::Processing {
            return Ok(None);
        }
        let Some(endpoint) = job.tcp_port(22) else {
            return Ok(None);
        };
        let open = self
            .open_port(endpoint.address.clone(), endpoint.port, 22)
            .await?;
        Ok(Some(shell.console_command(&open)?))
    }

    /// Makes sure the SSH private key for the configured API key is cached
    /// locally, downloading it from `/key` when missing. Returns its path.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] without an API key,
    /// [`ClientError::UnexpectedResponse`] when the service has no private
    /// key for it, or a credential store error when writing fails.
    pub async fn ensure_private_key(&self) -> Result<Utf8PathBuf, ClientError> {
        let path = self.config().private_key_path()?;
        if path_exists(&path)? {
            return Ok(path);
        }

        let api_key = self.config().auth()?.username;
        let private_key = ApiKeyClient::new(self.shared_requester())
            .get(&api_key, None)
            .await?
            .and_then(|key| key.private_key)
            .ok_or_else(|| {
                ClientError::unexpected("/key", format!("no private key available for {api_key}"))
            })?;
        write_private_key(&path, &private_key)?;
        info!(%path, "saved SSH private key");
        Ok(path)
    }

    async fn open_port(
        &self,
        address: String,
        public_port: u16,
        job_port: u16,
    ) -> Result<OpenPort, ClientError> {
        let login = if job_port == 22 {
            Some(SshLogin::new(self.ensure_private_key().await?))
        } else {
            None
        };
        Ok(OpenPort {
            address,
            port: public_port,
            login,
        })
    }
}
