//! SSH command execution and rsync transfers against running jobs.
//!
//! Jobs expose SSH through a NAT'd endpoint (see [`crate::job::OpenPort`]).
//! Host keys are ephemeral, so host key checking is disabled and known hosts
//! are discarded.

use std::ffi::OsString;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::info;

use crate::cancel::Cancellation;
use crate::config::MultyvacConfig;
use crate::error::ClientError;
use crate::job::OpenPort;
use crate::retry::uniform_jitter;

mod types;
mod util;

pub use types::{
    CommandFuture, CommandOutput, CommandRunner, InteractiveCommandRunner, ProcessCommandRunner,
    RemoteCommandOutput, SSH_USER, SshLogin,
};
pub use util::{expand_tilde, join_remote};

/// Attempts made by [`RemoteShell::sync`] when the connection is refused.
pub const SYNC_MAX_ATTEMPTS: u32 = 5;

/// Exit status ssh and rsync report for connection failures.
const CONNECTION_REFUSED_STATUS: i32 = 255;

/// Errors surfaced while running ssh or rsync.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SyncError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command completes with a non-zero exit code.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Command name used for the attempted operation.
        program: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// Raised when an endpoint without SSH login details is used for SSH.
    #[error("endpoint {address}:{port} is not an SSH endpoint")]
    NotSsh {
        /// Endpoint address.
        address: String,
        /// Endpoint port.
        port: u16,
    },
}

/// Runs ssh and rsync against job endpoints.
#[derive(Clone, Debug)]
pub struct RemoteShell<R: CommandRunner> {
    ssh_bin: String,
    rsync_bin: String,
    runner: R,
    cancellation: Cancellation,
    jitter: fn() -> f64,
}

impl RemoteShell<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    #[must_use]
    pub fn with_process_runner(config: &MultyvacConfig) -> Self {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> RemoteShell<R> {
    /// Creates a shell using the configured binaries and `runner`.
    #[must_use]
    pub fn new(config: &MultyvacConfig, runner: R) -> Self {
        Self {
            ssh_bin: config.ssh_bin.clone(),
            rsync_bin: config.rsync_bin.clone(),
            runner,
            cancellation: Cancellation::never(),
            jitter: uniform_jitter,
        }
    }

    /// Attaches a cancellation token observed between rsync attempts.
    #[must_use]
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Replaces the jitter source used between rsync attempts.
    #[cfg(any(test, feature = "test-backdoors"))]
    #[must_use]
    pub fn with_jitter(mut self, jitter: fn() -> f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Runs `command` inside the job and returns its output and exit code.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotSsh`] for endpoints without login details, or
    /// [`SyncError::Spawn`] when ssh cannot be started.
    ///
    /// # Security
    ///
    /// `command` is passed verbatim to the remote shell.
    pub async fn run_command(
        &self,
        endpoint: &OpenPort,
        command: &str,
    ) -> Result<RemoteCommandOutput, SyncError> {
        let mut args = self.ssh_args(endpoint, false)?;
        args.push(OsString::from(command));
        self.runner
            .run(&self.ssh_bin, &args)
            .await
            .map(RemoteCommandOutput::from)
    }

    /// Opens an interactive console with X11 forwarding. Use with
    /// [`InteractiveCommandRunner`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when ssh cannot be started.
    pub async fn open_console(
        &self,
        endpoint: &OpenPort,
    ) -> Result<RemoteCommandOutput, SyncError> {
        let args = self.ssh_args(endpoint, true)?;
        self.runner
            .run(&self.ssh_bin, &args)
            .await
            .map(RemoteCommandOutput::from)
    }

    /// Returns the program and arguments [`RemoteShell::open_console`]
    /// would run, for callers that manage the terminal themselves.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotSsh`] for endpoints without login details.
    pub fn console_command(&self, endpoint: &OpenPort) -> Result<Vec<String>, SyncError> {
        let args = self.ssh_args(endpoint, true)?;
        Ok(std::iter::once(self.ssh_bin.clone())
            .chain(args.iter().map(|arg| arg.to_string_lossy().into_owned()))
            .collect())
    }

    /// Copies local paths into `remote_path` inside the job.
    ///
    /// # Errors
    ///
    /// See [`RemoteShell::sync`].
    pub async fn sync_up(
        &self,
        endpoint: &OpenPort,
        local_paths: &[Utf8PathBuf],
        remote_path: &str,
    ) -> Result<(), ClientError> {
        let login = require_login(endpoint)?;
        let mut args: Vec<OsString> = local_paths
            .iter()
            .map(|path| OsString::from(expand_tilde(path.as_str())))
            .collect();
        args.push(OsString::from(remote_spec(endpoint, login, remote_path)));
        self.sync(endpoint.port, &login.identity_file, args).await
    }

    /// Copies `remote_path` from the job into `local_path`.
    ///
    /// # Errors
    ///
    /// See [`RemoteShell::sync`].
    pub async fn sync_down(
        &self,
        endpoint: &OpenPort,
        remote_path: &str,
        local_path: &Utf8Path,
    ) -> Result<(), ClientError> {
        let login = require_login(endpoint)?;
        let args = vec![
            OsString::from(remote_spec(endpoint, login, remote_path)),
            OsString::from(expand_tilde(local_path.as_str())),
        ];
        self.sync(endpoint.port, &login.identity_file, args).await
    }

    /// Runs `rsync -avz -L` over ssh with the given source and destination
    /// arguments. Connection refusals (exit status 255) are retried up to
    /// [`SYNC_MAX_ATTEMPTS`] times with `2^attempt × U(0,1)` second delays.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::CommandFailure`] for any other failure or once
    /// retries are exhausted, and [`ClientError::Cancelled`] when a retry
    /// sleep is cancelled.
    pub async fn sync(
        &self,
        port: u16,
        identity_file: &Utf8Path,
        paths: Vec<OsString>,
    ) -> Result<(), ClientError> {
        let mut args = vec![
            OsString::from("-avz"),
            OsString::from("-L"),
            OsString::from("-e"),
            OsString::from(self.rsync_remote_shell(port, identity_file)),
        ];
        args.extend(paths);

        let mut attempt: u32 = 0;
        loop {
            let output = self.runner.run(&self.rsync_bin, &args).await?;
            if output.is_success() {
                return Ok(());
            }

            attempt += 1;
            if output.code == Some(CONNECTION_REFUSED_STATUS) && attempt < SYNC_MAX_ATTEMPTS {
                let delay = Duration::from_secs(1_u64 << attempt).mul_f64((self.jitter)().clamp(0.0, 1.0));
                info!(
                    attempt,
                    delay_secs = delay.as_secs_f64(),
                    stderr = %output.stderr,
                    "sync failed, retrying"
                );
                self.cancellation.pause(delay).await?;
                continue;
            }

            info!(stderr = %output.stderr, "sync had error");
            let status_text = output
                .code
                .map_or_else(|| String::from("unknown"), |code| code.to_string());
            return Err(SyncError::CommandFailure {
                program: self.rsync_bin.clone(),
                status: output.code,
                status_text,
                stderr: output.stderr,
            }
            .into());
        }
    }

    fn ssh_args(&self, endpoint: &OpenPort, forward_x11: bool) -> Result<Vec<OsString>, SyncError> {
        let login = require_login(endpoint)?;
        let mut args = common_ssh_options(endpoint.port, &login.identity_file);
        if forward_x11 {
            args.push(OsString::from("-X"));
        }
        args.push(OsString::from(format!(
            "{}@{}",
            login.username, endpoint.address
        )));
        Ok(args)
    }

    fn rsync_remote_shell(&self, port: u16, identity_file: &Utf8Path) -> String {
        let opts = common_ssh_options(port, identity_file)
            .into_iter()
            .map(|arg| escape(arg.to_string_lossy()).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        format!("{} {opts}", self.ssh_bin)
    }
}

fn require_login(endpoint: &OpenPort) -> Result<&SshLogin, SyncError> {
    endpoint.ssh_login().ok_or_else(|| SyncError::NotSsh {
        address: endpoint.address.clone(),
        port: endpoint.port,
    })
}

fn remote_spec(endpoint: &OpenPort, login: &SshLogin, path: &str) -> String {
    format!("{}@{}:{path}", login.username, endpoint.address)
}

fn common_ssh_options(port: u16, identity_file: &Utf8Path) -> Vec<OsString> {
    vec![
        OsString::from("-o"),
        OsString::from("UserKnownHostsFile=/dev/null"),
        OsString::from("-o"),
        OsString::from("StrictHostKeyChecking=no"),
        OsString::from("-p"),
        OsString::from(port.to_string()),
        OsString::from("-i"),
        OsString::from(expand_tilde(identity_file.as_str())),
    ]
}
