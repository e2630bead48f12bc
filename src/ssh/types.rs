//! Command runner abstraction and SSH value types.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use camino::Utf8PathBuf;
use tokio::process::Command;

use super::SyncError;

/// Username every job accepts SSH logins for.
pub const SSH_USER: &str = "multyvac";

/// Credentials for logging into a job over SSH.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshLogin {
    /// Remote username; always [`SSH_USER`].
    pub username: String,
    /// Private key matching the account's API key.
    pub identity_file: Utf8PathBuf,
}

impl SshLogin {
    /// Builds a login for the standard job user.
    #[must_use]
    pub fn new(identity_file: Utf8PathBuf) -> Self {
        Self {
            username: SSH_USER.to_owned(),
            identity_file,
        }
    }
}

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Output of a command run inside a job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCommandOutput {
    /// Exit code of the remote command; `None` if ssh was killed.
    pub exit_code: Option<i32>,
    /// Remote standard output.
    pub stdout: String,
    /// Remote standard error.
    pub stderr: String,
}

impl From<CommandOutput> for RemoteCommandOutput {
    fn from(value: CommandOutput) -> Self {
        Self {
            exit_code: value.code,
            stdout: value.stdout,
            stderr: value.stderr,
        }
    }
}

/// Future returned by [`CommandRunner::run`].
pub type CommandFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, SyncError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with the given arguments.
    ///
    /// # Errors
    ///
    /// The future resolves to [`SyncError::Spawn`] if the command cannot be
    /// started.
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> CommandFuture<'a>;
}

/// Runner that captures stdout and stderr. The child is killed if the
/// returned future is dropped.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> CommandFuture<'a> {
        Box::pin(async move {
            let output = Command::new(program)
                .args(args)
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|err| spawn_error(program, &err))?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// Runner that attaches the child to the current terminal, for interactive
/// SSH consoles. Output is not captured.
#[derive(Clone, Debug, Default)]
pub struct InteractiveCommandRunner;

impl CommandRunner for InteractiveCommandRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> CommandFuture<'a> {
        Box::pin(async move {
            let status = Command::new(program)
                .args(args)
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .await
                .map_err(|err| spawn_error(program, &err))?;

            Ok(CommandOutput {
                code: status.code(),
                stdout: String::new(),
                stderr: String::new(),
            })
        })
    }
}

fn spawn_error(program: &str, err: &std::io::Error) -> SyncError {
    SyncError::Spawn {
        program: program.to_owned(),
        message: err.to_string(),
    }
}
