//! Command-line interface definitions for the `multyvac` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `multyvac` binary.
#[derive(Debug, Parser)]
#[command(
    name = "multyvac",
    about = "Inspect and control jobs on the Multyvac batch compute service",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Show one job.
    #[command(name = "get", about = "Show one job")]
    Get(JobArg),
    /// Wait for jobs to finish.
    #[command(name = "wait", about = "Wait for jobs to finish")]
    Wait(WaitCommand),
    /// Kill jobs.
    #[command(name = "kill", about = "Kill jobs")]
    Kill(JobsArg),
    /// Kill every job owned by the account.
    #[command(name = "kill-all", about = "Kill every job owned by the account")]
    KillAll,
    /// Wait for a job port and print its public endpoint.
    #[command(name = "ssh-info", about = "Wait for a job port and print its public endpoint")]
    SshInfo(SshInfoCommand),
    /// Open a console in a running job, or run a command there.
    #[command(name = "ssh", about = "Open a console in a running job, or run a command there")]
    Ssh(SshCommand),
    /// Show the account's queue counters.
    #[command(name = "queue-stats", about = "Show the account's queue counters")]
    QueueStats,
    /// Store API credentials in the configuration file.
    #[command(name = "configure", about = "Store API credentials in the configuration file")]
    Configure(ConfigureCommand),
}

/// A single job identifier.
#[derive(Debug, Args)]
pub(crate) struct JobArg {
    /// Job identifier.
    #[arg(value_name = "JID")]
    pub(crate) jid: u64,
}

/// One or more job identifiers.
#[derive(Debug, Args)]
pub(crate) struct JobsArg {
    /// Job identifiers.
    #[arg(value_name = "JID", required = true)]
    pub(crate) jids: Vec<u64>,
}

/// Arguments for `multyvac wait`.
#[derive(Debug, Args)]
pub(crate) struct WaitCommand {
    /// Job identifiers.
    #[arg(value_name = "JID", required = true)]
    pub(crate) jids: Vec<u64>,
    /// Give up after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub(crate) timeout: Option<u64>,
}

/// Arguments for `multyvac ssh-info`.
#[derive(Debug, Args)]
pub(crate) struct SshInfoCommand {
    /// Job identifier.
    #[arg(value_name = "JID")]
    pub(crate) jid: u64,
    /// Job-local port to wait for.
    #[arg(long, default_value_t = 22)]
    pub(crate) port: u16,
    /// Give up waiting for the job to start after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub(crate) timeout: Option<u64>,
}

/// Arguments for `multyvac ssh`.
#[derive(Debug, Args)]
pub(crate) struct SshCommand {
    /// Job identifier.
    #[arg(value_name = "JID")]
    pub(crate) jid: u64,
    /// Command to run inside the job (use -- to separate flags). Opens an
    /// interactive console when omitted.
    #[arg(last = true, value_name = "COMMAND")]
    pub(crate) command: Vec<String>,
}

/// Arguments for `multyvac configure`.
#[derive(Debug, Args)]
pub(crate) struct ConfigureCommand {
    /// Public API key.
    #[arg(long, value_name = "KEY")]
    pub(crate) api_key: String,
    /// Secret API key.
    #[arg(long, value_name = "SECRET")]
    pub(crate) api_secret_key: String,
    /// Override the API base URL.
    #[arg(long, value_name = "URL")]
    pub(crate) api_url: Option<String>,
    /// Replace an existing API key in configuration.
    #[arg(long)]
    pub(crate) force: bool,
}
