//! Binary entry point for the Multyvac CLI.

use std::io::{self, Write};
use std::process;
use std::time::Duration;

use clap::Parser;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use multyvac::credential_store::{CredentialStore, StoredCredentials};
use multyvac::job::{BatchOutcome, Job, JobClient, JobId, QueueStats};
use multyvac::{ClientError, InteractiveCommandRunner, Multyvac, OpenPort, RemoteShell, Transport};

mod cli;

use cli::{Cli, ConfigureCommand, SshCommand, SshInfoCommand, WaitCommand};

/// Environment variable holding the tracing filter directives.
const LOG_ENV: &str = "MULTYVAC_LOG";

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("timed out waiting for jobs to finish")]
    WaitTimedOut,
    #[error("the service rejected the {0} request")]
    Rejected(&'static str),
    #[error("remote command terminated without an exit status")]
    MissingExitCode,
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli, &mut io::stdout()).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli, out: &mut impl Write) -> Result<i32, CliError> {
    match cli {
        Cli::Configure(args) => configure(&CredentialStore::new(), &args, out),
        Cli::Get(args) => {
            let jobs = connect()?.job();
            let job = fetch_job(&jobs, JobId::new(args.jid)).await?;
            write_job(out, &job)?;
            Ok(0)
        }
        Cli::Wait(args) => wait(&connect()?.job(), &args, out).await,
        Cli::Kill(args) => {
            let jids: Vec<JobId> = args.jids.into_iter().map(JobId::new).collect();
            ensure_accepted(connect()?.job().kill_many(&jids).await?, "kill")
        }
        Cli::KillAll => ensure_accepted(connect()?.job().kill_all().await?, "kill-all"),
        Cli::SshInfo(args) => ssh_info(&connect()?, &args, out).await,
        Cli::Ssh(args) => ssh(&connect()?, &args, out).await,
        Cli::QueueStats => {
            write_queue_stats(out, &connect()?.job().queue_stats().await?)?;
            Ok(0)
        }
    }
}

fn connect() -> Result<Multyvac, CliError> {
    Ok(Multyvac::from_env()?)
}

fn configure(
    store: &CredentialStore,
    args: &ConfigureCommand,
    out: &mut impl Write,
) -> Result<i32, CliError> {
    let credentials = StoredCredentials {
        api_key: &args.api_key,
        api_secret_key: &args.api_secret_key,
        api_url: args.api_url.as_deref(),
    };
    let path = store
        .write_credentials(credentials, args.force)
        .map_err(ClientError::from)?;
    writeln!(out, "saved credentials to {path}")?;
    Ok(0)
}

async fn fetch_job<T: Transport>(jobs: &JobClient<T>, jid: JobId) -> Result<Job, CliError> {
    jobs.get(jid)
        .await?
        .ok_or(CliError::Client(ClientError::JobNotFound { jid }))
}

async fn wait<T: Transport>(
    jobs: &JobClient<T>,
    args: &WaitCommand,
    out: &mut impl Write,
) -> Result<i32, CliError> {
    let timeout = args.timeout.map(Duration::from_secs);
    match jobs.wait_all(args.jids.iter().copied(), timeout).await? {
        BatchOutcome::Complete(finished) => {
            for job in &finished {
                writeln!(out, "{} {}", job.jid, job.status)?;
            }
            Ok(0)
        }
        BatchOutcome::Incomplete => Err(CliError::WaitTimedOut),
    }
}

async fn ssh_info<T: Transport>(
    client: &Multyvac<T>,
    args: &SshInfoCommand,
    out: &mut impl Write,
) -> Result<i32, CliError> {
    let jobs = client.job();
    let jid = JobId::new(args.jid);
    let job = fetch_job(&jobs, jid).await?;
    let timeout = args.timeout.map(Duration::from_secs);
    let endpoint = jobs
        .wait_for_open_port(job, args.port, timeout)
        .await?
        .ok_or(ClientError::PortNotOpened {
            jid,
            port: args.port,
        })?;
    write_endpoint(out, &endpoint)?;
    Ok(0)
}

async fn ssh<T: Transport>(
    client: &Multyvac<T>,
    args: &SshCommand,
    out: &mut impl Write,
) -> Result<i32, CliError> {
    validate_command_args(&args.command)?;
    let jobs = client.job();
    let jid = JobId::new(args.jid);
    let job = fetch_job(&jobs, jid).await?;

    if args.command.is_empty() {
        let endpoint = jobs
            .wait_for_open_port(job, 22, None)
            .await?
            .ok_or(ClientError::PortNotOpened { jid, port: 22 })?;
        let shell = RemoteShell::new(client.config(), InteractiveCommandRunner)
            .with_cancellation(client.requester().cancellation().clone());
        let output = shell
            .open_console(&endpoint)
            .await
            .map_err(ClientError::from)?;
        return output.exit_code.ok_or(CliError::MissingExitCode);
    }

    let remote_command = render_remote_command(&args.command);
    let output = jobs
        .run_command(&job, &remote_command, &client.remote_shell())
        .await?;
    write!(out, "{}", output.stdout)?;
    write!(io::stderr(), "{}", output.stderr)?;
    output.exit_code.ok_or(CliError::MissingExitCode)
}

fn ensure_accepted(accepted: bool, action: &'static str) -> Result<i32, CliError> {
    if accepted {
        Ok(0)
    } else {
        Err(CliError::Rejected(action))
    }
}

fn write_job(out: &mut impl Write, job: &Job) -> io::Result<()> {
    writeln!(out, "jid: {}", job.jid)?;
    writeln!(out, "status: {}", job.status)?;
    let optional = [
        ("name", job.name.clone()),
        ("cmd", job.cmd.clone()),
        ("core", job.core.clone()),
        ("created_at", job.created_at.map(|at| at.to_string())),
        ("started_at", job.started_at.map(|at| at.to_string())),
        ("finished_at", job.finished_at.map(|at| at.to_string())),
        ("runtime", job.runtime.map(|secs| format!("{secs}s"))),
        ("return_code", job.return_code.map(|code| code.to_string())),
    ];
    for (label, value) in optional {
        if let Some(text) = value {
            writeln!(out, "{label}: {text}")?;
        }
    }
    for (label, stream) in [("stdout", &job.stdout), ("stderr", &job.stderr)] {
        if let Some(text) = stream.as_deref().filter(|text| !text.is_empty()) {
            writeln!(out, "{label}:")?;
            writeln!(out, "{}", text.trim_end())?;
        }
    }
    Ok(())
}

fn write_endpoint(out: &mut impl Write, endpoint: &OpenPort) -> io::Result<()> {
    writeln!(out, "address: {}", endpoint.address)?;
    writeln!(out, "port: {}", endpoint.port)?;
    if let Some(login) = endpoint.ssh_login() {
        writeln!(out, "username: {}", login.username)?;
        writeln!(out, "identity_file: {}", login.identity_file)?;
    }
    Ok(())
}

fn write_queue_stats(out: &mut impl Write, stats: &QueueStats) -> io::Result<()> {
    for (name, value) in &stats.counters {
        writeln!(out, "{name}: {value}")?;
    }
    Ok(())
}

fn render_remote_command(args: &[String]) -> String {
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use multyvac::SshLogin;
    use multyvac::test_support::job_json;
    use ortho_config::ConfigDiscovery;
    use serde_json::json;
    use tempfile::TempDir;

    fn render(write: impl FnOnce(&mut Vec<u8>) -> io::Result<()>) -> String {
        let mut buf = Vec::new();
        write(&mut buf).unwrap_or_else(|err| panic!("write: {err}"));
        String::from_utf8(buf).unwrap_or_else(|err| panic!("utf8: {err}"))
    }

    #[test]
    fn validate_command_args_rejects_control_characters() {
        let err = validate_command_args(&[String::from("echo\tbad")]).err();

        assert!(
            matches!(err, Some(CliError::InvalidCommand(ref message)) if message.contains("control characters")),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn render_remote_command_escapes_arguments() {
        let args = vec![
            String::from("echo"),
            String::from("a b"),
            String::from("c'd"),
        ];

        assert_eq!(render_remote_command(&args), "echo 'a b' 'c'\\''d'");
    }

    #[test]
    fn write_job_skips_missing_fields() {
        let mut raw = job_json(7, "done");
        raw["stdout"] = json!("hello\n");
        let job: Job = serde_json::from_value(raw).unwrap_or_else(|err| panic!("decode: {err}"));

        let rendered = render(|buf| write_job(buf, &job));

        assert!(rendered.starts_with("jid: 7\nstatus: done\n"), "{rendered}");
        assert!(rendered.contains("stdout:\nhello\n"), "{rendered}");
        assert!(!rendered.contains("stderr:"), "{rendered}");
    }

    #[test]
    fn write_endpoint_includes_login_for_ssh() {
        let endpoint = OpenPort {
            address: String::from("10.0.0.5"),
            port: 2201,
            login: Some(SshLogin::new("/keys/k.key".into())),
        };

        let rendered = render(|buf| write_endpoint(buf, &endpoint));

        assert_eq!(
            rendered,
            "address: 10.0.0.5\nport: 2201\nusername: multyvac\nidentity_file: /keys/k.key\n"
        );
    }

    #[test]
    fn configure_reports_written_path() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = camino::Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non-UTF-8 temp path: {}", path.display()));
        let discovery = ConfigDiscovery::builder("multyvac")
            .env_var("MULTYVAC_CONFIG_PATH")
            .config_file_name("multyvac.toml")
            .dotfile_name(".multyvac.toml")
            .project_file_name("multyvac.toml")
            .clear_project_roots()
            .add_project_root(root.as_path())
            .build();
        let store = CredentialStore::with_discovery(discovery);
        let args = ConfigureCommand {
            api_key: String::from("key"),
            api_secret_key: String::from("secret"),
            api_url: None,
            force: false,
        };

        let mut buf = Vec::new();
        let code = configure(&store, &args, &mut buf).unwrap_or_else(|err| panic!("configure: {err}"));

        assert_eq!(code, 0);
        let rendered = String::from_utf8(buf).unwrap_or_else(|err| panic!("utf8: {err}"));
        assert!(rendered.starts_with("saved credentials to "), "{rendered}");
    }

    #[test]
    fn rejected_kill_is_an_error() {
        assert!(matches!(ensure_accepted(true, "kill"), Ok(0)));
        assert!(matches!(
            ensure_accepted(false, "kill"),
            Err(CliError::Rejected("kill"))
        ));
    }

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        write_error(&mut buf, &CliError::MissingExitCode);
        let rendered = String::from_utf8(buf).unwrap_or_else(|err| panic!("utf8: {err}"));
        assert!(
            rendered.contains("remote command terminated without an exit status"),
            "rendered: {rendered}"
        );
    }
}
