//! Error types shared by every Multyvac client operation.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::credential_store::CredentialStoreError;
use crate::job::{JobId, JobStatus};
use crate::ssh::SyncError;

/// HTTP status the service uses to signal rate limiting.
pub const RATE_LIMITED_STATUS: u16 = 429;

/// Error reported by the service, or synthesised from a malformed response.
///
/// The `code`, `message`, and `hint` are preserved verbatim from the server
/// so callers can surface them unchanged.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error(
    "{message} (code: {}, hint: {})",
    .code.as_deref().unwrap_or("none"),
    .hint.as_deref().unwrap_or("none")
)]
pub struct RequestError {
    /// HTTP status of the failed response.
    pub http_status: u16,
    /// Service specific error code, when one was supplied.
    pub code: Option<String>,
    /// Human readable description of the failure.
    pub message: String,
    /// Optional guidance for resolving the failure.
    pub hint: Option<String>,
    /// Whether the service asserted the request is safe to repeat.
    pub retry: bool,
}

impl RequestError {
    /// Returns `true` when the service rejected the request for rate limiting.
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        self.http_status == RATE_LIMITED_STATUS
    }
}

/// Errors raised by the Multyvac client.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ClientError {
    /// Raised when credentials or settings are missing or invalid. Never
    /// retried.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Raised when the HTTP exchange itself failed (connect, timeout, body
    /// read). Always retry-safe.
    #[error("connection error: {message}")]
    Connection {
        /// Message reported by the HTTP client.
        message: String,
    },
    /// Raised when the request could not be assembled locally.
    #[error("invalid request for {path}: {message}")]
    InvalidRequest {
        /// Endpoint path of the request.
        path: String,
        /// Description of the problem.
        message: String,
    },
    /// Raised when the service reported an error or answered with an
    /// unparseable body.
    #[error("request failed with HTTP {}: {0}", .0.http_status)]
    Request(#[from] RequestError),
    /// Raised when a successful response does not match the expected schema.
    #[error("unexpected response from {context}: {message}")]
    UnexpectedResponse {
        /// Endpoint or operation that produced the response.
        context: String,
        /// Description of the mismatch.
        message: String,
    },
    /// Raised when a requested job is missing from a service response.
    #[error("job {jid} not found")]
    JobNotFound {
        /// Identifier of the missing job.
        jid: JobId,
    },
    /// Raised when a job finished without producing a result.
    #[error("job {jid} finished with status {status}: {stderr}")]
    JobFailed {
        /// Identifier of the job.
        jid: JobId,
        /// Terminal status reported by the service.
        status: JobStatus,
        /// Captured standard error, if any.
        stderr: String,
    },
    /// Raised when a job never opened a port it was expected to open.
    #[error("job {jid} did not open port {port}")]
    PortNotOpened {
        /// Identifier of the job.
        jid: JobId,
        /// Port that was awaited.
        port: u16,
    },
    /// Raised when a remote volume or layer path is not relative.
    #[error("remote path {path} must be relative")]
    AbsoluteRemotePath {
        /// Offending path.
        path: String,
    },
    /// Raised when a local file cannot be read or written.
    #[error("failed to access {path}: {message}")]
    LocalFile {
        /// Local path involved.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when ssh or rsync fails.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
    /// Raised when local credential files cannot be read or written.
    #[error("credential store error: {0}")]
    CredentialStore(#[from] CredentialStoreError),
    /// Raised when the caller cancelled an in-flight wait or retry.
    #[error("operation cancelled")]
    Cancelled,
}

impl ClientError {
    /// Returns `true` when the retry loop may repeat the failed request.
    ///
    /// Connection failures are always retry-safe; service errors are only
    /// retried when the service says so.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Request(err) => err.retry,
            _ => false,
        }
    }

    /// Returns the underlying service error when the request was rate
    /// limited.
    #[must_use]
    pub const fn rate_limited(&self) -> Option<&RequestError> {
        match self {
            Self::Request(err) if err.is_rate_limited() => Some(err),
            _ => None,
        }
    }

    pub(crate) fn unexpected(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnexpectedResponse {
            context: context.into(),
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(value: reqwest::Error) -> Self {
        Self::Connection {
            message: value.to_string(),
        }
    }
}
