//! Client library for the Multyvac batch compute service.
//!
//! [`Multyvac`] is the entry point: it owns the configuration and a retrying
//! HTTP requester and hands out resource clients for jobs, volumes, layers,
//! clusters, and API keys. Jobs are submitted as shell commands or opaque
//! serialized payloads, polled until they reach a status, and reached over
//! SSH for commands, consoles, and rsync transfers.

pub mod api_key;
pub mod cancel;
pub mod client;
pub mod cluster;
pub mod config;
pub mod credential_store;
pub mod error;
pub mod job;
pub mod layer;
pub mod resource;
pub mod retry;
pub mod ssh;
pub mod test_support;
pub mod transport;
pub mod volume;

pub use api_key::{ApiKey, ApiKeyClient, WebLogin};
pub use cancel::{CancelHandle, Cancellation};
pub use client::{Multyvac, on_multyvac};
pub use cluster::{Cluster, ClusterClient, ClusterRequest};
pub use config::{ConfigError, Credentials, MultyvacConfig};
pub use credential_store::{CredentialStore, CredentialStoreError, StoredCredentials};
pub use error::{ClientError, RequestError};
pub use job::{
    BatchOutcome, FunctionJob, Job, JobClient, JobId, JobQuery, JobResult, JobStatus, OpenPort,
    QueueStats, ShellJob, StatusSet, WaitOutcome,
};
pub use layer::{Layer, LayerClient, ModifyLayerJob};
pub use resource::{ContentClient, FileContents, FileEntry};
pub use retry::{RetryPolicy, RetryingRequester};
pub use ssh::{
    CommandFuture, CommandRunner, InteractiveCommandRunner, ProcessCommandRunner, RemoteShell,
    SshLogin, SyncError,
};
pub use transport::{ApiRequest, HttpTransport, Transport};
pub use volume::{NewVolume, Volume, VolumeClient};
