//! Top-level client tying configuration, transport, and resource clients
//! together.

use std::env;
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::api_key::ApiKeyClient;
use crate::cluster::ClusterClient;
use crate::config::MultyvacConfig;
use crate::error::ClientError;
use crate::job::JobClient;
use crate::layer::LayerClient;
use crate::retry::RetryingRequester;
use crate::ssh::{ProcessCommandRunner, RemoteShell};
use crate::transport::{HttpTransport, Transport};
use crate::volume::VolumeClient;

/// Environment variable set inside jobs running on Multyvac.
pub const ON_MULTYVAC_ENV: &str = "ON_MULTYVAC";

/// Entry point for the Multyvac API.
///
/// Cloning is cheap; clones share the requester and configuration.
#[derive(Debug)]
pub struct Multyvac<T = HttpTransport> {
    requester: Arc<RetryingRequester<T>>,
    config: Arc<MultyvacConfig>,
}

impl<T> Clone for Multyvac<T> {
    fn clone(&self) -> Self {
        Self {
            requester: Arc::clone(&self.requester),
            config: Arc::clone(&self.config),
        }
    }
}

impl Multyvac<HttpTransport> {
    /// Builds a client that talks HTTP to `config.api_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] when the configuration is invalid, or
    /// [`ClientError::Connection`] when the HTTP client cannot be built.
    pub fn new(config: MultyvacConfig) -> Result<Self, ClientError> {
        let transport = HttpTransport::new(config.clone())?;
        Ok(Self::with_transport(config, transport))
    }

    /// Loads configuration from files and `MULTYVAC_*` environment
    /// variables, then builds an HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] when loading or validation fails.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(MultyvacConfig::load_without_cli_args()?)
    }
}

impl<T: Transport> Multyvac<T> {
    /// Builds a client over `transport` with the default retry policy.
    #[must_use]
    pub fn with_transport(config: MultyvacConfig, transport: T) -> Self {
        Self::with_requester(config, RetryingRequester::new(transport))
    }

    /// Builds a client over a pre-configured requester, for custom retry
    /// policies or cancellation.
    #[must_use]
    pub fn with_requester(config: MultyvacConfig, requester: RetryingRequester<T>) -> Self {
        Self {
            requester: Arc::new(requester),
            config: Arc::new(config),
        }
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &MultyvacConfig {
        &self.config
    }

    /// Returns the shared requester.
    #[must_use]
    pub fn requester(&self) -> &RetryingRequester<T> {
        &self.requester
    }

    /// Returns the job client.
    #[must_use]
    pub fn job(&self) -> JobClient<T> {
        JobClient::new(Arc::clone(&self.requester), Arc::clone(&self.config))
    }

    /// Returns the volume client.
    #[must_use]
    pub fn volume(&self) -> VolumeClient<T> {
        VolumeClient::new(Arc::clone(&self.requester), Arc::clone(&self.config))
    }

    /// Returns the layer client.
    #[must_use]
    pub fn layer(&self) -> LayerClient<T> {
        LayerClient::new(Arc::clone(&self.requester), Arc::clone(&self.config))
    }

    /// Returns the cluster client.
    #[must_use]
    pub fn cluster(&self) -> ClusterClient<T> {
        ClusterClient::new(Arc::clone(&self.requester))
    }

    /// Returns the API key client.
    #[must_use]
    pub fn api_key(&self) -> ApiKeyClient<T> {
        ApiKeyClient::new(Arc::clone(&self.requester))
    }

    /// Returns a remote shell that spawns the configured ssh and rsync
    /// binaries and honours this client's cancellation.
    #[must_use]
    pub fn remote_shell(&self) -> RemoteShell<ProcessCommandRunner> {
        RemoteShell::with_process_runner(&self.config)
            .with_cancellation(self.requester.cancellation().clone())
    }

    /// Makes sure the SSH private key for the configured API key is cached
    /// locally, downloading it when missing. Returns its path.
    ///
    /// # Errors
    ///
    /// See [`JobClient::ensure_private_key`].
    pub async fn ensure_private_key(&self) -> Result<Utf8PathBuf, ClientError> {
        self.job().ensure_private_key().await
    }
}

/// Returns `true` when running inside a Multyvac job.
#[must_use]
pub fn on_multyvac() -> bool {
    env::var(ON_MULTYVAC_ENV).is_ok_and(|value| value == "true")
}
