//! Configuration loading via `ortho-config`.

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::ssh::expand_tilde;

/// Base URL of the public Multyvac API.
pub const DEFAULT_API_URL: &str = "https://api.multyvac.com";

/// Directory holding per-domain SSH private keys.
pub const DEFAULT_CONFIG_DIR: &str = "~/.multyvac";

/// Client configuration derived from environment variables, configuration
/// files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "MULTYVAC",
    discovery(
        app_name = "multyvac",
        env_var = "MULTYVAC_CONFIG_PATH",
        config_file_name = "multyvac.toml",
        dotfile_name = ".multyvac.toml",
        project_file_name = "multyvac.toml"
    )
)]
pub struct MultyvacConfig {
    /// Public half of the API credentials. Required for every request.
    pub api_key: Option<String>,
    /// Secret half of the API credentials.
    pub api_secret_key: Option<String>,
    /// Base URL for API requests. Defaults to the public service.
    #[ortho_config(default = DEFAULT_API_URL.to_owned())]
    pub api_url: String,
    /// Directory where SSH private keys are cached, one subdirectory per API
    /// domain. Supports a leading `~/`.
    #[ortho_config(default = DEFAULT_CONFIG_DIR.to_owned())]
    pub config_dir: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `rsync` executable.
    #[ortho_config(default = "rsync".to_owned())]
    pub rsync_bin: String,
}

/// Basic-auth credential pair attached to API requests.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Credentials {
    /// Username part; the API key for regular calls.
    pub username: String,
    /// Password part; the secret key for regular calls.
    pub password: Option<String>,
}

impl Credentials {
    /// Builds a credential pair.
    #[must_use]
    pub fn new(username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to multyvac.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

const API_KEY: FieldMetadata = FieldMetadata::new("API key", "MULTYVAC_API_KEY", "api_key");
const API_URL: FieldMetadata = FieldMetadata::new("API URL", "MULTYVAC_API_URL", "api_url");
const CONFIG_DIR: FieldMetadata =
    FieldMetadata::new("config directory", "MULTYVAC_CONFIG_DIR", "config_dir");
const SSH_BIN: FieldMetadata = FieldMetadata::new("ssh binary", "MULTYVAC_SSH_BIN", "ssh_bin");
const RSYNC_BIN: FieldMetadata =
    FieldMetadata::new("rsync binary", "MULTYVAC_RSYNC_BIN", "rsync_bin");

impl MultyvacConfig {
    /// Builds a configuration pointing at `api_url` with the given
    /// credentials and default tool settings.
    #[must_use]
    pub fn with_credentials(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret_key: impl Into<String>,
    ) -> Self {
        Self {
            api_key: Some(api_key.into()),
            api_secret_key: Some(api_secret_key.into()),
            api_url: api_url.into(),
            config_dir: DEFAULT_CONFIG_DIR.to_owned(),
            ssh_bin: String::from("ssh"),
            rsync_bin: String::from("rsync"),
        }
    }

    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags in
    /// that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("multyvac")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Credentials stay optional here because
    /// some calls override them; [`MultyvacConfig::auth`] enforces them.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a field is blank.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, metadata) in [
            (self.api_url.as_str(), &API_URL),
            (self.config_dir.as_str(), &CONFIG_DIR),
            (self.ssh_bin.as_str(), &SSH_BIN),
            (self.rsync_bin.as_str(), &RSYNC_BIN),
        ] {
            if value.trim().is_empty() {
                return Err(metadata.missing());
            }
        }
        if let Some(key) = self.api_key.as_deref()
            && key.trim().is_empty()
        {
            return Err(API_KEY.missing());
        }
        Ok(())
    }

    /// Returns the credential pair for authenticated requests.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingCredentials`] when no API key is set.
    pub fn auth(&self) -> Result<Credentials, ConfigError> {
        let key = self
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::MissingCredentials)?;
        Ok(Credentials::new(key, self.api_secret_key.clone()))
    }

    /// Returns the host part of the API URL, used to namespace cached keys.
    #[must_use]
    pub fn api_domain(&self) -> &str {
        let without_scheme = self
            .api_url
            .split_once("://")
            .map_or(self.api_url.as_str(), |(_, rest)| rest);
        without_scheme
            .split(['/', ':'])
            .next()
            .unwrap_or(without_scheme)
    }

    /// Returns `<config_dir>/<api domain>/<api_key>.key`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingCredentials`] when no API key is set.
    pub fn private_key_path(&self) -> Result<Utf8PathBuf, ConfigError> {
        let credentials = self.auth()?;
        let mut path = Utf8PathBuf::from(expand_tilde(&self.config_dir));
        path.push(self.api_domain());
        path.push(format!("{}.key", credentials.username));
        Ok(path)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Raised when a request needs credentials and none are configured.
    #[error("Api Key is not set: set MULTYVAC_API_KEY or run `multyvac configure`")]
    MissingCredentials,
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
