//! Persists API credentials into `multyvac.toml` and caches SSH private
//! keys on disk.
//!
//! The target file follows `OrthoConfig`'s discovery search order: the first
//! existing candidate is updated, otherwise the last candidate is created.
//! Credentials are written as top-level keys so [`crate::MultyvacConfig`]
//! reads them back unchanged.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::{ConfigDiscovery, toml};
use thiserror::Error;
use tracing::debug;

const APP_NAME: &str = "multyvac";
const CONFIG_ENV_VAR: &str = "MULTYVAC_CONFIG_PATH";
const CONFIG_FILE_NAME: &str = "multyvac.toml";
const DOTFILE_NAME: &str = ".multyvac.toml";
const PROJECT_FILE_NAME: &str = "multyvac.toml";
const API_KEY: &str = "api_key";
const API_SECRET_KEY: &str = "api_secret_key";
const API_URL: &str = "api_url";

/// Errors raised while persisting credentials or keys.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CredentialStoreError {
    /// Raised when no configuration candidates are available.
    #[error("no configuration file candidates were discovered")]
    NoCandidates,
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when parsing existing TOML content fails.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when existing TOML has an unexpected structure.
    #[error("invalid configuration in {path}: {message}")]
    InvalidStructure {
        /// Path that had invalid content.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when an API key is already configured and overwrite is
    /// disabled.
    #[error("API key already configured as {api_key}; rerun with --force to replace it")]
    KeyAlreadyConfigured {
        /// API key already present in configuration.
        api_key: String,
    },
}

/// Credentials to persist.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StoredCredentials<'a> {
    /// Public API key.
    pub api_key: &'a str,
    /// Secret API key.
    pub api_secret_key: &'a str,
    /// API endpoint; left untouched when `None`.
    pub api_url: Option<&'a str>,
}

/// Updates `multyvac.toml` using `OrthoConfig`'s discovery search order.
#[derive(Clone, Debug)]
pub struct CredentialStore {
    discovery: ConfigDiscovery,
}

impl CredentialStore {
    /// Builds a store using the standard discovery settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            discovery: ConfigDiscovery::builder(APP_NAME)
                .env_var(CONFIG_ENV_VAR)
                .config_file_name(CONFIG_FILE_NAME)
                .dotfile_name(DOTFILE_NAME)
                .project_file_name(PROJECT_FILE_NAME)
                .build(),
        }
    }

    /// Builds a store using an explicit discovery configuration.
    #[must_use]
    pub const fn with_discovery(discovery: ConfigDiscovery) -> Self {
        Self { discovery }
    }

    /// Returns the API key currently stored, if any.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialStoreError`] when the file cannot be read or
    /// parsed.
    pub fn current_api_key(&self) -> Result<Option<String>, CredentialStoreError> {
        let target = self.resolve_target()?;
        if !target.exists {
            return Ok(None);
        }
        let contents = read_text(&target.path)?;
        let value = parse_toml(&target.path, &contents)?;
        read_string(&target.path, &value, API_KEY)
    }

    /// Writes `credentials` and returns the path of the updated file.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialStoreError::KeyAlreadyConfigured`] when a
    /// different key is stored and `force` is false, or an I/O or parse
    /// error.
    pub fn write_credentials(
        &self,
        credentials: StoredCredentials<'_>,
        force: bool,
    ) -> Result<Utf8PathBuf, CredentialStoreError> {
        let target = self.resolve_target()?;
        let contents = if target.exists {
            read_text(&target.path)?
        } else {
            String::new()
        };

        let mut value = parse_toml(&target.path, &contents)?;
        if let Some(existing) = read_string(&target.path, &value, API_KEY)?
            && existing != credentials.api_key.trim()
            && !force
        {
            return Err(CredentialStoreError::KeyAlreadyConfigured { api_key: existing });
        }

        let table = root_table(&target.path, &mut value)?;
        table.insert(
            String::from(API_KEY),
            toml::Value::String(credentials.api_key.trim().to_owned()),
        );
        table.insert(
            String::from(API_SECRET_KEY),
            toml::Value::String(credentials.api_secret_key.trim().to_owned()),
        );
        if let Some(url) = credentials.api_url {
            table.insert(String::from(API_URL), toml::Value::String(url.trim().to_owned()));
        }

        let rendered = toml::to_string_pretty(&value).map_err(|err| CredentialStoreError::Parse {
            path: target.path.clone(),
            message: err.to_string(),
        })?;
        write_file(&target.path, rendered.as_bytes())?;
        debug!(path = %target.path, "stored credentials");
        Ok(target.path)
    }

    fn resolve_target(&self) -> Result<ConfigTarget, CredentialStoreError> {
        let candidates = self.discovery.utf8_candidates();
        if candidates.is_empty() {
            return Err(CredentialStoreError::NoCandidates);
        }

        for candidate in &candidates {
            if path_exists(candidate)? {
                return Ok(ConfigTarget {
                    path: candidate.clone(),
                    exists: true,
                });
            }
        }

        let fallback = candidates
            .last()
            .cloned()
            .ok_or(CredentialStoreError::NoCandidates)?;
        Ok(ConfigTarget {
            path: fallback,
            exists: false,
        })
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns `true` when a file exists at `path`.
///
/// # Errors
///
/// Returns [`CredentialStoreError::Io`] when the parent directory cannot be
/// inspected.
pub fn path_exists(path: &Utf8Path) -> Result<bool, CredentialStoreError> {
    let (parent, file_name) = split_path(path)?;
    match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir
            .try_exists(file_name)
            .map_err(|err| io_error(path, &err)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_error(parent, &err)),
    }
}

/// Writes an SSH private key readable only by the owner, creating parent
/// directories as needed.
///
/// # Errors
///
/// Returns [`CredentialStoreError::Io`] when the key cannot be written.
pub fn write_private_key(path: &Utf8Path, contents: &str) -> Result<(), CredentialStoreError> {
    write_file(path, contents.as_bytes())?;
    restrict_to_owner(path)?;
    debug!(%path, "stored private key");
    Ok(())
}

#[cfg(unix)]
fn restrict_to_owner(path: &Utf8Path) -> Result<(), CredentialStoreError> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|err| io_error(path, &err))
}

#[cfg(not(unix))]
const fn restrict_to_owner(_path: &Utf8Path) -> Result<(), CredentialStoreError> {
    Ok(())
}

#[derive(Clone, Debug)]
struct ConfigTarget {
    path: Utf8PathBuf,
    exists: bool,
}

fn split_path(path: &Utf8Path) -> Result<(&Utf8Path, &str), CredentialStoreError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| CredentialStoreError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("path is missing a filename"),
        })?;
    Ok((parent, file_name))
}

fn io_error(path: &Utf8Path, err: &io::Error) -> CredentialStoreError {
    CredentialStoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn read_text(path: &Utf8Path) -> Result<String, CredentialStoreError> {
    let (parent, file_name) = split_path(path)?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    dir.read_to_string(file_name)
        .map_err(|err| io_error(path, &err))
}

fn write_file(path: &Utf8Path, contents: &[u8]) -> Result<(), CredentialStoreError> {
    let (parent, file_name) = split_path(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    dir.write(file_name, contents)
        .map_err(|err| io_error(path, &err))
}

fn parse_toml(path: &Utf8Path, contents: &str) -> Result<toml::Value, CredentialStoreError> {
    if contents.trim().is_empty() {
        return Ok(toml::Value::Table(toml::value::Table::new()));
    }

    toml::from_str(contents).map_err(|err| CredentialStoreError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn root_table<'a>(
    path: &Utf8Path,
    value: &'a mut toml::Value,
) -> Result<&'a mut toml::value::Table, CredentialStoreError> {
    value
        .as_table_mut()
        .ok_or_else(|| CredentialStoreError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("configuration root is not a table"),
        })
}

fn read_string(
    path: &Utf8Path,
    value: &toml::Value,
    key: &str,
) -> Result<Option<String>, CredentialStoreError> {
    let table = value
        .as_table()
        .ok_or_else(|| CredentialStoreError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("configuration root is not a table"),
        })?;

    table.get(key).map_or(Ok(None), |raw| {
        raw.as_str()
            .map(|text| Some(text.trim().to_owned()))
            .ok_or_else(|| CredentialStoreError::InvalidStructure {
                path: path.to_path_buf(),
                message: format!("{key} must be a string"),
            })
    })
}
