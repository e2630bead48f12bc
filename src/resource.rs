//! File operations shared by volumes and layers.
//!
//! Both resources expose the same content endpoints under
//! `/{kind}/{name}`; [`ContentClient`] implements them once.

use std::fmt;
use std::io;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Deserialize;
use tracing::debug;

use crate::error::ClientError;
use crate::job::StatusResponse;
use crate::retry::RetryingRequester;
use crate::transport::{ApiRequest, Transport};

/// Resource family a [`ContentClient`] addresses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResourceKind {
    /// Persistent storage mounted into jobs.
    Volume,
    /// Filesystem image jobs run on.
    Layer,
}

impl ResourceKind {
    /// Returns the path segment for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Volume => "volume",
            Self::Layer => "layer",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of directory entry reported by `ls`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub enum EntryType {
    /// Regular file.
    #[serde(rename = "f")]
    File,
    /// Directory.
    #[serde(rename = "d")]
    Directory,
}

/// One entry of a directory listing.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct FileEntry {
    /// Path relative to the resource root.
    pub path: String,
    /// Permission bits.
    pub mode: Option<u32>,
    /// Size in bytes.
    pub size: Option<u64>,
    /// Entry type.
    #[serde(rename = "type")]
    pub entry_type: Option<EntryType>,
}

/// A file fetched with [`ContentClient::get_contents`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileContents {
    /// Path relative to the resource root.
    pub path: Option<String>,
    /// Permission bits.
    pub mode: Option<u32>,
    /// Decoded file contents.
    pub contents: Vec<u8>,
}

#[derive(Deserialize)]
struct RawFileContents {
    path: Option<String>,
    mode: Option<u32>,
    contents: String,
}

#[derive(Deserialize)]
struct FilesResponse {
    files: Vec<RawFileContents>,
}

#[derive(Deserialize)]
struct ListingResponse {
    ls: Vec<FileEntry>,
}

/// File operations on one named volume or layer.
#[derive(Debug)]
pub struct ContentClient<T> {
    requester: Arc<RetryingRequester<T>>,
    kind: ResourceKind,
    name: String,
}

impl<T> Clone for ContentClient<T> {
    fn clone(&self) -> Self {
        Self {
            requester: Arc::clone(&self.requester),
            kind: self.kind,
            name: self.name.clone(),
        }
    }
}

impl<T: Transport> ContentClient<T> {
    /// Builds a client for the resource `name` of `kind`.
    #[must_use]
    pub fn new(requester: Arc<RetryingRequester<T>>, kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            requester,
            kind,
            name: name.into(),
        }
    }

    /// Returns the resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn base_path(&self) -> String {
        format!("/{}/{}", self.kind, self.name)
    }

    /// Creates a directory at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn mkdir(&self, path: &str) -> Result<bool, ClientError> {
        let request = ApiRequest::put(format!("{}/mkdir", self.base_path())).query("path", path);
        self.acknowledged(&request).await
    }

    /// Creates or replaces the file at `target_path` with `contents`.
    /// `mode` holds permission bits such as `0o755`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the upload fails.
    pub async fn put_contents(
        &self,
        contents: Vec<u8>,
        target_path: &str,
        mode: Option<u32>,
    ) -> Result<bool, ClientError> {
        let mut request = ApiRequest::put(self.base_path()).attach("file", target_path, contents);
        if let Some(bits) = mode {
            request = request.form("file_mode", bits);
        }
        self.acknowledged(&request).await
    }

    /// Fetches the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnexpectedResponse`] when the response holds
    /// no file or invalid base64.
    pub async fn get_contents(&self, path: &str) -> Result<FileContents, ClientError> {
        let context = self.base_path();
        let request = ApiRequest::get(context.as_str()).query_all("path", [path]);
        let response: FilesResponse = self.requester.send_as(&request).await?;
        let file = response
            .files
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::unexpected(context.as_str(), "response contained no files"))?;
        let contents = BASE64
            .decode(file.contents.as_bytes())
            .map_err(|err| ClientError::unexpected(context.as_str(), format!("invalid base64 contents: {err}")))?;
        Ok(FileContents {
            path: file.path,
            mode: file.mode,
            contents,
        })
    }

    /// Uploads the local file at `local_path` to `remote_path`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::LocalFile`] when the file cannot be read, or
    /// any upload error.
    pub async fn put_file(
        &self,
        local_path: &Utf8Path,
        remote_path: &str,
        mode: Option<u32>,
    ) -> Result<bool, ClientError> {
        let contents = read_local(local_path)?;
        debug!(%local_path, remote_path, kind = %self.kind, name = %self.name, "uploading file");
        self.put_contents(contents, remote_path, mode).await
    }

    /// Downloads `remote_path` into the local file at `local_path`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::LocalFile`] when the file cannot be written,
    /// or any download error.
    pub async fn get_file(&self, remote_path: &str, local_path: &Utf8Path) -> Result<(), ClientError> {
        let file = self.get_contents(remote_path).await?;
        write_local(local_path, &file.contents)
    }

    /// Lists the directory at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn ls(&self, path: &str) -> Result<Vec<FileEntry>, ClientError> {
        let request = ApiRequest::get(format!("{}/ls", self.base_path())).query("path", path);
        let response: ListingResponse = self.requester.send_as(&request).await?;
        Ok(response.ls)
    }

    /// Removes the file or directory at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn rm(&self, path: &str) -> Result<bool, ClientError> {
        let request = ApiRequest::post(format!("{}/rm", self.base_path())).query("path", path);
        self.acknowledged(&request).await
    }

    async fn acknowledged(&self, request: &ApiRequest) -> Result<bool, ClientError> {
        let response: StatusResponse = self.requester.send_as(request).await?;
        Ok(response.is_ok())
    }
}

fn local_error(path: &Utf8Path, err: &io::Error) -> ClientError {
    ClientError::LocalFile {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn split_local(path: &Utf8Path) -> Result<(Utf8PathBuf, &str), ClientError> {
    let file_name = path.file_name().ok_or_else(|| ClientError::LocalFile {
        path: path.to_path_buf(),
        message: String::from("path is missing a filename"),
    })?;
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .map_or_else(|| Utf8PathBuf::from("."), Utf8Path::to_path_buf);
    Ok((parent, file_name))
}

fn read_local(path: &Utf8Path) -> Result<Vec<u8>, ClientError> {
    let (parent, file_name) = split_local(path)?;
    let dir = Dir::open_ambient_dir(&parent, ambient_authority())
        .map_err(|err| local_error(&parent, &err))?;
    dir.read(file_name).map_err(|err| local_error(path, &err))
}

fn write_local(path: &Utf8Path, contents: &[u8]) -> Result<(), ClientError> {
    let (parent, file_name) = split_local(path)?;
    let dir = Dir::open_ambient_dir(&parent, ambient_authority())
        .map_err(|err| local_error(&parent, &err))?;
    dir.write(file_name, contents)
        .map_err(|err| local_error(path, &err))
}
