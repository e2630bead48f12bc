//! HTTP transport for the Multyvac API.
//!
//! A [`Transport`] performs exactly one request and normalises the response:
//! a JSON value on success, or a [`ClientError`] describing why the exchange
//! failed. Retrying is layered on top by [`crate::retry::RetryingRequester`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use serde_json::Value;
use tracing::info;

use crate::config::{Credentials, MultyvacConfig};
use crate::error::{ClientError, RequestError};

pub mod redact;

pub use redact::{MAX_LOGGED_FIELD_BYTES, redact, redact_pairs};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Boxed future returned by [`Transport`] implementations.
pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ClientError>> + Send + 'a>>;

/// Performs a single API exchange.
pub trait Transport: Send + Sync {
    /// Sends `request` once and decodes the response body.
    fn execute<'a>(&'a self, request: &'a ApiRequest) -> TransportFuture<'a>;
}

/// HTTP verbs used by the API.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Method {
    /// Read-only lookups.
    Get,
    /// Creations and actions.
    Post,
    /// Uploads and directory creation.
    Put,
    /// Partial updates.
    Patch,
}

impl Method {
    /// Returns the upper-case verb.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
        }
    }

    const fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Patch => reqwest::Method::PATCH,
        }
    }
}

/// Request body encodings accepted by the API.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum RequestBody {
    /// No body.
    #[default]
    Empty,
    /// URL-encoded form pairs; repeated keys encode lists.
    Form(Vec<(String, String)>),
    /// JSON document sent with `content-type: application/json`.
    Json(Value),
}

/// File uploaded as part of a multipart request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attachment {
    /// Multipart field name.
    pub field: String,
    /// File name reported to the server.
    pub file_name: String,
    /// Raw file contents.
    pub contents: Vec<u8>,
}

/// Description of one API call, independent of the HTTP client.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: RequestBody,
    attachments: Vec<Attachment>,
    auth: Option<Credentials>,
}

impl ApiRequest {
    /// Starts a request with the given verb and path (for example `/job`).
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
            attachments: Vec::new(),
            auth: None,
        }
    }

    /// Starts a `GET` request.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// Starts a `POST` request.
    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    /// Starts a `PUT` request.
    #[must_use]
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    /// Starts a `PATCH` request.
    #[must_use]
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    /// Appends a query parameter.
    #[must_use]
    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_owned(), value.to_string()));
        self
    }

    /// Appends a query parameter when `value` is present.
    #[must_use]
    pub fn query_opt(self, key: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(inner) => self.query(key, inner),
            None => self,
        }
    }

    /// Appends one query parameter per value, repeating `key`.
    #[must_use]
    pub fn query_all<I, V>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        self.query
            .extend(values.into_iter().map(|value| (key.to_owned(), value.to_string())));
        self
    }

    /// Appends a form field, switching the body to form encoding.
    #[must_use]
    pub fn form(mut self, key: &str, value: impl ToString) -> Self {
        let pair = (key.to_owned(), value.to_string());
        match &mut self.body {
            RequestBody::Form(pairs) => pairs.push(pair),
            body => *body = RequestBody::Form(vec![pair]),
        }
        self
    }

    /// Sets a JSON body.
    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    /// Adds a multipart file attachment.
    #[must_use]
    pub fn attach(mut self, field: &str, file_name: &str, contents: Vec<u8>) -> Self {
        self.attachments.push(Attachment {
            field: field.to_owned(),
            file_name: file_name.to_owned(),
            contents,
        });
        self
    }

    /// Overrides the configured credentials for this request only.
    #[must_use]
    pub fn auth(mut self, credentials: Credentials) -> Self {
        self.auth = Some(credentials);
        self
    }

    /// Returns the HTTP verb.
    #[must_use]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Returns the endpoint path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the query pairs in insertion order.
    #[must_use]
    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    /// Returns every value recorded for a query key.
    #[must_use]
    pub fn query_values(&self, key: &str) -> Vec<&str> {
        self.query
            .iter()
            .filter(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
            .collect()
    }

    /// Returns the request body.
    #[must_use]
    pub const fn body(&self) -> &RequestBody {
        &self.body
    }

    /// Returns the multipart attachments.
    #[must_use]
    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// Returns the per-request credential override.
    #[must_use]
    pub const fn auth_override(&self) -> Option<&Credentials> {
        self.auth.as_ref()
    }

    /// Emits one log line describing this request with large fields
    /// redacted.
    pub fn log_attempt(&self, attempt: u32) {
        let query = redact_pairs(&self.query);
        let data = match &self.body {
            RequestBody::Empty => Value::Null,
            RequestBody::Form(pairs) => redact_pairs(pairs),
            RequestBody::Json(value) => redact(value),
        };
        let files: Vec<&str> = self
            .attachments
            .iter()
            .map(|file| file.file_name.as_str())
            .collect();
        info!(
            method = self.method.as_str(),
            path = %self.path,
            attempt,
            params = %query,
            data = %data,
            files = ?files,
            "sending request"
        );
    }
}

/// Production transport backed by a pooled `reqwest` client.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    config: MultyvacConfig,
}

impl HttpTransport {
    /// Builds a transport for the configured API URL.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] when the configuration is invalid, or
    /// [`ClientError::Connection`] when the HTTP client cannot be built.
    pub fn new(config: MultyvacConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, config })
    }

    /// Returns the configuration used for credential resolution.
    #[must_use]
    pub const fn config(&self) -> &MultyvacConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.api_url.trim_end_matches('/'))
    }

    async fn send(&self, request: &ApiRequest) -> Result<Value, ClientError> {
        let credentials = match request.auth_override() {
            Some(credentials) => credentials.clone(),
            None => self.config.auth()?,
        };

        let mut builder = self
            .client
            .request(request.method().as_reqwest(), self.url(request.path()))
            .basic_auth(credentials.username, credentials.password);
        if !request.query_pairs().is_empty() {
            builder = builder.query(request.query_pairs());
        }

        builder = if request.attachments().is_empty() {
            match request.body() {
                RequestBody::Empty => builder,
                RequestBody::Form(pairs) => builder.form(pairs),
                RequestBody::Json(value) => builder.json(value),
            }
        } else {
            builder.multipart(multipart_form(request))
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        decode_response(status, &body)
    }
}

impl Transport for HttpTransport {
    fn execute<'a>(&'a self, request: &'a ApiRequest) -> TransportFuture<'a> {
        Box::pin(self.send(request))
    }
}

fn multipart_form(request: &ApiRequest) -> Form {
    let mut form = Form::new();
    if let RequestBody::Form(pairs) = request.body() {
        for (key, value) in pairs {
            form = form.text(key.clone(), value.clone());
        }
    }
    for file in request.attachments() {
        let part = Part::bytes(file.contents.clone()).file_name(file.file_name.clone());
        form = form.part(file.field.clone(), part);
    }
    form
}

/// Converts a raw HTTP response into the API's JSON payload or a
/// [`RequestError`].
///
/// # Errors
///
/// - Unparseable bodies with a 5xx status become retry-safe errors carrying
///   the raw body as the message.
/// - Other unparseable bodies become `"Could not parse body"` with the raw
///   body as the hint.
/// - JSON bodies with an `error` object, or a non-2xx status, become the
///   service error they describe.
pub fn decode_response(status: u16, body: &str) -> Result<Value, ClientError> {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        let error = if status >= 500 {
            RequestError {
                http_status: status,
                code: None,
                message: body.to_owned(),
                hint: None,
                retry: true,
            }
        } else {
            RequestError {
                http_status: status,
                code: None,
                message: String::from("Could not parse body"),
                hint: Some(body.to_owned()),
                retry: false,
            }
        };
        return Err(error.into());
    };

    if let Some(error) = value.get("error") {
        return Err(service_error(status, error).into());
    }

    if !(200..300).contains(&status) {
        return Err(RequestError {
            http_status: status,
            code: None,
            message: format!("unexpected HTTP status {status}"),
            hint: Some(value.to_string()),
            retry: status >= 500,
        }
        .into());
    }

    Ok(value)
}

fn service_error(status: u16, error: &Value) -> RequestError {
    let text = |key: &str| -> Option<String> {
        match error.get(key)? {
            Value::String(inner) => Some(inner.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    };
    let message = match error {
        Value::String(inner) => inner.clone(),
        _ => text("message").unwrap_or_else(|| String::from("unknown error")),
    };

    RequestError {
        http_status: status,
        code: text("code"),
        message,
        hint: text("hint"),
        retry: error
            .get("retry")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}
