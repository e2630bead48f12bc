//! API key management.
//!
//! Key lookups may authenticate with web account credentials instead of an
//! API key; the service expects those as `web-<username>`.

use std::sync::Arc;

use serde::Deserialize;

use crate::config::Credentials;
use crate::error::ClientError;
use crate::job::StatusResponse;
use crate::retry::RetryingRequester;
use crate::transport::{ApiRequest, Transport};

/// Web account credentials used in place of an API key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WebLogin {
    /// Account username.
    pub username: String,
    /// Account password.
    pub password: String,
}

impl WebLogin {
    fn credentials(&self) -> Credentials {
        Credentials::new(format!("web-{}", self.username), Some(self.password.clone()))
    }
}

/// An API key and its SSH key pair.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ApiKey {
    /// Public key identifier, used as the API username.
    pub id: String,
    /// Secret half of the credential pair.
    pub secret_key: Option<String>,
    /// Public SSH key installed in jobs.
    pub public_key: Option<String>,
    /// Private SSH key for logging into jobs.
    pub private_key: Option<String>,
    /// Creation time as reported by the service.
    pub created: Option<String>,
    /// Whether the key may authenticate.
    pub active: Option<bool>,
}

#[derive(Deserialize)]
struct KeysResponse {
    keys: Vec<ApiKey>,
}

/// Client for the `/key` endpoints.
#[derive(Debug)]
pub struct ApiKeyClient<T> {
    requester: Arc<RetryingRequester<T>>,
}

impl<T> Clone for ApiKeyClient<T> {
    fn clone(&self) -> Self {
        Self {
            requester: Arc::clone(&self.requester),
        }
    }
}

impl<T: Transport> ApiKeyClient<T> {
    /// Builds an API key client sharing `requester`.
    #[must_use]
    pub const fn new(requester: Arc<RetryingRequester<T>>) -> Self {
        Self { requester }
    }

    /// Fetches one key.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn get(&self, id: &str, web_login: Option<&WebLogin>) -> Result<Option<ApiKey>, ClientError> {
        let request = with_login(ApiRequest::get("/key").query("id", id), web_login);
        Ok(self.fetch(&request).await?.into_iter().next())
    }

    /// Lists the account's keys.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn list(&self, web_login: Option<&WebLogin>) -> Result<Vec<ApiKey>, ClientError> {
        self.fetch(&with_login(ApiRequest::get("/key"), web_login))
            .await
    }

    /// Enables the key.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn activate(&self, id: &str) -> Result<bool, ClientError> {
        self.toggle(id, "activate").await
    }

    /// Disables the key.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn deactivate(&self, id: &str) -> Result<bool, ClientError> {
        self.toggle(id, "deactivate").await
    }

    async fn fetch(&self, request: &ApiRequest) -> Result<Vec<ApiKey>, ClientError> {
        let response: KeysResponse = self.requester.send_as(request).await?;
        Ok(response.keys)
    }

    async fn toggle(&self, id: &str, action: &str) -> Result<bool, ClientError> {
        let response: StatusResponse = self
            .requester
            .send_as(&ApiRequest::post(format!("/key/{id}/{action}")))
            .await?;
        Ok(response.is_ok())
    }
}

fn with_login(mut request: ApiRequest, web_login: Option<&WebLogin>) -> ApiRequest {
    if let Some(login) = web_login {
        request = request.auth(login.credentials());
    }
    request
}
