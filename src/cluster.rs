//! Clusters: reserved pools of cores.

use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::error::ClientError;
use crate::job::{StatusResponse, deserialize_timestamp};
use crate::retry::RetryingRequester;
use crate::transport::{ApiRequest, Transport};

/// A provisioned (or recently released) cluster.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Cluster {
    /// Cluster identifier.
    pub id: u64,
    /// Provisioning state as reported by the service.
    pub state: Option<String>,
    /// Request time (UTC).
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub requested_at: Option<NaiveDateTime>,
    /// Time the cores became available (UTC).
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub provisioned_at: Option<NaiveDateTime>,
    /// Release time (UTC).
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub released_at: Option<NaiveDateTime>,
    /// Core type.
    pub core: Option<String>,
    /// Number of cores.
    pub core_count: Option<u32>,
    /// Hours the cluster has been up.
    pub duration: Option<f64>,
    /// Hours after which the cluster is released.
    pub max_duration: Option<f64>,
}

/// Parameters for [`ClusterClient::provision`].
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterRequest {
    /// Core type, for example `c2`.
    pub core: String,
    /// Number of cores.
    pub core_count: u32,
    /// Hours to keep the cluster up; the service default when `None`.
    pub max_duration: Option<u32>,
}

#[derive(Deserialize)]
struct ClusterResponse {
    cluster: Cluster,
}

#[derive(Deserialize)]
struct ClustersResponse {
    clusters: Vec<Cluster>,
}

#[derive(Deserialize)]
struct ProvisionResponse {
    id: u64,
}

/// Client for the `/cluster` endpoints.
#[derive(Debug)]
pub struct ClusterClient<T> {
    requester: Arc<RetryingRequester<T>>,
}

impl<T> Clone for ClusterClient<T> {
    fn clone(&self) -> Self {
        Self {
            requester: Arc::clone(&self.requester),
        }
    }
}

impl<T: Transport> ClusterClient<T> {
    /// Builds a cluster client sharing `requester`.
    #[must_use]
    pub const fn new(requester: Arc<RetryingRequester<T>>) -> Self {
        Self { requester }
    }

    /// Fetches one cluster.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn get(&self, id: u64) -> Result<Cluster, ClientError> {
        let response: ClusterResponse = self
            .requester
            .send_as(&ApiRequest::get(format!("/cluster/{id}")))
            .await?;
        Ok(response.cluster)
    }

    /// Lists active clusters and recently released ones.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn list(&self) -> Result<Vec<Cluster>, ClientError> {
        let response: ClustersResponse = self.requester.send_as(&ApiRequest::get("/cluster")).await?;
        Ok(response.clusters)
    }

    /// Requests a new cluster and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn provision(&self, request: &ClusterRequest) -> Result<u64, ClientError> {
        let mut cluster = Map::new();
        cluster.insert(String::from("core"), Value::from(request.core.clone()));
        cluster.insert(String::from("core_count"), Value::from(request.core_count));
        if let Some(hours) = request.max_duration {
            cluster.insert(String::from("max_duration"), Value::from(hours));
        }
        let api_request = ApiRequest::post("/cluster").json(json!({ "cluster": cluster }));
        let response: ProvisionResponse = self.requester.send_as(&api_request).await?;
        Ok(response.id)
    }

    /// Releases the cluster's cores.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn release(&self, id: u64) -> Result<bool, ClientError> {
        let response: StatusResponse = self
            .requester
            .send_as(&ApiRequest::post(format!("/cluster/{id}/release")))
            .await?;
        Ok(response.is_ok())
    }

    /// Changes how many hours the cluster stays up.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn update_max_duration(&self, id: u64, hours: u32) -> Result<bool, ClientError> {
        let request = ApiRequest::patch(format!("/cluster/{id}/update_max_duration"))
            .form("max_duration", hours);
        let response: StatusResponse = self.requester.send_as(&request).await?;
        Ok(response.is_ok())
    }

    /// Returns a fresh snapshot of `cluster`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the request fails.
    pub async fn refresh(&self, cluster: &Cluster) -> Result<Cluster, ClientError> {
        self.get(cluster.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedTransport;
    use crate::transport::{Method, RequestBody};

    fn client(transport: &ScriptedTransport) -> ClusterClient<ScriptedTransport> {
        ClusterClient::new(Arc::new(RetryingRequester::new(transport.clone())))
    }

    fn only_request(transport: &ScriptedTransport) -> ApiRequest {
        let mut requests = transport.requests();
        assert_eq!(requests.len(), 1);
        requests.pop().unwrap_or_else(|| panic!("no request"))
    }

    #[tokio::test]
    async fn get_parses_optional_timestamps() {
        let transport = ScriptedTransport::new();
        transport.push_json(json!({"cluster": {
            "id": 3,
            "state": "provisioned",
            "requested_at": "2014-05-01 12:00:00",
            "provisioned_at": null,
            "core": "c2",
            "core_count": 16
        }}));

        let cluster = client(&transport)
            .get(3)
            .await
            .unwrap_or_else(|err| panic!("get: {err}"));

        assert!(cluster.requested_at.is_some());
        assert_eq!(cluster.provisioned_at, None);
        assert_eq!(cluster.released_at, None);
        assert_eq!(only_request(&transport).path(), "/cluster/3");
    }

    #[tokio::test]
    async fn provision_omits_unset_duration() {
        let transport = ScriptedTransport::new();
        transport.push_json(json!({"id": 9}));

        let id = client(&transport)
            .provision(&ClusterRequest {
                core: String::from("c2"),
                core_count: 8,
                max_duration: None,
            })
            .await
            .unwrap_or_else(|err| panic!("provision: {err}"));

        assert_eq!(id, 9);
        assert_eq!(
            only_request(&transport).body(),
            &RequestBody::Json(json!({"cluster": {"core": "c2", "core_count": 8}}))
        );
    }

    #[tokio::test]
    async fn update_max_duration_patches_form() {
        let transport = ScriptedTransport::new();
        transport.push_json(json!({"status": "ok"}));

        let updated = client(&transport)
            .update_max_duration(4, 12)
            .await
            .unwrap_or_else(|err| panic!("update: {err}"));

        assert!(updated);
        let request = only_request(&transport);
        assert_eq!(request.method(), Method::Patch);
        assert_eq!(request.path(), "/cluster/4/update_max_duration");
        assert_eq!(
            request.body(),
            &RequestBody::Form(vec![(String::from("max_duration"), String::from("12"))])
        );
    }

    #[tokio::test]
    async fn release_posts_to_cluster() {
        let transport = ScriptedTransport::new();
        transport.push_json(json!({"status": "ok"}));
        let released = client(&transport)
            .release(4)
            .await
            .unwrap_or_else(|err| panic!("release: {err}"));
        assert!(released);
        assert_eq!(only_request(&transport).path(), "/cluster/4/release");
    }
}
