//! ConfigMap-backed object store talking to the Kubernetes API server.
//!
//! Record fields live in ConfigMap annotations and `metadata.resourceVersion`
//! is the compare-and-swap token: the API server answers 409 when a merge
//! patch carries a stale version. Patches touch only the annotations they
//! name, so labels, owner references and foreign annotations survive.
//! Change notifications are produced by polling.

use crate::{
    error::{Error, Result},
    record::Annotations,
    storage::{ObjectEvent, ObjectStore, StoredObject},
};
use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const MERGE_PATCH: &str = "application/merge-patch+json";

#[derive(Debug, Clone)]
pub struct KubeConfig {
    pub api_url: String,
    pub namespace: String,
    pub token_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub accept_invalid_certs: bool,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    /// Labels stamped on every ConfigMap this store creates.
    pub labels: BTreeMap<String, String>,
}

impl KubeConfig {
    /// Service-account credentials and API address as mounted into every pod.
    pub fn in_cluster(namespace: &str) -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| Error::Config("KUBERNETES_SERVICE_HOST is not set".into()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        Ok(Self {
            api_url: format!("https://{host}:{port}"),
            namespace: namespace.to_string(),
            token_path: Some(PathBuf::from(SERVICE_ACCOUNT_DIR).join("token")),
            ca_path: Some(PathBuf::from(SERVICE_ACCOUNT_DIR).join("ca.crt")),
            accept_invalid_certs: false,
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(10),
            labels: BTreeMap::new(),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigMap {
    api_version: String,
    kind: String,
    metadata: ObjectMeta,
}

/// Body of a conditional annotation update.
#[derive(Debug, Serialize)]
struct AnnotationPatch<'a> {
    metadata: PatchMeta<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PatchMeta<'a> {
    resource_version: &'a str,
    annotations: &'a Annotations,
}

impl<'a> AnnotationPatch<'a> {
    fn new(data: &'a Annotations, version: &'a str) -> Self {
        Self {
            metadata: PatchMeta {
                resource_version: version,
                annotations: data,
            },
        }
    }
}

impl ConfigMap {
    fn new(metadata: ObjectMeta) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            metadata,
        }
    }

    fn into_stored(self) -> Result<StoredObject> {
        let version = self
            .metadata
            .resource_version
            .ok_or_else(|| Error::Malformed(format!("configmap {} has no resourceVersion", self.metadata.name)))?;
        Ok(StoredObject {
            name: self.metadata.name,
            version,
            data: self.metadata.annotations,
        })
    }
}

#[derive(Debug, Clone)]
pub struct KubernetesObjectStore {
    client: Client,
    config: KubeConfig,
}

impl KubernetesObjectStore {
    pub fn new(config: KubeConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs);
        if let Some(ca_path) = &config.ca_path {
            let pem = std::fs::read(ca_path)
                .map_err(|e| Error::Config(format!("cannot read CA bundle {}: {e}", ca_path.display())))?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        Ok(Self {
            client: builder.build()?,
            config,
        })
    }

    fn collection_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/configmaps",
            self.config.api_url.trim_end_matches('/'),
            self.config.namespace
        )
    }

    fn object_url(&self, name: &str) -> String {
        format!("{}/{}", self.collection_url(), name)
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        match &self.config.token_path {
            // Projected tokens rotate, so read the file on every request.
            Some(path) => {
                let token = tokio::fs::read_to_string(path).await?;
                Ok(request.bearer_auth(token.trim()))
            }
            None => Ok(request),
        }
    }

    async fn unexpected(name: &str, response: Response) -> Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Error::StoreUnavailable(format!("configmap {name}: {status}: {body}"))
    }

    fn meta(&self, name: &str, data: Annotations) -> ObjectMeta {
        ObjectMeta {
            name: name.to_string(),
            namespace: Some(self.config.namespace.clone()),
            resource_version: None,
            labels: self.config.labels.clone(),
            annotations: data,
        }
    }
}

#[async_trait]
impl ObjectStore for KubernetesObjectStore {
    fn backend(&self) -> &'static str {
        "kubernetes"
    }

    async fn get(&self, name: &str) -> Result<Option<StoredObject>> {
        let request = self.authorize(self.client.get(self.object_url(name))).await?;
        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response.json::<ConfigMap>().await?.into_stored().map(Some),
            _ => Err(Self::unexpected(name, response).await),
        }
    }

    async fn create(&self, name: &str, data: Annotations) -> Result<StoredObject> {
        let body = ConfigMap::new(self.meta(name, data));
        let request = self.authorize(self.client.post(self.collection_url())).await?;
        let response = request.json(&body).send().await?;
        match response.status() {
            StatusCode::CONFLICT => Err(Error::Conflict { key: name.to_string() }),
            status if status.is_success() => response.json::<ConfigMap>().await?.into_stored(),
            _ => Err(Self::unexpected(name, response).await),
        }
    }

    async fn update(&self, name: &str, data: Annotations, version: &str) -> Result<StoredObject> {
        let body = serde_json::to_vec(&AnnotationPatch::new(&data, version))?;
        let request = self.authorize(self.client.patch(self.object_url(name))).await?;
        let response = request.header(CONTENT_TYPE, MERGE_PATCH).body(body).send().await?;
        match response.status() {
            StatusCode::CONFLICT => Err(Error::Conflict { key: name.to_string() }),
            StatusCode::NOT_FOUND => Err(Error::NotFound { key: name.to_string() }),
            status if status.is_success() => response.json::<ConfigMap>().await?.into_stored(),
            _ => Err(Self::unexpected(name, response).await),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let request = self.authorize(self.client.delete(self.object_url(name))).await?;
        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            _ => Err(Self::unexpected(name, response).await),
        }
    }

    async fn watch(&self, names: Vec<String>) -> Result<mpsc::UnboundedReceiver<ObjectEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.clone();

        tokio::spawn(async move {
            let mut seen: HashMap<String, StoredObject> = HashMap::new();
            let mut interval = tokio::time::interval(store.config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            while !tx.is_closed() {
                interval.tick().await;
                for name in &names {
                    let current = match store.get(name).await {
                        Ok(current) => current,
                        Err(e) => {
                            warn!(object = %name, error = %e, "Failed to poll configmap");
                            continue;
                        }
                    };
                    let event = match (seen.get(name), current) {
                        (None, Some(new)) => Some(ObjectEvent::Added(new)),
                        (Some(old), Some(new)) if old.version != new.version => Some(ObjectEvent::Updated {
                            old: old.clone(),
                            new,
                        }),
                        (Some(old), None) => Some(ObjectEvent::Deleted(old.clone())),
                        _ => None,
                    };
                    if let Some(event) = event {
                        match &event {
                            ObjectEvent::Added(obj) | ObjectEvent::Updated { new: obj, .. } => {
                                seen.insert(name.clone(), obj.clone());
                            }
                            ObjectEvent::Deleted(_) => {
                                seen.remove(name);
                            }
                        }
                        debug!(object = %name, "Observed configmap change");
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
