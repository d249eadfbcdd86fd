//! kube-rs adapter for [`ClusterApi`]
//!
//! Objects are sent as [`DynamicObject`]s built from the compiled manifests, so
//! the engine's own serde types stay the single source of truth for shapes.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use ::kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use ::kube::config::{KubeConfigOptions, Kubeconfig};
use ::kube::{Client, Config};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, trace};

use super::{ApiError, ClusterApi, Manifest, ResourceKind, ResourceRef, ResourceStatus};
use crate::{Error, FIELD_MANAGER};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Classify an HTTP status returned by the API server
pub fn classify_status(code: u16, message: &str) -> ApiError {
    match code {
        404 => ApiError::NotFound(message.to_string()),
        409 => ApiError::Conflict(message.to_string()),
        408 | 429 | 500..=599 => ApiError::Transient(format!("{code}: {message}")),
        _ => ApiError::Fatal(format!("{code}: {message}")),
    }
}

impl From<::kube::Error> for ApiError {
    fn from(e: ::kube::Error) -> Self {
        match &e {
            ::kube::Error::Api(resp) => classify_status(resp.code, &resp.message),
            ::kube::Error::SerdeError(_) | ::kube::Error::BuildRequest(_) => {
                ApiError::Fatal(e.to_string())
            }
            // Transport, TLS and connection-level failures
            _ => ApiError::Transient(e.to_string()),
        }
    }
}

/// Real control-plane adapter
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) if kind.is_namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn status_of(obj: &DynamicObject) -> ResourceStatus {
        let status = obj.data.get("status");
        let spec = obj.data.get("spec");
        let as_u32 = |v: Option<&serde_json::Value>| {
            v.and_then(serde_json::Value::as_u64)
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
                .unwrap_or(0)
        };
        ResourceStatus {
            replicas: as_u32(spec.and_then(|s| s.get("replicas"))),
            ready_replicas: as_u32(status.and_then(|s| s.get("readyReplicas"))),
            terminating: obj.metadata.deletion_timestamp.is_some(),
            phase: status
                .and_then(|s| s.get("phase"))
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get(&self, resource: &ResourceRef) -> Result<Option<ResourceStatus>, ApiError> {
        let api = self.api(resource.kind, resource.namespace.as_deref());
        let obj = api.get_opt(&resource.name).await?;
        trace!(resource = %resource, found = obj.is_some(), "read resource");
        Ok(obj.as_ref().map(Self::status_of))
    }

    async fn create(&self, manifest: &Manifest) -> Result<(), ApiError> {
        let resource = manifest.resource_ref();
        let value = manifest
            .to_json()
            .map_err(|e| ApiError::Fatal(e.to_string()))?;
        let obj: DynamicObject =
            serde_json::from_value(value).map_err(|e| ApiError::Fatal(e.to_string()))?;

        let api = self.api(resource.kind, resource.namespace.as_deref());
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.create(&params, &obj).await?;
        debug!(resource = %resource, "created resource");
        Ok(())
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), ApiError> {
        let api = self.api(resource.kind, resource.namespace.as_deref());
        api.delete(&resource.name, &DeleteParams::background())
            .await?;
        debug!(resource = %resource, "deletion requested");
        Ok(())
    }

    async fn scale(&self, resource: &ResourceRef, replicas: u32) -> Result<(), ApiError> {
        let api = self.api(resource.kind, resource.namespace.as_deref());
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.patch(&resource.name, &params, &Patch::Merge(&patch))
            .await?;
        debug!(resource = %resource, replicas, "scaled workload");
        Ok(())
    }

    async fn pod_count(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<usize, ApiError> {
        let selector = labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods.list(&ListParams::default().labels(&selector)).await?;
        let live = list
            .items
            .iter()
            .filter(|pod| {
                let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
                !matches!(phase, Some("Succeeded") | Some("Failed"))
            })
            .count();
        Ok(live)
    }
}
