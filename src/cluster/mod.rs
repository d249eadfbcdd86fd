//! Cluster control-plane capability
//!
//! The engine only needs a handful of control-plane operations: read, create,
//! delete, scale and a pod count for wait-for-terminated polls. They are
//! expressed as the [`ClusterApi`] trait, constructed once at process start
//! and injected, with two implementations:
//!
//! - [`kube::KubeClusterApi`] - real adapter over a kube-rs client
//! - [`fake::InMemoryCluster`] - in-memory fake modelling create/conflict/not-found
//!
//! All failures are classified into [`ApiError`] so callers can decide whether
//! to retry without inspecting HTTP codes.

pub mod fake;
pub mod kube;

use std::collections::BTreeMap;
use std::fmt;

use ::kube::discovery::ApiResource;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::ingress::Ingress;
use crate::policy::NetworkPolicy;
use crate::workload::volume::PersistentVolumeClaim;
use crate::workload::{Deployment, Namespace, ObjectMeta, Service};

// =============================================================================
// HasApiResource
// =============================================================================

/// Types with a compile-time known API version and kind
pub trait HasApiResource {
    /// Full API version (e.g., "networking.k8s.io/v1", "v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "NetworkPolicy")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Adds `default_api_version`/`default_kind` helpers for serde defaults
macro_rules! impl_api_defaults {
    ($type:ty) => {
        impl $type {
            fn default_api_version() -> String {
                <Self as $crate::cluster::HasApiResource>::API_VERSION.to_string()
            }
            fn default_kind() -> String {
                <Self as $crate::cluster::HasApiResource>::KIND.to_string()
            }
        }
    };
}
pub(crate) use impl_api_defaults;

/// Build an ApiResource from an apiVersion string and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Pluralize a Kubernetes resource kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Classified control-plane failure
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The object already exists (concurrent creator)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Network blip, rate limit or server error; worth retrying
    #[error("transient: {0}")]
    Transient(String),

    /// Quota exceeded, permission denied, malformed object; never retried
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ApiError {
    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }

    /// Whether the object was missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    /// Whether the object already existed
    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict(_))
    }
}

// =============================================================================
// Resource identity
// =============================================================================

/// Object types the engine manages
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    /// Project namespace
    Namespace,
    /// Shared project volume
    PersistentVolumeClaim,
    /// Namespace isolation policy
    NetworkPolicy,
    /// Container workload
    Deployment,
    /// Internal endpoint
    Service,
    /// External routing rule
    Ingress,
}

impl ResourceKind {
    /// apiVersion of this kind
    pub fn api_version(&self) -> &'static str {
        match self {
            Self::Namespace | Self::PersistentVolumeClaim | Self::Service => "v1",
            Self::NetworkPolicy | Self::Ingress => "networking.k8s.io/v1",
            Self::Deployment => "apps/v1",
        }
    }

    /// Kind name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Namespace => "Namespace",
            Self::PersistentVolumeClaim => "PersistentVolumeClaim",
            Self::NetworkPolicy => "NetworkPolicy",
            Self::Deployment => "Deployment",
            Self::Service => "Service",
            Self::Ingress => "Ingress",
        }
    }

    /// Whether objects of this kind live inside a namespace
    pub fn is_namespaced(&self) -> bool {
        !matches!(self, Self::Namespace)
    }

    /// ApiResource for dynamic clients
    pub fn api_resource(&self) -> ApiResource {
        build_api_resource(self.api_version(), self.kind())
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Reference to a single cluster object
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceRef {
    /// Object kind
    pub kind: ResourceKind,
    /// Namespace (None for cluster-scoped kinds)
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ResourceRef {
    /// Reference to a namespaced object
    pub fn namespaced(
        kind: ResourceKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Reference to a namespace
    pub fn namespace(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Namespace,
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

// =============================================================================
// Manifests
// =============================================================================

/// A compiled object ready to be created
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Manifest {
    /// Project namespace
    Namespace(Namespace),
    /// Shared project volume
    Volume(PersistentVolumeClaim),
    /// Namespace isolation policy
    NetworkPolicy(NetworkPolicy),
    /// Container workload
    Deployment(Deployment),
    /// Internal endpoint
    Service(Service),
    /// External routing rule
    Ingress(Ingress),
}

impl Manifest {
    /// Object kind
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Namespace(_) => ResourceKind::Namespace,
            Self::Volume(_) => ResourceKind::PersistentVolumeClaim,
            Self::NetworkPolicy(_) => ResourceKind::NetworkPolicy,
            Self::Deployment(_) => ResourceKind::Deployment,
            Self::Service(_) => ResourceKind::Service,
            Self::Ingress(_) => ResourceKind::Ingress,
        }
    }

    /// Object metadata
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Namespace(m) => &m.metadata,
            Self::Volume(m) => &m.metadata,
            Self::NetworkPolicy(m) => &m.metadata,
            Self::Deployment(m) => &m.metadata,
            Self::Service(m) => &m.metadata,
            Self::Ingress(m) => &m.metadata,
        }
    }

    /// Reference to the object this manifest creates
    pub fn resource_ref(&self) -> ResourceRef {
        let kind = self.kind();
        let meta = self.metadata();
        if kind.is_namespaced() {
            ResourceRef::namespaced(kind, meta.namespace.clone(), meta.name.clone())
        } else {
            ResourceRef::namespace(meta.name.clone())
        }
    }

    /// Desired replica count for workloads
    pub fn replicas(&self) -> Option<u32> {
        match self {
            Self::Deployment(d) => Some(d.spec.replicas),
            _ => None,
        }
    }

    /// JSON representation sent to the control plane
    pub fn to_json(&self) -> crate::Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| {
            crate::Error::serialization_for_kind(self.kind().kind(), e.to_string())
        })
    }
}

/// Observed state of an object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceStatus {
    /// Desired replicas (workloads only)
    pub replicas: u32,
    /// Ready replicas (workloads only)
    pub ready_replicas: u32,
    /// Object is being deleted
    pub terminating: bool,
    /// Reported phase (namespaces, volumes)
    pub phase: Option<String>,
}

impl ResourceStatus {
    /// Whether at least one replica is ready
    pub fn has_ready_replica(&self) -> bool {
        self.ready_replicas > 0
    }
}

// =============================================================================
// Capability trait
// =============================================================================

/// Control-plane operations used by the reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Read an object; `Ok(None)` when it does not exist
    async fn get(&self, resource: &ResourceRef) -> Result<Option<ResourceStatus>, ApiError>;

    /// Create an object; [`ApiError::Conflict`] when it already exists
    async fn create(&self, manifest: &Manifest) -> Result<(), ApiError>;

    /// Request deletion; [`ApiError::NotFound`] when it does not exist
    async fn delete(&self, resource: &ResourceRef) -> Result<(), ApiError>;

    /// Set the replica count of a workload
    async fn scale(&self, resource: &ResourceRef, replicas: u32) -> Result<(), ApiError>;

    /// Number of pods in a namespace matching the labels, terminating ones included
    async fn pod_count(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<usize, ApiError>;
}
