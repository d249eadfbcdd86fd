//! Canopy - per-project development environments on Kubernetes
//!
//! Canopy turns a declarative project/container graph into live cluster
//! resources, keeps them running while they are used, and hibernates idle
//! environments by archiving their shared volume to object storage.
//!
//! # Architecture
//!
//! ```text
//! persistence -> graph (resolve) -> compiler (manifests) -> reconciler -> cluster
//!                                         ^
//! idle check -> hibernation controller ---+--> object storage (archive)
//! project set -> routing generator -> dynamic edge routing file
//! ```
//!
//! Every external system is reached through a capability trait that is
//! constructed once at process start and injected:
//!
//! - [`cluster::ClusterApi`] - Kubernetes control plane (real: [`cluster::kube`], fake: [`cluster::fake`])
//! - [`storage::ObjectStore`] - archive storage (real: [`storage::s3`], fake: [`storage::memory`])
//! - [`persistence::ProjectStore`] - project/container/connection records
//! - [`progress::ProgressSink`] - operation progress events
//!
//! # Modules
//!
//! - [`naming`] - Deterministic, length-constrained cluster object names
//! - [`graph`] - Startup ordering and service-discovery variables
//! - [`workload`] - Deployment, Service and volume manifests
//! - [`ingress`] - External routing rules for user-facing containers
//! - [`policy`] - Namespace isolation policy
//! - [`compiler`] - Compiles a whole project into an ordered manifest plan
//! - [`reconciler`] - Idempotent apply with retry and partial-failure isolation
//! - [`controller`] - Environment lifecycle and hibernation state machine
//! - [`routing`] - Regional gateway routing file generation
//! - [`archive`] - Volume archive pack/unpack (hydration and dehydration)

#![deny(missing_docs)]

pub mod archive;
pub mod cluster;
pub mod compiler;
pub mod config;
pub mod controller;
pub mod error;
pub mod graph;
pub mod ingress;
pub mod model;
pub mod naming;
pub mod persistence;
pub mod policy;
pub mod progress;
pub mod reconciler;
pub mod retry;
pub mod routing;
pub mod storage;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Labels and annotations
// =============================================================================

/// Standard Kubernetes name label
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Standard Kubernetes managed-by label
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label for all Canopy resources
pub const LABEL_MANAGED_BY_CANOPY: &str = "canopy";

/// Label carrying the owning project id
pub const LABEL_PROJECT: &str = "canopy.dev/project";

/// Label carrying the owning container id
pub const LABEL_CONTAINER: &str = "canopy.dev/container";

/// Annotation carrying the best-effort startup order of a workload
pub const ANNOTATION_STARTUP_ORDER: &str = "canopy.dev/startup-order";

/// Field manager used for all control-plane writes
pub const FIELD_MANAGER: &str = "canopy-controller";
