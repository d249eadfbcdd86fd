//! Workload types for project containers
//!
//! This module defines the Kubernetes resource types the engine creates per
//! container and per project:
//! - Namespace: one per project
//! - Deployment: the container's dev server or service process
//! - Service: stable internal endpoint used for service discovery
//!
//! The shared volume lives in [`volume`] and the hydration/dehydration pieces
//! attached to every pod live in [`hydration`].
//!
//! For whole-project compilation, use [`crate::compiler::ProjectCompiler`].

pub mod hydration;
pub mod volume;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::{impl_api_defaults, HasApiResource};
use crate::config::{EngineConfig, RoleResources};
use crate::graph::ResolvedPlan;
use crate::model::{self, ContainerRole, Project};
use crate::naming::ResourceNamer;
use crate::{
    ANNOTATION_STARTUP_ORDER, LABEL_CONTAINER, LABEL_MANAGED_BY, LABEL_MANAGED_BY_CANOPY,
    LABEL_NAME, LABEL_PROJECT,
};

use hydration::HydrationSpec;

/// Name of the shared volume inside pod specs
pub const WORKSPACE_VOLUME: &str = "workspace";

/// Where a container's own subdirectory of the shared volume is mounted
pub const WORKSPACE_MOUNT_PATH: &str = "/workspace";

/// Name of the single service port
pub const HTTP_PORT_NAME: &str = "http";

// =============================================================================
// Kubernetes Resource Types
// =============================================================================

/// Standard Kubernetes ObjectMeta
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace (empty for cluster-scoped objects)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Create new metadata with standard Canopy labels
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let name = name.into();
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_NAME.to_string(), name.clone());
        labels.insert(
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_CANOPY.to_string(),
        );
        Self {
            name,
            namespace: namespace.into(),
            labels,
            annotations: BTreeMap::new(),
        }
    }

    /// Metadata for a cluster-scoped object
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self::new(name, String::new())
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add an annotation
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// Namespace
// =============================================================================

/// Kubernetes Namespace
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    /// API version
    #[serde(default = "Namespace::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "Namespace::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
}

impl HasApiResource for Namespace {
    const API_VERSION: &'static str = "v1";
    const KIND: &'static str = "Namespace";
}

impl_api_defaults!(Namespace);

impl Namespace {
    /// Namespace for a project, labelled with the project id
    pub fn for_project(project: &Project) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata: ObjectMeta::cluster_scoped(ResourceNamer::namespace(project.id))
                .with_label(LABEL_PROJECT, project.id.to_string()),
        }
    }
}

// =============================================================================
// Deployment
// =============================================================================

/// Kubernetes Deployment
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    /// API version
    #[serde(default = "Deployment::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "Deployment::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: DeploymentSpec,
}

impl HasApiResource for Deployment {
    const API_VERSION: &'static str = "apps/v1";
    const KIND: &'static str = "Deployment";
}

impl_api_defaults!(Deployment);

/// Deployment spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    /// Number of replicas
    pub replicas: u32,
    /// Label selector
    pub selector: LabelSelector,
    /// Pod template
    pub template: PodTemplateSpec,
    /// Deployment strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<DeploymentStrategy>,
}

/// Label selector
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Match labels (empty selects everything)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

/// Deployment strategy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStrategy {
    /// Strategy type: RollingUpdate or Recreate
    #[serde(rename = "type")]
    pub type_: String,
}

/// Pod template spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    /// Pod metadata
    pub metadata: PodMeta,
    /// Pod spec
    pub spec: PodSpec,
}

/// Pod metadata (subset of ObjectMeta)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodMeta {
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Pod spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// Init containers, run to completion before `containers`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    /// Containers
    pub containers: Vec<Container>,
    /// Volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// Time allowed for preStop hooks before the kill signal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<u64>,
    /// Inject legacy `<SVC>_PORT`-style variables for every service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_service_links: Option<bool>,
    /// Mount the service account token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automount_service_account_token: Option<bool>,
}

/// Container spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Container name
    pub name: String,
    /// Image
    pub image: String,
    /// Command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    /// Args
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Environment populated from secrets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_from: Vec<EnvFromSource>,
    /// Ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,
    /// Resource requirements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// Liveness probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<ProbeSpec>,
    /// Readiness probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<ProbeSpec>,
    /// Lifecycle hooks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<Lifecycle>,
    /// Volume mounts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

/// Environment variable
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    /// Variable name
    pub name: String,
    /// Variable value
    pub value: String,
}

/// Environment populated from a secret
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvFromSource {
    /// Secret reference
    pub secret_ref: SecretEnvSource,
}

/// Secret reference for `envFrom`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretEnvSource {
    /// Secret name
    pub name: String,
}

/// Container port
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    /// Port name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Port number
    pub container_port: u16,
    /// Protocol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Resource requirements
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// Requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceQuantity>,
    /// Limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceQuantity>,
}

/// Resource quantity
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuantity {
    /// CPU
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl From<&RoleResources> for ResourceRequirements {
    fn from(sizing: &RoleResources) -> Self {
        Self {
            requests: Some(ResourceQuantity {
                cpu: Some(sizing.cpu_request.clone()),
                memory: Some(sizing.memory_request.clone()),
            }),
            limits: Some(ResourceQuantity {
                cpu: None,
                memory: Some(sizing.memory_limit.clone()),
            }),
        }
    }
}

/// Probe specification
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSpec {
    /// TCP socket probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_socket: Option<TcpSocketAction>,
    /// Exec probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecAction>,
    /// Initial delay seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_seconds: Option<u32>,
    /// Period seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<u32>,
    /// Consecutive failures before the probe fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
}

/// TCP socket action for probe
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TcpSocketAction {
    /// Port
    pub port: u16,
}

/// Exec action for probes and hooks
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecAction {
    /// Command
    pub command: Vec<String>,
}

/// Container lifecycle hooks
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Lifecycle {
    /// Runs before the container receives the termination signal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_stop: Option<LifecycleHandler>,
}

/// Lifecycle hook handler
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleHandler {
    /// Exec handler
    pub exec: ExecAction,
}

/// Pod volume
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name
    pub name: String,
    /// PVC source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PvcVolumeSource>,
    /// EmptyDir source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,
}

/// PVC volume source
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PvcVolumeSource {
    /// Claim name
    pub claim_name: String,
}

/// EmptyDir volume source
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmptyDirVolumeSource {}

/// Volume mount
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// Volume name
    pub name: String,
    /// Mount path
    pub mount_path: String,
    /// Path within the volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
    /// Read only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

// =============================================================================
// Service
// =============================================================================

/// Kubernetes Service
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// API version
    #[serde(default = "Service::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "Service::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: ServiceSpec,
}

impl HasApiResource for Service {
    const API_VERSION: &'static str = "v1";
    const KIND: &'static str = "Service";
}

impl_api_defaults!(Service);

/// Service spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Selector
    pub selector: BTreeMap<String, String>,
    /// Ports
    pub ports: Vec<ServicePort>,
    /// Service type
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

/// Service port
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    /// Port name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Port number
    pub port: u16,
    /// Target port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    /// Protocol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

// =============================================================================
// Generated Workloads Container
// =============================================================================

/// Workload resources generated for one container
#[derive(Clone, Debug, PartialEq)]
pub struct GeneratedWorkloads {
    /// Kubernetes Deployment
    pub deployment: Deployment,
    /// Kubernetes Service
    pub service: Service,
}

// =============================================================================
// Labels
// =============================================================================

/// Labels selecting every pod of a project
pub fn project_selector(project_id: Uuid) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_PROJECT.to_string(), project_id.to_string())])
}

/// Labels selecting the pods of one container
pub fn container_selector(project_id: Uuid, container_id: Uuid) -> BTreeMap<String, String> {
    let mut labels = project_selector(project_id);
    labels.insert(LABEL_CONTAINER.to_string(), container_id.to_string());
    labels
}

/// Subdirectory of the shared volume owned by a container
///
/// Falls back to the workload name when no directory is configured.
pub fn subpath_for(container: &model::Container, workload_name: &str) -> String {
    let trimmed = container.directory.trim_matches('/');
    if trimmed.is_empty() {
        workload_name.to_string()
    } else {
        trimmed.to_string()
    }
}

// =============================================================================
// Workload Compiler
// =============================================================================

/// Compiler for generating Kubernetes workload resources for one container
///
/// This compiler generates:
/// - Deployment: one replica, hydration init container, dehydration preStop hook
/// - Service: ClusterIP on the container's internal port
pub struct WorkloadCompiler;

impl WorkloadCompiler {
    /// Compile a container into workload resources
    ///
    /// # Arguments
    /// * `project` - Owning project
    /// * `container` - The container to compile
    /// * `plan` - Resolved graph (discovery variables and startup position)
    /// * `config` - Engine configuration (sizing, images, grace periods)
    pub fn compile(
        project: &Project,
        container: &model::Container,
        plan: &ResolvedPlan,
        config: &EngineConfig,
    ) -> GeneratedWorkloads {
        GeneratedWorkloads {
            deployment: Self::compile_deployment(project, container, plan, config),
            service: Self::compile_service(project, container),
        }
    }

    /// Environment: discovery variables, `PORT`, then the user's own variables
    ///
    /// User-configured variables win over generated ones of the same name.
    pub fn compile_env(container: &model::Container, plan: &ResolvedPlan) -> Vec<EnvVar> {
        let mut env = plan.discovery_env(container.id);
        env.insert("PORT".to_string(), container.internal_port.to_string());
        for (k, v) in &container.environment_vars {
            env.insert(k.clone(), v.clone());
        }
        env.into_iter()
            .map(|(name, value)| EnvVar { name, value })
            .collect()
    }

    fn compile_probes(port: u16) -> (ProbeSpec, ProbeSpec) {
        let liveness = ProbeSpec {
            tcp_socket: Some(TcpSocketAction { port }),
            exec: None,
            initial_delay_seconds: Some(30),
            period_seconds: Some(10),
            failure_threshold: Some(6),
        };
        let readiness = ProbeSpec {
            tcp_socket: Some(TcpSocketAction { port }),
            exec: None,
            initial_delay_seconds: Some(2),
            period_seconds: Some(5),
            failure_threshold: Some(3),
        };
        (liveness, readiness)
    }

    fn compile_deployment(
        project: &Project,
        container: &model::Container,
        plan: &ResolvedPlan,
        config: &EngineConfig,
    ) -> Deployment {
        let names = ResourceNamer::names(project.id, &container.name);
        let hydration = HydrationSpec::for_project(project, config);

        let sizing = match container.role {
            ContainerRole::Application => config.application_resources(),
            ContainerRole::Service => config.service_resources(),
        };
        let (liveness, readiness) = Self::compile_probes(container.internal_port);

        let mut volume_mounts = vec![VolumeMount {
            name: WORKSPACE_VOLUME.to_string(),
            mount_path: WORKSPACE_MOUNT_PATH.to_string(),
            sub_path: Some(subpath_for(container, &names.workload)),
            read_only: None,
        }];
        volume_mounts.extend(hydration.hook_mounts());

        let main = Container {
            name: names.workload.clone(),
            image: container.image.clone(),
            working_dir: Some(WORKSPACE_MOUNT_PATH.to_string()),
            env: Self::compile_env(container, plan),
            env_from: hydration.env_from(),
            ports: vec![ContainerPort {
                name: Some(HTTP_PORT_NAME.to_string()),
                container_port: container.internal_port,
                protocol: Some("TCP".to_string()),
            }],
            resources: Some(ResourceRequirements::from(&sizing)),
            liveness_probe: Some(liveness),
            readiness_probe: Some(readiness),
            lifecycle: Some(hydration.pre_stop()),
            volume_mounts,
            ..Default::default()
        };

        let mut labels = container_selector(project.id, container.id);
        labels.insert(LABEL_NAME.to_string(), names.workload.clone());
        labels.insert(
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_CANOPY.to_string(),
        );

        let mut metadata = ObjectMeta::new(&names.workload, &names.namespace)
            .with_label(LABEL_PROJECT, project.id.to_string())
            .with_label(LABEL_CONTAINER, container.id.to_string());
        if let Some(position) = plan.position(container.id) {
            metadata = metadata.with_annotation(ANNOTATION_STARTUP_ORDER, position.to_string());
        }

        Deployment {
            api_version: Deployment::default_api_version(),
            kind: Deployment::default_kind(),
            metadata,
            spec: DeploymentSpec {
                replicas: 1,
                selector: LabelSelector {
                    match_labels: container_selector(project.id, container.id),
                },
                template: PodTemplateSpec {
                    metadata: PodMeta {
                        labels,
                        annotations: BTreeMap::new(),
                    },
                    spec: PodSpec {
                        init_containers: vec![hydration.init_container()],
                        containers: vec![main],
                        volumes: vec![
                            volume::workspace_volume(project.id),
                            hydration::tool_volume(),
                        ],
                        termination_grace_period_seconds: Some(config.termination_grace_secs),
                        enable_service_links: Some(false),
                        automount_service_account_token: Some(false),
                    },
                },
                // A single replica that owns the subdirectory; never two at once
                strategy: Some(DeploymentStrategy {
                    type_: "Recreate".to_string(),
                }),
            },
        }
    }

    fn compile_service(project: &Project, container: &model::Container) -> Service {
        let names = ResourceNamer::names(project.id, &container.name);
        Service {
            api_version: Service::default_api_version(),
            kind: Service::default_kind(),
            metadata: ObjectMeta::new(&names.service, &names.namespace)
                .with_label(LABEL_PROJECT, project.id.to_string())
                .with_label(LABEL_CONTAINER, container.id.to_string()),
            spec: ServiceSpec {
                selector: container_selector(project.id, container.id),
                ports: vec![ServicePort {
                    name: Some(HTTP_PORT_NAME.to_string()),
                    port: container.internal_port,
                    target_port: Some(container.internal_port),
                    protocol: Some("TCP".to_string()),
                }],
                type_: Some("ClusterIP".to_string()),
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
