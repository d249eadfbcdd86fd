//! Project Compiler for Canopy
//!
//! This module provides a unified API for compiling a whole project graph into
//! Kubernetes manifests: the shared resources (namespace, volume, isolation
//! policy) and, per container, a workload, a service and an optional ingress.
//!
//! # Architecture
//!
//! The ProjectCompiler delegates to specialized compilers:
//! - [`WorkloadCompiler`](crate::workload::WorkloadCompiler): Deployment, Service
//! - [`IngressCompiler`](crate::ingress::IngressCompiler): Ingress for user-facing containers
//! - [`PolicyCompiler`](crate::policy::PolicyCompiler): NetworkPolicy
//! - [`volume::compile_volume`](crate::workload::volume::compile_volume): shared claim
//!
//! # Usage
//!
//! ```text
//! let plan = graph::resolve(&containers, &connections);
//! let manifests = ProjectCompiler::new(&config).compile(&project, &containers, &plan)?;
//! // manifests.shared(), manifests.containers
//! ```
//!
//! Compilation is pure. It only fails on malformed input, which is a caller
//! error and never retried.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path};

use uuid::Uuid;

use crate::cluster::{Manifest, ResourceKind, ResourceRef};
use crate::config::EngineConfig;
use crate::graph::{ResolvedPlan, StartupOrder};
use crate::ingress::{Ingress, IngressCompiler};
use crate::model::{Container, Project};
use crate::naming::{is_valid_slug, ResourceNamer, MAX_SLUG_LEN};
use crate::policy::{NetworkPolicy, PolicyCompiler};
use crate::workload::volume::{compile_volume, PersistentVolumeClaim};
use crate::workload::{Deployment, Namespace, Service, WorkloadCompiler};
use crate::{Error, Result};

/// Manifests for a single container
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerManifests {
    /// Container id
    pub container_id: Uuid,
    /// Container display name
    pub container_name: String,
    /// Workload
    pub deployment: Deployment,
    /// Internal endpoint
    pub service: Service,
    /// External route (user-facing containers only)
    pub ingress: Option<Ingress>,
}

impl ContainerManifests {
    /// Manifests in creation order
    pub fn manifests(&self) -> Vec<Manifest> {
        let mut out = vec![
            Manifest::Service(self.service.clone()),
            Manifest::Deployment(self.deployment.clone()),
        ];
        if let Some(ingress) = &self.ingress {
            out.push(Manifest::Ingress(ingress.clone()));
        }
        out
    }

    /// Reference to the container's workload
    pub fn workload_ref(&self) -> ResourceRef {
        ResourceRef::namespaced(
            ResourceKind::Deployment,
            self.deployment.metadata.namespace.clone(),
            self.deployment.metadata.name.clone(),
        )
    }
}

/// Combined output from compiling a project
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectManifests {
    /// Project namespace
    pub namespace: Namespace,
    /// Shared volume
    pub volume: PersistentVolumeClaim,
    /// Isolation policy
    pub network_policy: NetworkPolicy,
    /// Per-container manifests in startup order
    pub containers: Vec<ContainerManifests>,
    /// Startup order the containers were sorted by
    pub order: StartupOrder,
}

impl ProjectManifests {
    /// Shared resources, applied before any container
    pub fn shared(&self) -> Vec<Manifest> {
        vec![
            Manifest::Namespace(self.namespace.clone()),
            Manifest::Volume(self.volume.clone()),
            Manifest::NetworkPolicy(self.network_policy.clone()),
        ]
    }

    /// Every manifest in creation order
    pub fn all(&self) -> Vec<Manifest> {
        let mut out = self.shared();
        for c in &self.containers {
            out.extend(c.manifests());
        }
        out
    }

    /// Workload references in startup order
    pub fn workload_refs(&self) -> Vec<ResourceRef> {
        self.containers.iter().map(|c| c.workload_ref()).collect()
    }

    /// Total count of all generated resources
    pub fn resource_count(&self) -> usize {
        3 + self
            .containers
            .iter()
            .map(|c| 2 + usize::from(c.ingress.is_some()))
            .sum::<usize>()
    }

    /// Multi-document YAML rendering
    pub fn to_yaml(&self) -> Result<String> {
        let mut out = String::new();
        for manifest in self.all() {
            let doc = serde_yaml::to_string(&manifest).map_err(|e| {
                Error::serialization_for_kind(manifest.kind().kind(), e.to_string())
            })?;
            out.push_str("---\n");
            out.push_str(&doc);
        }
        Ok(out)
    }
}

/// Unified project compiler
pub struct ProjectCompiler<'a> {
    config: &'a EngineConfig,
}

impl<'a> ProjectCompiler<'a> {
    /// Create a new project compiler
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// Compile a project and its containers into manifests
    ///
    /// Containers are emitted in the plan's startup order.
    pub fn compile(
        &self,
        project: &Project,
        containers: &[Container],
        plan: &ResolvedPlan,
    ) -> Result<ProjectManifests> {
        Self::validate(project, containers)?;

        let by_id: HashMap<Uuid, &Container> = containers.iter().map(|c| (c.id, c)).collect();
        let mut ordered: Vec<&Container> = plan
            .order
            .ids()
            .iter()
            .filter_map(|id| by_id.get(id).copied())
            .collect();
        // Containers the plan does not know about go last, in declaration order
        for c in containers {
            if plan.position(c.id).is_none() {
                ordered.push(c);
            }
        }

        let compiled = ordered
            .into_iter()
            .map(|container| {
                let workloads = WorkloadCompiler::compile(project, container, plan, self.config);
                ContainerManifests {
                    container_id: container.id,
                    container_name: container.name.clone(),
                    deployment: workloads.deployment,
                    service: workloads.service,
                    ingress: IngressCompiler::compile(project, container, self.config),
                }
            })
            .collect();

        Ok(ProjectManifests {
            namespace: Namespace::for_project(project),
            volume: compile_volume(project, self.config),
            network_policy: PolicyCompiler::compile(project, self.config),
            containers: compiled,
            order: plan.order.clone(),
        })
    }

    fn validate(project: &Project, containers: &[Container]) -> Result<()> {
        if project.id.is_nil() {
            return Err(Error::validation_for_field("project.id", "must not be nil"));
        }
        if project.user_id.is_nil() {
            return Err(Error::validation_for_field("project.user_id", "must not be nil"));
        }
        if project.slug.trim().is_empty() {
            return Err(Error::validation_for_field("project.slug", "must not be empty"));
        }
        if let Some(recorded) = project.namespace.as_deref() {
            let derived = ResourceNamer::namespace(project.id);
            if recorded != derived {
                return Err(Error::validation_for_field(
                    "project.namespace",
                    format!("recorded {recorded} but project maps to {derived}"),
                ));
            }
        }
        if !is_valid_slug(&project.slug) {
            return Err(Error::validation_for_field(
                "project.slug",
                format!(
                    "{:?} must be lowercase alphanumerics and '-', at most {MAX_SLUG_LEN} characters",
                    project.slug
                ),
            ));
        }

        let mut ids = HashSet::new();
        let mut workloads = HashSet::new();
        for c in containers {
            if c.id.is_nil() {
                return Err(Error::validation_for_field("container.id", "must not be nil"));
            }
            if c.project_id != project.id {
                return Err(Error::validation_for_field(
                    "container.project_id",
                    format!("container {} belongs to project {}", c.id, c.project_id),
                ));
            }
            if c.name.trim().is_empty() {
                return Err(Error::validation_for_field(
                    "container.name",
                    format!("container {} has no name", c.id),
                ));
            }
            if c.image.trim().is_empty() {
                return Err(Error::validation_for_field(
                    "container.image",
                    format!("container {} has no image", c.name),
                ));
            }
            if c.internal_port == 0 {
                return Err(Error::validation_for_field(
                    "container.internal_port",
                    format!("container {} has no internal port", c.name),
                ));
            }
            if !is_relative_subpath(&c.directory) {
                return Err(Error::validation_for_field(
                    "container.directory",
                    format!("{:?} escapes the project volume", c.directory),
                ));
            }
            if !ids.insert(c.id) {
                return Err(Error::validation_for_field(
                    "container.id",
                    format!("duplicate container id {}", c.id),
                ));
            }
            let names = ResourceNamer::names(project.id, &c.name);
            if !workloads.insert(names.workload.clone()) {
                return Err(Error::validation_for_field(
                    "container.name",
                    format!("workload name {} is used by two containers", names.workload),
                ));
            }
            if let Some(recorded) = c.workload_name.as_deref() {
                if recorded != names.workload {
                    return Err(Error::validation_for_field(
                        "container.workload_name",
                        format!(
                            "recorded {recorded} but container {} maps to {}",
                            c.name, names.workload
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Whether a directory stays inside the volume (`..` is rejected)
fn is_relative_subpath(dir: &str) -> bool {
    Path::new(dir.trim_start_matches('/'))
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

// =============================================================================
// Tests
// =============================================================================
