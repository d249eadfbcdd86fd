//! External routing rules for user-facing containers
//!
//! A container is user-facing when it is an application container with an
//! exposed port. It gets a `networking.k8s.io/v1` Ingress keyed by a
//! deterministic host (`<container>-<slug>.<base domain>`) that routes to the
//! container's Service.

use serde::{Deserialize, Serialize};

use crate::cluster::{impl_api_defaults, HasApiResource};
use crate::config::EngineConfig;
use crate::model::{Container, Project};
use crate::naming::{host_for, ResourceNamer};
use crate::workload::ObjectMeta;
use crate::{LABEL_CONTAINER, LABEL_PROJECT};

// =============================================================================
// Ingress Types
// =============================================================================

/// Kubernetes Ingress
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ingress {
    /// API version (networking.k8s.io/v1)
    #[serde(default = "Ingress::default_api_version")]
    pub api_version: String,
    /// Resource kind (Ingress)
    #[serde(default = "Ingress::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// Ingress specification
    pub spec: IngressSpec,
}

impl HasApiResource for Ingress {
    const API_VERSION: &'static str = "networking.k8s.io/v1";
    const KIND: &'static str = "Ingress";
}

impl_api_defaults!(Ingress);

/// Ingress spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// Ingress class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,
    /// Host rules
    pub rules: Vec<IngressRule>,
}

/// Host rule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    /// Host to match
    pub host: String,
    /// HTTP paths
    pub http: HttpIngressRuleValue,
}

/// HTTP rule value
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpIngressRuleValue {
    /// Paths
    pub paths: Vec<HttpIngressPath>,
}

/// Path routed to a backend
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpIngressPath {
    /// Path prefix
    pub path: String,
    /// Path match type
    pub path_type: String,
    /// Backend
    pub backend: IngressBackend,
}

/// Backend of a path
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressBackend {
    /// Service backend
    pub service: IngressServiceBackend,
}

/// Service backend
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressServiceBackend {
    /// Service name
    pub name: String,
    /// Service port
    pub port: ServiceBackendPort,
}

/// Service port reference
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBackendPort {
    /// Port number
    pub number: u16,
}

// =============================================================================
// Compiler
// =============================================================================

/// Compiler for external routing rules
pub struct IngressCompiler;

impl IngressCompiler {
    /// Compile the routing rule for a container, if it is user-facing
    pub fn compile(
        project: &Project,
        container: &Container,
        config: &EngineConfig,
    ) -> Option<Ingress> {
        if !container.is_user_facing() {
            return None;
        }

        let names = ResourceNamer::names(project.id, &container.name);
        let host = host_for(&project.slug, &container.name, &config.base_domain);

        Some(Ingress {
            api_version: Ingress::default_api_version(),
            kind: Ingress::default_kind(),
            metadata: ObjectMeta::new(&names.ingress, &names.namespace)
                .with_label(LABEL_PROJECT, project.id.to_string())
                .with_label(LABEL_CONTAINER, container.id.to_string()),
            spec: IngressSpec {
                ingress_class_name: Some(config.ingress_class.clone()),
                rules: vec![IngressRule {
                    host,
                    http: HttpIngressRuleValue {
                        paths: vec![HttpIngressPath {
                            path: "/".to_string(),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: IngressServiceBackend {
                                    name: names.service,
                                    port: ServiceBackendPort {
                                        number: container.internal_port,
                                    },
                                },
                            },
                        }],
                    },
                }],
            },
        })
    }
}
