//! Namespace isolation policy
//!
//! Every project namespace gets one default-deny `NetworkPolicy` selecting all
//! of its pods. It permits:
//!
//! - **Ingress** from pods in the same namespace and from the ingress
//!   controller's namespace
//! - **Egress** to pods in the same namespace, to cluster DNS, and to the
//!   configured external CIDRs (object storage, registries) minus private
//!   ranges, so a project can never reach another project's namespace
//!
//! For whole-project compilation, use [`crate::compiler::ProjectCompiler`].

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::cluster::{impl_api_defaults, HasApiResource};
use crate::config::EngineConfig;
use crate::model::Project;
use crate::naming::ResourceNamer;
use crate::workload::{LabelSelector, ObjectMeta};
use crate::LABEL_PROJECT;

/// Well-known label carrying a namespace's own name
pub const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

/// Namespace running cluster DNS
pub const DNS_NAMESPACE: &str = "kube-system";

/// DNS port
pub const DNS_PORT: u16 = 53;

// =============================================================================
// NetworkPolicy
// =============================================================================

/// Kubernetes NetworkPolicy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicy {
    /// API version
    #[serde(default = "NetworkPolicy::default_api_version")]
    pub api_version: String,
    /// Kind
    #[serde(default = "NetworkPolicy::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: NetworkPolicySpec,
}

impl HasApiResource for NetworkPolicy {
    const API_VERSION: &'static str = "networking.k8s.io/v1";
    const KIND: &'static str = "NetworkPolicy";
}

impl_api_defaults!(NetworkPolicy);

/// NetworkPolicy spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicySpec {
    /// Pods the policy applies to (empty selects all pods in the namespace)
    pub pod_selector: LabelSelector,
    /// Directions the policy restricts
    pub policy_types: Vec<String>,
    /// Allowed inbound traffic
    #[serde(default)]
    pub ingress: Vec<NetworkPolicyIngressRule>,
    /// Allowed outbound traffic
    #[serde(default)]
    pub egress: Vec<NetworkPolicyEgressRule>,
}

/// Inbound rule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyIngressRule {
    /// Allowed sources
    pub from: Vec<NetworkPolicyPeer>,
}

/// Outbound rule
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyEgressRule {
    /// Allowed destinations
    pub to: Vec<NetworkPolicyPeer>,
    /// Allowed ports (empty allows all)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<NetworkPolicyPort>,
}

/// Traffic peer
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyPeer {
    /// Pods (in the policy's namespace unless combined with a namespace selector)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,
    /// Namespaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
    /// CIDR block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_block: Option<IpBlock>,
}

/// CIDR block with exceptions
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IpBlock {
    /// CIDR
    pub cidr: String,
    /// Excluded sub-ranges
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub except: Vec<String>,
}

/// Port and protocol
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyPort {
    /// Protocol (TCP, UDP)
    pub protocol: String,
    /// Port number
    pub port: u16,
}

// =============================================================================
// Policy Compiler
// =============================================================================

/// Compiler for the per-project isolation policy
pub struct PolicyCompiler;

impl PolicyCompiler {
    /// Compile the isolation policy for a project namespace
    pub fn compile(project: &Project, config: &EngineConfig) -> NetworkPolicy {
        let namespace = ResourceNamer::namespace(project.id);
        let same_namespace = NetworkPolicyPeer {
            pod_selector: Some(LabelSelector::default()),
            ..Default::default()
        };

        let ingress = vec![NetworkPolicyIngressRule {
            from: vec![
                same_namespace.clone(),
                Self::namespace_peer(&config.ingress_namespace),
            ],
        }];

        let mut egress = vec![
            NetworkPolicyEgressRule {
                to: vec![same_namespace],
                ports: vec![],
            },
            NetworkPolicyEgressRule {
                to: vec![Self::namespace_peer(DNS_NAMESPACE)],
                ports: vec![
                    NetworkPolicyPort {
                        protocol: "UDP".to_string(),
                        port: DNS_PORT,
                    },
                    NetworkPolicyPort {
                        protocol: "TCP".to_string(),
                        port: DNS_PORT,
                    },
                ],
            },
        ];

        let external: Vec<NetworkPolicyPeer> = config
            .egress_cidrs
            .iter()
            .map(|cidr| NetworkPolicyPeer {
                ip_block: Some(IpBlock {
                    cidr: cidr.clone(),
                    except: config
                        .egress_except_cidrs
                        .iter()
                        .filter(|ex| cidr_strictly_contains(cidr, ex))
                        .cloned()
                        .collect(),
                }),
                ..Default::default()
            })
            .collect();
        if !external.is_empty() {
            egress.push(NetworkPolicyEgressRule {
                to: external,
                ports: vec![],
            });
        }

        NetworkPolicy {
            api_version: NetworkPolicy::default_api_version(),
            kind: NetworkPolicy::default_kind(),
            metadata: ObjectMeta::new(ResourceNamer::network_policy(project.id), namespace)
                .with_label(LABEL_PROJECT, project.id.to_string()),
            spec: NetworkPolicySpec {
                pod_selector: LabelSelector::default(),
                policy_types: vec!["Ingress".to_string(), "Egress".to_string()],
                ingress,
                egress,
            },
        }
    }

    fn namespace_peer(name: &str) -> NetworkPolicyPeer {
        NetworkPolicyPeer {
            namespace_selector: Some(LabelSelector {
                match_labels: BTreeMap::from([(
                    NAMESPACE_NAME_LABEL.to_string(),
                    name.to_string(),
                )]),
            }),
            ..Default::default()
        }
    }
}

/// Parse an IPv4 CIDR into (network, prefix length)
fn parse_cidr(cidr: &str) -> Option<(u32, u8)> {
    let (addr, len) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let len: u8 = len.parse().ok()?;
    (len <= 32).then_some((u32::from(addr), len))
}

fn mask(len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(len))
    }
}

/// Whether `inner` is a strict sub-range of `outer` (IPv4 only)
///
/// The API server rejects `except` entries outside the block, so anything
/// unparseable is treated as not contained.
fn cidr_strictly_contains(outer: &str, inner: &str) -> bool {
    let (Some((o_addr, o_len)), Some((i_addr, i_len))) = (parse_cidr(outer), parse_cidr(inner))
    else {
        return false;
    };
    i_len > o_len && (i_addr & mask(o_len)) == (o_addr & mask(o_len))
}
