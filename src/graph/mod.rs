//! Project graph resolution
//!
//! Turns the container/connection model into:
//! - a best-effort startup order (Kahn's algorithm over connection edges)
//! - service-discovery endpoints each container consumes
//!
//! An edge `source -> target` means the target consumes the source. The target
//! receives `<SOURCE>_HOST`, `<SOURCE>_PORT` and `<SOURCE>_URL` variables, and
//! the source sorts before the target when the graph is acyclic. A cycle is not
//! an error: the order falls back to declaration order and the cycle is
//! reported as [`StartupOrder::CycleDetected`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::warn;
use uuid::Uuid;

use crate::model::{Container, ContainerConnection};
use crate::naming::ResourceNamer;

/// Best-effort startup ordering
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartupOrder {
    /// Topological order over the connection edges
    Ordered(Vec<Uuid>),
    /// The edges contain a cycle; `fallback` is declaration order
    CycleDetected {
        /// Declaration order used instead
        fallback: Vec<Uuid>,
        /// Containers that could not be ordered (members of or behind a cycle)
        cycle: Vec<Uuid>,
    },
}

impl StartupOrder {
    /// The order to use, whichever variant this is
    pub fn ids(&self) -> &[Uuid] {
        match self {
            Self::Ordered(ids) => ids,
            Self::CycleDetected { fallback, .. } => fallback,
        }
    }

    /// Whether a cycle was detected
    pub fn has_cycle(&self) -> bool {
        matches!(self, Self::CycleDetected { .. })
    }
}

/// An internal endpoint a container depends on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// Container providing the endpoint
    pub container_id: Uuid,
    /// Environment variable prefix derived from the provider's name
    pub env_prefix: String,
    /// In-cluster host (the provider's service name)
    pub host: String,
    /// Provider's internal port
    pub port: u16,
}

impl ServiceEndpoint {
    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `http://host:port`
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Result of resolving a project graph
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPlan {
    /// Startup ordering hint
    pub order: StartupOrder,
    /// Endpoints each container consumes
    pub dependencies: BTreeMap<Uuid, Vec<ServiceEndpoint>>,
}

impl ResolvedPlan {
    /// Position of a container in the startup order
    pub fn position(&self, container_id: Uuid) -> Option<usize> {
        self.order.ids().iter().position(|id| *id == container_id)
    }

    /// Endpoints consumed by a container
    pub fn endpoints_for(&self, container_id: Uuid) -> &[ServiceEndpoint] {
        self.dependencies
            .get(&container_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Service-discovery environment variables for a container
    pub fn discovery_env(&self, container_id: Uuid) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for endpoint in self.endpoints_for(container_id) {
            env.insert(format!("{}_HOST", endpoint.env_prefix), endpoint.host.clone());
            env.insert(format!("{}_PORT", endpoint.env_prefix), endpoint.port.to_string());
            env.insert(format!("{}_URL", endpoint.env_prefix), endpoint.url());
        }
        env
    }
}

/// Environment variable prefix for a container name (`my-api` -> `MY_API`)
pub fn env_prefix(container_name: &str) -> String {
    let mut out = String::with_capacity(container_name.len());
    for ch in container_name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        return "SERVICE".to_string();
    }
    if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        return format!("SVC_{trimmed}");
    }
    trimmed.to_string()
}

/// Resolve a project graph into ordering hints and discovery endpoints
pub fn resolve(containers: &[Container], connections: &[ContainerConnection]) -> ResolvedPlan {
    let index: HashMap<Uuid, usize> = containers
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id, i))
        .collect();

    // Valid, de-duplicated edges as (source index, target index)
    let mut edges: BTreeSet<(usize, usize)> = BTreeSet::new();
    for conn in connections {
        let (Some(&src), Some(&dst)) = (
            index.get(&conn.source_container_id),
            index.get(&conn.target_container_id),
        ) else {
            warn!(
                connection = %conn.id,
                "connection references a container outside the project, ignoring"
            );
            continue;
        };
        if src == dst {
            warn!(connection = %conn.id, "self-referencing connection, ignoring");
            continue;
        }
        edges.insert((src, dst));
    }

    let order = startup_order(containers, &edges);

    let mut dependencies: BTreeMap<Uuid, Vec<ServiceEndpoint>> = BTreeMap::new();
    for &(src, dst) in &edges {
        let provider = &containers[src];
        let consumer = &containers[dst];
        let names = ResourceNamer::names(provider.project_id, &provider.name);
        dependencies
            .entry(consumer.id)
            .or_default()
            .push(ServiceEndpoint {
                container_id: provider.id,
                env_prefix: env_prefix(&provider.name),
                host: names.service,
                port: provider.internal_port,
            });
    }

    ResolvedPlan {
        order,
        dependencies,
    }
}

/// Kahn's algorithm; ties broken by declaration order
fn startup_order(containers: &[Container], edges: &BTreeSet<(usize, usize)>) -> StartupOrder {
    let n = containers.len();
    let mut in_degree = vec![0usize; n];
    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); n];
    for &(src, dst) in edges {
        in_degree[dst] += 1;
        outgoing[src].push(dst);
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut ordered = Vec::with_capacity(n);
    while let Some(next) = ready.pop_first() {
        ordered.push(next);
        for &dst in &outgoing[next] {
            in_degree[dst] -= 1;
            if in_degree[dst] == 0 {
                ready.insert(dst);
            }
        }
    }

    if ordered.len() == n {
        return StartupOrder::Ordered(ordered.into_iter().map(|i| containers[i].id).collect());
    }

    let placed: HashSet<usize> = ordered.into_iter().collect();
    let cycle: Vec<Uuid> = (0..n)
        .filter(|i| !placed.contains(i))
        .map(|i| containers[i].id)
        .collect();
    warn!(
        unordered = cycle.len(),
        "cycle detected in container connections, falling back to declaration order"
    );
    StartupOrder::CycleDetected {
        fallback: containers.iter().map(|c| c.id).collect(),
        cycle,
    }
}
