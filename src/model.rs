//! Project, container and connection records
//!
//! These records are owned by the persistence collaborator. The engine reads
//! them and writes back only the lifecycle fields (environment status,
//! timestamps, archive size, container status).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Environment lifecycle state of a project
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    /// Resources exist and workloads are running
    #[default]
    Active,
    /// Workloads are terminating and the volume is being archived
    Hibernating,
    /// Only the archive remains; the volume and workloads are gone
    Hibernated,
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Hibernating => write!(f, "hibernating"),
            Self::Hibernated => write!(f, "hibernated"),
        }
    }
}

/// Runtime status of a single container
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// No workload is running
    #[default]
    Stopped,
    /// Workload applied, waiting for readiness
    Starting,
    /// Workload ready
    Running,
    /// Workload failed after retries (degraded or fatal)
    Error,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Role of a container in the project graph
///
/// Determines resource sizing and whether the container gets an external
/// route.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRole {
    /// User-facing application container (dev server, API)
    #[default]
    Application,
    /// Infrastructure container (database, cache, queue)
    Service,
}

/// A project owning a graph of containers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Project id
    pub id: Uuid,
    /// Owning user id
    pub user_id: Uuid,
    /// URL-safe project slug
    pub slug: String,
    /// Network namespace name recorded for this project; must match the
    /// derived namespace when set
    #[serde(default)]
    pub namespace: Option<String>,
    /// Environment lifecycle state
    #[serde(default)]
    pub environment_status: EnvironmentStatus,
    /// Last time a request referenced this project
    pub last_activity: DateTime<Utc>,
    /// When the project last reached `hibernated`
    #[serde(default)]
    pub hibernated_at: Option<DateTime<Utc>>,
    /// Size of the latest archive object
    #[serde(default)]
    pub archive_size_bytes: Option<u64>,
}

/// A container node in a project graph
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// Container id
    pub id: Uuid,
    /// Owning project id
    pub project_id: Uuid,
    /// Base template this container was created from
    #[serde(default)]
    pub base_id: Option<Uuid>,
    /// Display name
    pub name: String,
    /// Container image
    pub image: String,
    /// Subdirectory of the shared volume owned by this container
    pub directory: String,
    /// Generated workload name recorded by the persistence layer; must match
    /// the derived workload name when set
    #[serde(default)]
    pub workload_name: Option<String>,
    /// Externally exposed port
    #[serde(default)]
    pub port: Option<u16>,
    /// Port the process binds inside the pod
    pub internal_port: u16,
    /// Environment variables configured by the user
    #[serde(default)]
    pub environment_vars: BTreeMap<String, String>,
    /// Role in the project graph
    #[serde(default)]
    pub role: ContainerRole,
    /// Graph layout x coordinate (cosmetic)
    #[serde(default)]
    pub position_x: f64,
    /// Graph layout y coordinate (cosmetic)
    #[serde(default)]
    pub position_y: f64,
    /// Runtime status
    #[serde(default)]
    pub status: ContainerStatus,
    /// When the workload was last started
    #[serde(default)]
    pub last_started_at: Option<DateTime<Utc>>,
}

impl Container {
    /// Whether this container gets an external routing rule
    pub fn is_user_facing(&self) -> bool {
        self.role == ContainerRole::Application && self.port.is_some()
    }
}

/// Default connection type for container edges
pub const DEFAULT_CONNECTION_TYPE: &str = "depends_on";

fn default_connection_type() -> String {
    DEFAULT_CONNECTION_TYPE.to_string()
}

/// Directed edge between two containers
///
/// `source -> target` means the target consumes the source: the target gets
/// service-discovery variables pointing at the source, and the source is
/// started first when ordering is possible.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContainerConnection {
    /// Connection id
    pub id: Uuid,
    /// Owning project id
    pub project_id: Uuid,
    /// Providing container
    pub source_container_id: Uuid,
    /// Consuming container
    pub target_container_id: Uuid,
    /// Connection type
    #[serde(default = "default_connection_type")]
    pub connection_type: String,
    /// Optional label shown in the graph editor
    #[serde(default)]
    pub label: Option<String>,
}

/// Lifecycle fields the engine writes back for a project
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnvironmentUpdate {
    /// New environment status
    pub environment_status: Option<EnvironmentStatus>,
    /// New last activity timestamp
    pub last_activity: Option<DateTime<Utc>>,
    /// New hibernation timestamp (`Some(None)` clears it)
    pub hibernated_at: Option<Option<DateTime<Utc>>>,
    /// New archive size
    pub archive_size_bytes: Option<u64>,
}

impl EnvironmentUpdate {
    /// Update that only changes the status
    pub fn status(status: EnvironmentStatus) -> Self {
        Self {
            environment_status: Some(status),
            ..Default::default()
        }
    }

    /// Apply this update to a project record
    pub fn apply_to(&self, project: &mut Project) {
        if let Some(status) = self.environment_status {
            project.environment_status = status;
        }
        if let Some(at) = self.last_activity {
            project.last_activity = at;
        }
        if let Some(at) = self.hibernated_at {
            project.hibernated_at = at;
        }
        if let Some(size) = self.archive_size_bytes {
            project.archive_size_bytes = Some(size);
        }
    }
}
