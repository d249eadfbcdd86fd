//! Persistence collaborator
//!
//! Project, container and connection records are owned elsewhere. The engine
//! reads them through [`ProjectStore`] and writes back only lifecycle fields.
//! Two implementations ship with the crate: an in-memory store for tests and
//! embedding, and a JSON snapshot file used by the CLI.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::model::{
    Container, ContainerConnection, ContainerStatus, EnvironmentUpdate, Project,
};
use crate::routing::write_atomic;
use crate::{Error, Result};

/// Read and write-back operations on project records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Load a project; [`Error::NotFound`] when absent
    async fn get_project(&self, id: Uuid) -> Result<Project>;

    /// All projects
    async fn list_projects(&self) -> Result<Vec<Project>>;

    /// Containers of a project in declaration order
    async fn containers(&self, project_id: Uuid) -> Result<Vec<Container>>;

    /// Connections of a project
    async fn connections(&self, project_id: Uuid) -> Result<Vec<ContainerConnection>>;

    /// Write lifecycle fields back, returning the updated record
    async fn update_environment(&self, project_id: Uuid, update: EnvironmentUpdate)
        -> Result<Project>;

    /// Write a container's runtime status back
    async fn update_container_status(
        &self,
        container_id: Uuid,
        status: ContainerStatus,
        last_started_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

/// Serializable set of records
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    /// Projects
    #[serde(default)]
    pub projects: Vec<Project>,
    /// Containers of all projects
    #[serde(default)]
    pub containers: Vec<Container>,
    /// Connections of all projects
    #[serde(default)]
    pub connections: Vec<ContainerConnection>,
}

impl ProjectSnapshot {
    fn project(&self, id: Uuid) -> Result<&Project> {
        self.projects
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::not_found("project", id))
    }

    fn containers_of(&self, project_id: Uuid) -> Vec<Container> {
        self.containers
            .iter()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect()
    }

    fn connections_of(&self, project_id: Uuid) -> Vec<ContainerConnection> {
        self.connections
            .iter()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect()
    }

    fn update_environment(&mut self, project_id: Uuid, update: &EnvironmentUpdate) -> Result<Project> {
        let project = self
            .projects
            .iter_mut()
            .find(|p| p.id == project_id)
            .ok_or_else(|| Error::not_found("project", project_id))?;
        update.apply_to(project);
        Ok(project.clone())
    }

    fn update_container_status(
        &mut self,
        container_id: Uuid,
        status: ContainerStatus,
        last_started_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let container = self
            .containers
            .iter_mut()
            .find(|c| c.id == container_id)
            .ok_or_else(|| Error::not_found("container", container_id))?;
        container.status = status;
        if last_started_at.is_some() {
            container.last_started_at = last_started_at;
        }
        Ok(())
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Store holding records in memory
#[derive(Default)]
pub struct InMemoryProjectStore {
    snapshot: Mutex<ProjectSnapshot>,
}

impl InMemoryProjectStore {
    /// Store seeded with a snapshot
    pub fn new(snapshot: ProjectSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProjectSnapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace a project with its containers and connections
    pub fn insert(
        &self,
        project: Project,
        containers: Vec<Container>,
        connections: Vec<ContainerConnection>,
    ) {
        let mut snapshot = self.lock();
        let id = project.id;
        snapshot.projects.retain(|p| p.id != id);
        snapshot.containers.retain(|c| c.project_id != id);
        snapshot.connections.retain(|c| c.project_id != id);
        snapshot.projects.push(project);
        snapshot.containers.extend(containers);
        snapshot.connections.extend(connections);
    }

    /// Remove a project and its records
    pub fn remove(&self, project_id: Uuid) {
        let mut snapshot = self.lock();
        snapshot.projects.retain(|p| p.id != project_id);
        snapshot.containers.retain(|c| c.project_id != project_id);
        snapshot.connections.retain(|c| c.project_id != project_id);
    }

    /// Copy of all records
    pub fn snapshot(&self) -> ProjectSnapshot {
        self.lock().clone()
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn get_project(&self, id: Uuid) -> Result<Project> {
        self.lock().project(id).cloned()
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self.lock().projects.clone())
    }

    async fn containers(&self, project_id: Uuid) -> Result<Vec<Container>> {
        Ok(self.lock().containers_of(project_id))
    }

    async fn connections(&self, project_id: Uuid) -> Result<Vec<ContainerConnection>> {
        Ok(self.lock().connections_of(project_id))
    }

    async fn update_environment(
        &self,
        project_id: Uuid,
        update: EnvironmentUpdate,
    ) -> Result<Project> {
        self.lock().update_environment(project_id, &update)
    }

    async fn update_container_status(
        &self,
        container_id: Uuid,
        status: ContainerStatus,
        last_started_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.lock()
            .update_container_status(container_id, status, last_started_at)
    }
}

// =============================================================================
// JSON file store
// =============================================================================

/// Store backed by a JSON snapshot file, rewritten atomically on every update
pub struct JsonFileProjectStore {
    path: PathBuf,
    snapshot: tokio::sync::Mutex<ProjectSnapshot>,
}

impl JsonFileProjectStore {
    /// Open a snapshot file; a missing file starts empty
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ProjectSnapshot::default(),
            Err(e) => {
                return Err(Error::internal_with_context(
                    "persistence",
                    format!("reading {}: {}", path.display(), e),
                ))
            }
        };
        Ok(Self {
            path,
            snapshot: tokio::sync::Mutex::new(snapshot),
        })
    }

    /// Path of the snapshot file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, snapshot: &ProjectSnapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| Error::internal_with_context("persistence", e.to_string()))??;
        debug!(path = %self.path.display(), "saved project snapshot");
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for JsonFileProjectStore {
    async fn get_project(&self, id: Uuid) -> Result<Project> {
        self.snapshot.lock().await.project(id).cloned()
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self.snapshot.lock().await.projects.clone())
    }

    async fn containers(&self, project_id: Uuid) -> Result<Vec<Container>> {
        Ok(self.snapshot.lock().await.containers_of(project_id))
    }

    async fn connections(&self, project_id: Uuid) -> Result<Vec<ContainerConnection>> {
        Ok(self.snapshot.lock().await.connections_of(project_id))
    }

    async fn update_environment(
        &self,
        project_id: Uuid,
        update: EnvironmentUpdate,
    ) -> Result<Project> {
        let mut snapshot = self.snapshot.lock().await;
        let project = snapshot.update_environment(project_id, &update)?;
        self.save(&snapshot).await?;
        Ok(project)
    }

    async fn update_container_status(
        &self,
        container_id: Uuid,
        status: ContainerStatus,
        last_started_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        snapshot.update_container_status(container_id, status, last_started_at)?;
        self.save(&snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContainerRole, EnvironmentStatus};
    use std::collections::BTreeMap;

    fn project() -> Project {
        Project {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            slug: "notes".to_string(),
            namespace: None,
            environment_status: EnvironmentStatus::Active,
            last_activity: Utc::now(),
            hibernated_at: None,
            archive_size_bytes: None,
        }
    }

    fn container(project_id: Uuid, name: &str) -> Container {
        Container {
            id: Uuid::new_v4(),
            project_id,
            base_id: None,
            name: name.to_string(),
            image: "node:20".to_string(),
            directory: name.to_string(),
            workload_name: None,
            port: Some(3000),
            internal_port: 3000,
            environment_vars: BTreeMap::new(),
            role: ContainerRole::Application,
            position_x: 0.0,
            position_y: 0.0,
            status: ContainerStatus::Stopped,
            last_started_at: None,
        }
    }

    #[tokio::test]
    async fn story_containers_keep_declaration_order() {
        let p = project();
        let store = InMemoryProjectStore::default();
        let names = ["web", "api", "db"];
        store.insert(
            p.clone(),
            names.iter().map(|n| container(p.id, n)).collect(),
            vec![],
        );
        store.insert(project(), vec![container(Uuid::new_v4(), "other")], vec![]);

        let loaded: Vec<String> = store
            .containers(p.id)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(loaded, names);
    }

    #[tokio::test]
    async fn story_missing_project_is_not_found() {
        let store = InMemoryProjectStore::default();
        let err = store.get_project(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn story_json_store_persists_lifecycle_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("projects.json");
        let p = project();
        let c = container(p.id, "web");
        let snapshot = ProjectSnapshot {
            projects: vec![p.clone()],
            containers: vec![c.clone()],
            connections: vec![],
        };
        std::fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();

        let store = JsonFileProjectStore::open(&path).await.unwrap();
        store
            .update_environment(
                p.id,
                EnvironmentUpdate {
                    environment_status: Some(EnvironmentStatus::Hibernated),
                    archive_size_bytes: Some(1234),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update_container_status(c.id, ContainerStatus::Running, Some(Utc::now()))
            .await
            .unwrap();

        let reopened = JsonFileProjectStore::open(&path).await.unwrap();
        let loaded = reopened.get_project(p.id).await.unwrap();
        assert_eq!(loaded.environment_status, EnvironmentStatus::Hibernated);
        assert_eq!(loaded.archive_size_bytes, Some(1234));
        let containers = reopened.containers(p.id).await.unwrap();
        assert_eq!(containers[0].status, ContainerStatus::Running);
        assert!(containers[0].last_started_at.is_some());
    }

    #[tokio::test]
    async fn story_missing_snapshot_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileProjectStore::open(dir.path().join("none.json"))
            .await
            .unwrap();
        assert!(store.list_projects().await.unwrap().is_empty());
    }
}
