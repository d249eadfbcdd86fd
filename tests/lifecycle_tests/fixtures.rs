//! Shared setup for lifecycle stories

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use canopy::archive;
use canopy::cluster::fake::InMemoryCluster;
use canopy::cluster::ResourceRef;
use canopy::config::{EngineConfig, LockPolicy};
use canopy::controller::{Context, EnvironmentController, HibernationController};
use canopy::model::{
    Container, ContainerConnection, ContainerRole, ContainerStatus, EnvironmentStatus, Project,
    DEFAULT_CONNECTION_TYPE,
};
use canopy::naming::ResourceNamer;
use canopy::persistence::{InMemoryProjectStore, ProjectStore};
use canopy::storage::archive_key;
use canopy::storage::memory::InMemoryObjectStore;

pub fn project(slug: &str, last_activity: DateTime<Utc>) -> Project {
    Project {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        slug: slug.to_string(),
        namespace: None,
        environment_status: EnvironmentStatus::Active,
        last_activity,
        hibernated_at: None,
        archive_size_bytes: None,
    }
}

pub fn container(project: &Project, name: &str, port: u16, role: ContainerRole) -> Container {
    Container {
        id: Uuid::new_v4(),
        project_id: project.id,
        base_id: None,
        name: name.to_string(),
        image: "node:20-alpine".to_string(),
        directory: name.to_string(),
        workload_name: None,
        port: Some(port),
        internal_port: port,
        environment_vars: BTreeMap::new(),
        role,
        position_x: 0.0,
        position_y: 0.0,
        status: ContainerStatus::Stopped,
        last_started_at: None,
    }
}

pub fn connection(source: &Container, target: &Container) -> ContainerConnection {
    ContainerConnection {
        id: Uuid::new_v4(),
        project_id: source.project_id,
        source_container_id: source.id,
        target_container_id: target.id,
        connection_type: DEFAULT_CONNECTION_TYPE.to_string(),
        label: None,
    }
}

/// Config with second-scale timeouts and millisecond polling
pub fn fast_config(routing_file: PathBuf) -> EngineConfig {
    EngineConfig {
        base_domain: "dev.example.com".to_string(),
        idle_threshold_secs: 30 * 60,
        ready_timeout_secs: 2,
        terminate_timeout_secs: 2,
        archive_timeout_secs: 1,
        poll_interval_ms: 5,
        apply_max_attempts: 3,
        retry_initial_delay_ms: 1,
        retry_max_delay_ms: 5,
        routing_file,
        ..Default::default()
    }
}

/// A project store, fakes and controllers wired together
pub struct Env {
    pub cluster: Arc<InMemoryCluster>,
    pub store: Arc<InMemoryObjectStore>,
    pub projects: Arc<InMemoryProjectStore>,
    pub ctx: Arc<Context>,
    pub environments: EnvironmentController,
    pub hibernation: HibernationController,
    pub dir: tempfile::TempDir,
}

impl Env {
    pub fn new() -> Self {
        Self::with(|_| {})
    }

    pub fn with_policy(policy: LockPolicy) -> Self {
        Self::with(|c| c.lock_policy = policy)
    }

    pub fn with(tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config(dir.path().join("dynamic").join("regions.yaml"));
        tweak(&mut config);

        let cluster = Arc::new(InMemoryCluster::new());
        let store = Arc::new(InMemoryObjectStore::new());
        let projects = Arc::new(InMemoryProjectStore::default());
        let ctx = Arc::new(
            Context::builder(cluster.clone(), store.clone(), projects.clone())
                .config(config)
                .build()
                .unwrap(),
        );

        Self {
            environments: EnvironmentController::new(ctx.clone()),
            hibernation: HibernationController::new(ctx.clone()),
            cluster,
            store,
            projects,
            ctx,
            dir,
        }
    }

    /// Register a project with a frontend, an api and a database
    pub fn web_app(&self, slug: &str, last_activity: DateTime<Utc>) -> Project {
        let p = project(slug, last_activity);
        let frontend = container(&p, "frontend", 5173, ContainerRole::Application);
        let api = container(&p, "api", 8080, ContainerRole::Application);
        let db = container(&p, "db", 5432, ContainerRole::Service);
        let connections = vec![connection(&db, &api), connection(&api, &frontend)];
        self.projects
            .insert(p.clone(), vec![frontend, api, db], connections);
        p
    }

    pub async fn stored(&self, id: Uuid) -> Project {
        self.projects.get_project(id).await.unwrap()
    }

    pub async fn containers(&self, id: Uuid) -> Vec<Container> {
        self.projects.containers(id).await.unwrap()
    }

    pub fn workload(&self, p: &Project, container_name: &str) -> ResourceRef {
        let names = ResourceNamer::names(p.id, container_name);
        ResourceRef::namespaced(
            canopy::cluster::ResourceKind::Deployment,
            names.namespace,
            names.workload,
        )
    }

    pub fn volume(&self, p: &Project) -> ResourceRef {
        ResourceRef::namespaced(
            canopy::cluster::ResourceKind::PersistentVolumeClaim,
            ResourceNamer::namespace(p.id),
            ResourceNamer::volume(p.id),
        )
    }

    /// Archive a marker object whenever a workload terminates
    pub fn archive_on_termination(&self, p: &Project) {
        let store = self.store.clone();
        let key = archive_key(p.user_id, p.id);
        self.cluster
            .on_termination(move |_| store.insert(key.clone(), b"snapshot".to_vec()));
    }

    /// Archive `volume` through the real codec whenever a workload terminates
    pub fn dehydrate_volume_on_termination(&self, p: &Project, volume: PathBuf) {
        let store = self.store.clone();
        let key = archive_key(p.user_id, p.id);
        self.cluster.on_termination(move |_| {
            let bytes = archive::pack_dir(&volume).unwrap();
            store.insert(key.clone(), bytes);
        });
    }
}
