//! Lifecycle controllers for project environments
//!
//! - [`environment`] brings environments up, records activity and tears them down
//! - [`hibernation`] archives idle environments and restores them on demand
//!
//! Both share one [`Context`] holding the injected capabilities, the
//! per-project locks and the bounded worker pool.

pub mod environment;
pub mod hibernation;
pub mod lock;

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::cluster::ClusterApi;
use crate::config::EngineConfig;
use crate::persistence::ProjectStore;
use crate::progress::{ProgressSink, TracingProgressSink};
use crate::reconciler::Reconciler;
use crate::routing::RoutingGenerator;
use crate::storage::ObjectStore;
use crate::{Error, Result};

pub use environment::{EnvironmentController, EnvironmentReport};
pub use hibernation::{HibernationController, HibernationOutcome, IdleCheckReport};
pub use lock::{ProjectGuard, ProjectLocks};

/// Shared state for lifecycle operations
pub struct Context {
    /// Control-plane capability
    pub cluster: Arc<dyn ClusterApi>,
    /// Archive storage capability
    pub store: Arc<dyn ObjectStore>,
    /// Project records
    pub projects: Arc<dyn ProjectStore>,
    /// Progress event sink
    pub progress: Arc<dyn ProgressSink>,
    /// Engine configuration
    pub config: Arc<EngineConfig>,
    /// Manifest applier
    pub reconciler: Reconciler,
    /// Edge routing writer
    pub routing: RoutingGenerator,
    /// Per-project transition locks
    pub locks: ProjectLocks,
    workers: Arc<Semaphore>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        cluster: Arc<dyn ClusterApi>,
        store: Arc<dyn ObjectStore>,
        projects: Arc<dyn ProjectStore>,
    ) -> ContextBuilder {
        ContextBuilder {
            cluster,
            store,
            projects,
            progress: None,
            config: EngineConfig::default(),
        }
    }

    /// Reserve a slot in the worker pool
    pub async fn worker(&self) -> Result<OwnedSemaphorePermit> {
        self.workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::internal_with_context("worker_pool", e.to_string()))
    }

    /// Free slots in the worker pool
    pub fn idle_workers(&self) -> usize {
        self.workers.available_permits()
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    cluster: Arc<dyn ClusterApi>,
    store: Arc<dyn ObjectStore>,
    projects: Arc<dyn ProjectStore>,
    progress: Option<Arc<dyn ProgressSink>>,
    config: EngineConfig,
}

impl ContextBuilder {
    /// Set the engine configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the progress sink (defaults to logging)
    pub fn progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Validate the configuration and build the context
    pub fn build(self) -> Result<Context> {
        self.config.validate()?;
        let reconciler = Reconciler::new(
            self.cluster.clone(),
            self.config.retry(),
            self.config.poll_interval(),
        );
        Ok(Context {
            reconciler,
            routing: RoutingGenerator::new(&self.config),
            locks: ProjectLocks::new(self.config.lock_policy),
            workers: Arc::new(Semaphore::new(self.config.max_concurrent_operations)),
            cluster: self.cluster,
            store: self.store,
            projects: self.projects,
            progress: self
                .progress
                .unwrap_or_else(|| Arc::new(TracingProgressSink)),
            config: Arc::new(self.config),
        })
    }
}
