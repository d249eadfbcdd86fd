//! Environment lifecycle: start, activity tracking, teardown
//!
//! Starting resolves the container graph, compiles the project, applies the
//! plan and waits for at least one workload to become ready. Cluster failures
//! never surface as a bare error: the caller gets an [`EnvironmentReport`]
//! saying which containers applied, which degraded and which failed.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{hibernation, Context};
use crate::cluster::ResourceRef;
use crate::compiler::ProjectCompiler;
use crate::graph::{self, StartupOrder};
use crate::model::{ContainerStatus, EnvironmentStatus, EnvironmentUpdate, Project};
use crate::naming::ResourceNamer;
use crate::progress::ProgressTracker;
use crate::reconciler::{ContainerOutcome, PlanReport};
use crate::retry::retry_with_backoff;
use crate::storage::{archive_key, StorageError};
use crate::{Error, Result};

const START_STEPS: u32 = 4;

/// Result of bringing an environment up
#[derive(Clone, Debug, PartialEq)]
pub struct EnvironmentReport {
    /// Progress operation id
    pub operation_id: Uuid,
    /// Project id
    pub project_id: Uuid,
    /// Environment status after the operation
    pub status: EnvironmentStatus,
    /// Startup order used
    pub order: StartupOrder,
    /// Per-resource apply results
    pub plan: PlanReport,
    /// Containers that reported ready
    pub ready: Vec<Uuid>,
    /// Why readiness was not reached, if it was not
    pub readiness_error: Option<String>,
}

impl EnvironmentReport {
    /// Whether every resource applied and a workload became ready
    pub fn is_success(&self) -> bool {
        self.plan.is_complete() && self.readiness_error.is_none()
    }

    /// Containers that did not apply cleanly, with their outcome
    pub fn problems(&self) -> Vec<(String, ContainerOutcome)> {
        self.plan
            .unapplied()
            .map(|c| (c.container_name.clone(), c.outcome.clone()))
            .collect()
    }

    /// One-line description for progress and logs
    pub fn summary(&self) -> String {
        if let Some(shared) = self.plan.shared_error() {
            let cause = shared.error().map(ToString::to_string).unwrap_or_default();
            return format!("{}: {}", shared.resource(), cause);
        }
        let total = self.plan.containers.len();
        let applied = self.plan.applied().count();
        let mut out = format!(
            "{applied}/{total} containers applied, {} ready",
            self.ready.len()
        );
        if let Some(e) = &self.readiness_error {
            out.push_str(&format!(" ({e})"));
        }
        out
    }
}

/// What [`bring_up`] produced
pub(crate) struct BringUp {
    pub(crate) order: StartupOrder,
    pub(crate) plan: PlanReport,
    pub(crate) ready: Vec<Uuid>,
    pub(crate) readiness_error: Option<String>,
}

impl BringUp {
    pub(crate) fn into_report(
        self,
        operation_id: Uuid,
        project_id: Uuid,
        status: EnvironmentStatus,
    ) -> EnvironmentReport {
        EnvironmentReport {
            operation_id,
            project_id,
            status,
            order: self.order,
            plan: self.plan,
            ready: self.ready,
            readiness_error: self.readiness_error,
        }
    }
}

/// Resolve, compile, apply and wait for readiness
///
/// Emits three progress phases. Container statuses are written back as the
/// plan progresses.
pub(crate) async fn bring_up(
    ctx: &Context,
    project: &Project,
    tracker: &mut ProgressTracker<'_>,
) -> Result<BringUp> {
    tracker.phase("resolve");
    let containers = ctx.projects.containers(project.id).await?;
    let connections = ctx.projects.connections(project.id).await?;
    let resolved = graph::resolve(&containers, &connections);
    let manifests = ProjectCompiler::new(&ctx.config).compile(project, &containers, &resolved)?;

    tracker.phase("apply");
    let plan = ctx.reconciler.apply_plan(&manifests).await;
    for c in &plan.containers {
        let status = match c.outcome {
            ContainerOutcome::Applied => ContainerStatus::Starting,
            _ => {
                warn!(project = %project.id, container = %c.container_name, outcome = ?c.outcome, "container not applied");
                ContainerStatus::Error
            }
        };
        ctx.projects
            .update_container_status(c.container_id, status, None)
            .await?;
    }

    tracker.phase("wait");
    let applied: Vec<(Uuid, ResourceRef)> = plan
        .applied()
        .map(|c| (c.container_id, c.workload.clone()))
        .collect();
    let mut ready = Vec::new();
    let mut readiness_error = None;

    if applied.is_empty() {
        readiness_error = Some("no container was applied".to_string());
    } else {
        let workloads: Vec<ResourceRef> = applied.iter().map(|(_, w)| w.clone()).collect();
        match ctx
            .reconciler
            .wait_ready(&workloads, 1, ctx.config.ready_timeout())
            .await
        {
            Ok(ready_workloads) => {
                let now = Utc::now();
                for (id, workload) in &applied {
                    if ready_workloads.contains(workload) {
                        ready.push(*id);
                        ctx.projects
                            .update_container_status(*id, ContainerStatus::Running, Some(now))
                            .await?;
                    }
                }
            }
            Err(e) => {
                warn!(project = %project.id, error = %e, "no workload became ready");
                readiness_error = Some(e.to_string());
            }
        }
    }

    Ok(BringUp {
        order: resolved.order,
        plan,
        ready,
        readiness_error,
    })
}

/// Starts, touches and tears down project environments
#[derive(Clone)]
pub struct EnvironmentController {
    ctx: Arc<Context>,
}

impl EnvironmentController {
    /// Controller over a shared context
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// The shared context
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Bring a project's environment up
    ///
    /// Hibernated (or stuck hibernating) projects are resumed. Already-applied
    /// resources are left in place when the caller cancels.
    #[instrument(skip(self), fields(project = %project_id))]
    pub async fn start(&self, project_id: Uuid) -> Result<EnvironmentReport> {
        let ctx = &self.ctx;
        let _guard = ctx.locks.acquire(project_id, "start").await?;
        let _permit = ctx.worker().await?;
        let project = ctx.projects.get_project(project_id).await?;

        if project.environment_status != EnvironmentStatus::Active {
            return hibernation::resume_locked(ctx, &project).await;
        }

        let mut tracker = ProgressTracker::new(ctx.progress.as_ref(), project.id, START_STEPS);
        let up = match bring_up(ctx, &project, &mut tracker).await {
            Ok(up) => up,
            Err(e) => {
                tracker.fail(e.to_string());
                return Err(e);
            }
        };

        tracker.phase("record");
        if let Err(e) = ctx
            .projects
            .update_environment(
                project.id,
                EnvironmentUpdate {
                    last_activity: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
        {
            tracker.fail(e.to_string());
            return Err(e);
        }

        let report = up.into_report(tracker.operation_id(), project.id, EnvironmentStatus::Active);
        if report.is_success() {
            tracker.succeed();
        } else {
            tracker.fail(report.summary());
        }
        info!(summary = %report.summary(), "start finished");
        Ok(report)
    }

    /// Record activity on a project, resuming it when it is not active
    ///
    /// Returns the resume report when a resume was needed.
    #[instrument(skip(self), fields(project = %project_id))]
    pub async fn touch(&self, project_id: Uuid) -> Result<Option<EnvironmentReport>> {
        let project = self
            .ctx
            .projects
            .update_environment(
                project_id,
                EnvironmentUpdate {
                    last_activity: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        if project.environment_status == EnvironmentStatus::Active {
            return Ok(None);
        }
        self.start(project_id).await.map(Some)
    }

    /// Delete every cluster resource of a project
    ///
    /// Deleting the namespace cascades to everything in it. With
    /// `purge_archive` the archive object is removed as well. The routing file
    /// is rewritten without the project.
    #[instrument(skip(self), fields(project = %project_id))]
    pub async fn teardown(&self, project_id: Uuid, purge_archive: bool) -> Result<()> {
        let ctx = &self.ctx;
        let guard = ctx.locks.acquire(project_id, "teardown").await?;
        let _permit = ctx.worker().await?;
        let project = ctx.projects.get_project(project_id).await?;

        let namespace = ResourceRef::namespace(ResourceNamer::namespace(project.id));
        ctx.reconciler
            .delete_and_wait(&namespace, ctx.config.terminate_timeout())
            .await?;

        for container in ctx.projects.containers(project.id).await? {
            ctx.projects
                .update_container_status(container.id, ContainerStatus::Stopped, None)
                .await?;
        }

        if purge_archive {
            let key = archive_key(project.user_id, project.id);
            let store = &ctx.store;
            let key_ref = key.as_str();
            retry_with_backoff(
                &ctx.config.retry(),
                "purge archive",
                StorageError::is_retryable,
                move || async move { store.delete(key_ref).await },
            )
            .await
            .map_err(|e| Error::from(e.error))?;
            info!(key = %key, "purged archive");
        }

        drop(guard);

        let remaining: Vec<String> = ctx
            .projects
            .list_projects()
            .await?
            .into_iter()
            .filter(|p| p.id != project_id)
            .map(|p| p.slug)
            .collect();
        self.write_routes(remaining).await?;
        info!("teardown finished");
        Ok(())
    }

    /// Rewrite the routing file from the current project set
    ///
    /// Called by the API layer whenever a project is created or deleted.
    pub async fn refresh_routes(&self) -> Result<Vec<String>> {
        self.ctx.routing.regenerate(self.ctx.projects.as_ref()).await
    }

    async fn write_routes(&self, slugs: Vec<String>) -> Result<()> {
        let routing = self.ctx.routing.clone();
        tokio::task::spawn_blocking(move || routing.write(&slugs))
            .await
            .map_err(|e| Error::internal_with_context("routing", e.to_string()))?
    }
}
