//! Hibernation controller
//!
//! State machine per project:
//!
//! ```text
//! active --idle/admin--> hibernating --archive confirmed--> hibernated
//!    ^                        |                                  |
//!    +------ resume ----------+------------- resume -------------+
//! ```
//!
//! Hibernating scales every workload to zero, which runs the in-pod
//! dehydration hook, then waits for the pods to disappear and for a fresh
//! archive object. Only then are the workloads and the shared volume deleted.
//! If anything fails before that point the volume is kept, the project stays
//! `hibernating`, and the next check cycle tries again.
//!
//! A hibernation cycle runs on its own task so a cancelled caller can never
//! interrupt it halfway through an archive.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use futures::future::join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use super::environment::{bring_up, EnvironmentReport};
use super::{Context, ProjectGuard};
use crate::cluster::{Manifest, ResourceRef};
use crate::compiler::{ProjectCompiler, ProjectManifests};
use crate::graph;
use crate::model::{ContainerStatus, EnvironmentStatus, EnvironmentUpdate, Project};
use crate::progress::ProgressTracker;
use crate::storage::{archive_key, ObjectInfo};
use crate::workload::project_selector;
use crate::{Error, Result};

const HIBERNATE_STEPS: u32 = 5;
const RESUME_STEPS: u32 = 5;

/// How a hibernation request ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HibernationOutcome {
    /// Archive confirmed, volume released
    Hibernated {
        /// Confirmed archive size
        archive_size_bytes: u64,
    },
    /// The project was already hibernated
    AlreadyHibernated,
    /// Activity arrived after the idle check; nothing was done
    StillActive,
    /// The project has no containers, so nothing can produce an archive
    NothingToArchive,
}

/// Result of one idle check cycle
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdleCheckReport {
    /// Projects considered
    pub checked: usize,
    /// Projects hibernated in this cycle
    pub hibernated: Vec<Uuid>,
    /// Projects skipped because another transition held them
    pub busy: Vec<Uuid>,
    /// Candidates that needed no work
    pub skipped: Vec<Uuid>,
    /// Projects whose hibernation failed, with the cause
    pub failed: Vec<(Uuid, String)>,
}

/// Whether a project has been idle longer than the threshold
pub fn is_idle(project: &Project, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
    now.signed_duration_since(project.last_activity) > threshold
}

fn compile(ctx: &Context, project: &Project, containers: &[crate::model::Container]) -> Result<ProjectManifests> {
    let plan = graph::resolve(containers, &[]);
    ProjectCompiler::new(&ctx.config).compile(project, containers, &plan)
}

async fn mark_containers(ctx: &Context, project: &Project, status: ContainerStatus) -> Result<()> {
    for container in ctx.projects.containers(project.id).await? {
        ctx.projects
            .update_container_status(container.id, status, None)
            .await?;
    }
    Ok(())
}

/// Scale workloads, skipping ones that no longer exist
///
/// Returns the workloads that were scaled.
async fn scale_existing(
    ctx: &Context,
    workloads: &[ResourceRef],
    replicas: u32,
) -> Result<Vec<ResourceRef>> {
    let mut scaled = Vec::new();
    for w in workloads {
        match ctx.reconciler.scale(w, replicas).await {
            Ok(()) => scaled.push(w.clone()),
            Err(Error::Cluster { source }) if source.is_not_found() => {
                debug!(resource = %w, "workload absent, not scaling");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(scaled)
}

/// Poll the archive object until one at least as new as `floor` exists
async fn confirm_archive(
    ctx: &Context,
    key: &str,
    floor: Option<DateTime<Utc>>,
) -> Result<ObjectInfo> {
    let timeout = ctx.config.archive_timeout();
    let start = tokio::time::Instant::now();
    loop {
        match ctx.store.head(key).await {
            Ok(Some(info)) if floor.map_or(true, |f| info.last_modified >= f) => return Ok(info),
            Ok(Some(info)) => {
                trace!(key, last_modified = %info.last_modified, "archive predates this cycle")
            }
            Ok(None) => trace!(key, "archive not written yet"),
            Err(e) if e.is_retryable() => warn!(key, error = %e, "archive check failed, retrying"),
            Err(e) => return Err(e.into()),
        }
        if start.elapsed() >= timeout {
            return Err(Error::timeout(format!("fresh archive at {key}")));
        }
        tokio::time::sleep(ctx.config.poll_interval()).await;
    }
}

/// Delete every workload, then the shared volume
async fn release(ctx: &Context, manifests: &ProjectManifests) -> Result<()> {
    for w in &manifests.workload_refs() {
        ctx.reconciler
            .delete_and_wait(w, ctx.config.terminate_timeout())
            .await?;
    }
    let volume = Manifest::Volume(manifests.volume.clone()).resource_ref();
    ctx.reconciler
        .delete_and_wait(&volume, ctx.config.terminate_timeout())
        .await
}

/// Terminate, confirm the archive, release the volume and record the result
async fn run_cycle(
    ctx: &Context,
    project: &Project,
    manifests: &ProjectManifests,
    tracker: &mut ProgressTracker<'_>,
) -> Result<u64> {
    let was_hibernating = project.environment_status == EnvironmentStatus::Hibernating;
    let workloads = manifests.workload_refs();
    let volume = Manifest::Volume(manifests.volume.clone()).resource_ref();
    let namespace = manifests.namespace.metadata.name.clone();
    let key = archive_key(project.user_id, project.id);

    tracker.phase("mark");
    ctx.projects
        .update_environment(project.id, EnvironmentUpdate::status(EnvironmentStatus::Hibernating))
        .await?;

    tracker.phase("terminate");
    let volume_present = ctx.cluster.get(&volume).await?.is_some();
    let mut floor = Some(Utc::now().trunc_subsecs(0));

    if was_hibernating {
        // Retry of an earlier cycle: bring the workloads back so the
        // termination hook runs again against the live volume
        let restarted = if volume_present {
            scale_existing(ctx, &workloads, 1).await?
        } else {
            Vec::new()
        };
        if restarted.is_empty() {
            // Workloads and volume are only removed after an archive was confirmed
            info!(project = %project.id, "earlier cycle already released resources");
            floor = None;
        } else {
            ctx.reconciler
                .wait_ready(&restarted, restarted.len(), ctx.config.ready_timeout())
                .await?;
            floor = Some(Utc::now().trunc_subsecs(0));
        }
    }

    if floor.is_some() {
        scale_existing(ctx, &workloads, 0).await?;
        ctx.reconciler
            .wait_terminated(
                &namespace,
                &project_selector(project.id),
                ctx.config.terminate_timeout(),
            )
            .await?;
    }

    tracker.phase("confirm");
    let archive = confirm_archive(ctx, &key, floor).await?;
    info!(project = %project.id, key = %key, size = archive.size, "archive confirmed");

    tracker.phase("release");
    release(ctx, manifests).await?;

    tracker.phase("record");
    ctx.projects
        .update_environment(
            project.id,
            EnvironmentUpdate {
                environment_status: Some(EnvironmentStatus::Hibernated),
                hibernated_at: Some(Some(Utc::now())),
                archive_size_bytes: Some(archive.size),
                ..Default::default()
            },
        )
        .await?;
    mark_containers(ctx, project, ContainerStatus::Stopped).await?;
    Ok(archive.size)
}

/// Hibernate a project whose lock is held by the caller
///
/// With `idle_at` set, the project must still be idle at that instant;
/// activity recorded after the idle check cancels the transition.
async fn hibernate_locked(
    ctx: &Context,
    project_id: Uuid,
    idle_at: Option<DateTime<Utc>>,
) -> Result<HibernationOutcome> {
    let project = ctx.projects.get_project(project_id).await?;
    match project.environment_status {
        EnvironmentStatus::Hibernated => return Ok(HibernationOutcome::AlreadyHibernated),
        EnvironmentStatus::Active => {
            if let Some(now) = idle_at {
                if !is_idle(&project, now, ctx.config.idle_threshold()) {
                    return Ok(HibernationOutcome::StillActive);
                }
            }
        }
        EnvironmentStatus::Hibernating => {}
    }

    let containers = ctx.projects.containers(project.id).await?;
    if containers.is_empty() {
        debug!(project = %project.id, "no containers, nothing to archive");
        return Ok(HibernationOutcome::NothingToArchive);
    }
    let manifests = compile(ctx, &project, &containers)?;

    let mut tracker = ProgressTracker::new(ctx.progress.as_ref(), project.id, HIBERNATE_STEPS);
    match run_cycle(ctx, &project, &manifests, &mut tracker).await {
        Ok(size) => {
            tracker.succeed();
            info!(project = %project.id, archive_size_bytes = size, "project hibernated");
            Ok(HibernationOutcome::Hibernated {
                archive_size_bytes: size,
            })
        }
        Err(e) => {
            error!(
                alarm = true,
                project = %project.id,
                error = %e,
                "dehydration failed, volume kept; will retry next cycle"
            );
            tracker.fail(e.to_string());
            Err(Error::dehydration_failed(project.id, e.to_string()))
        }
    }
}

/// Resume a project whose lock is held by the caller
///
/// A hibernated project gets its volume and workloads recreated; hydration
/// restores the archive before the main processes start. A project stuck in
/// `hibernating` still has its volume, so its workloads are scaled back up.
/// The status flips to `active` only once a workload is ready. A hibernated
/// project where nothing becomes ready is released again, since its archive
/// still holds everything the fresh volume was restored from.
pub(crate) async fn resume_locked(ctx: &Context, project: &Project) -> Result<EnvironmentReport> {
    let mut tracker = ProgressTracker::new(ctx.progress.as_ref(), project.id, RESUME_STEPS);
    let result = resume_inner(ctx, project, &mut tracker).await;
    match &result {
        Ok(report) if report.is_success() => tracker.succeed(),
        Ok(report) => tracker.fail(report.summary()),
        Err(e) => tracker.fail(e.to_string()),
    }
    result
}

async fn resume_inner(
    ctx: &Context,
    project: &Project,
    tracker: &mut ProgressTracker<'_>,
) -> Result<EnvironmentReport> {
    tracker.phase("prepare");
    let containers = ctx.projects.containers(project.id).await?;
    let manifests = compile(ctx, project, &containers)?;
    if project.environment_status == EnvironmentStatus::Hibernating {
        let scaled = scale_existing(ctx, &manifests.workload_refs(), 1).await?;
        info!(project = %project.id, workloads = scaled.len(), "cancelled hibernation");
    }

    let up = bring_up(ctx, project, tracker).await?;

    tracker.phase("record");
    let status = if !up.ready.is_empty() {
        ctx.projects
            .update_environment(
                project.id,
                EnvironmentUpdate {
                    environment_status: Some(EnvironmentStatus::Active),
                    last_activity: Some(Utc::now()),
                    hibernated_at: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        info!(project = %project.id, "project resumed");
        EnvironmentStatus::Active
    } else if project.environment_status == EnvironmentStatus::Hibernated {
        warn!(project = %project.id, "nothing became ready, releasing the resumed environment");
        release(ctx, &manifests).await?;
        mark_containers(ctx, project, ContainerStatus::Stopped).await?;
        EnvironmentStatus::Hibernated
    } else {
        // Volume kept; the next check cycle finishes the hibernation
        warn!(project = %project.id, "nothing became ready, project stays hibernating");
        project.environment_status
    };

    Ok(up.into_report(tracker.operation_id(), project.id, status))
}

/// Drives idle detection and hibernation transitions
#[derive(Clone)]
pub struct HibernationController {
    ctx: Arc<Context>,
}

impl HibernationController {
    /// Controller over a shared context
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Run one hibernation cycle on its own task, holding `guard` throughout
    async fn spawn_cycle(
        &self,
        project_id: Uuid,
        guard: ProjectGuard,
        idle_at: Option<DateTime<Utc>>,
    ) -> Result<HibernationOutcome> {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let _permit = ctx.worker().await?;
            hibernate_locked(&ctx, project_id, idle_at).await
        })
        .await
        .map_err(|e| Error::internal_with_context("hibernate", e.to_string()))?
    }

    /// Hibernate a project on request, regardless of idleness
    #[instrument(skip(self), fields(project = %project_id))]
    pub async fn hibernate(&self, project_id: Uuid) -> Result<HibernationOutcome> {
        let guard = self.ctx.locks.acquire(project_id, "hibernate").await?;
        self.spawn_cycle(project_id, guard, None).await
    }

    /// Bring a hibernated or hibernating project back
    ///
    /// An active project is simply started.
    #[instrument(skip(self), fields(project = %project_id))]
    pub async fn resume(&self, project_id: Uuid) -> Result<EnvironmentReport> {
        let _guard = self.ctx.locks.acquire(project_id, "resume").await?;
        let _permit = self.ctx.worker().await?;
        let project = self.ctx.projects.get_project(project_id).await?;
        resume_locked(&self.ctx, &project).await
    }

    /// Check every project for idleness as of now
    pub async fn check_idle(&self) -> Result<IdleCheckReport> {
        self.check_idle_at(Utc::now()).await
    }

    /// Check every project for idleness as of `now`
    ///
    /// Active projects idle for longer than the threshold and projects stuck
    /// in `hibernating` are hibernated concurrently. Projects with a
    /// transition in flight are skipped until the next cycle.
    pub async fn check_idle_at(&self, now: DateTime<Utc>) -> Result<IdleCheckReport> {
        let threshold = self.ctx.config.idle_threshold();
        let candidates: Vec<Uuid> = self
            .ctx
            .projects
            .list_projects()
            .await?
            .into_iter()
            .filter(|p| match p.environment_status {
                EnvironmentStatus::Active => is_idle(p, now, threshold),
                EnvironmentStatus::Hibernating => true,
                EnvironmentStatus::Hibernated => false,
            })
            .map(|p| p.id)
            .collect();

        let mut report = IdleCheckReport {
            checked: candidates.len(),
            ..Default::default()
        };

        let cycles = candidates.into_iter().map(|id| async move {
            let outcome = match self.ctx.locks.try_acquire(id, "hibernate") {
                Ok(guard) => self.spawn_cycle(id, guard, Some(now)).await,
                Err(e) => Err(e),
            };
            (id, outcome)
        });

        for (id, outcome) in join_all(cycles).await {
            match outcome {
                Ok(HibernationOutcome::Hibernated { .. }) => report.hibernated.push(id),
                Ok(_) => report.skipped.push(id),
                Err(Error::Busy { .. }) => report.busy.push(id),
                Err(e) => report.failed.push((id, e.to_string())),
            }
        }

        info!(
            checked = report.checked,
            hibernated = report.hibernated.len(),
            busy = report.busy.len(),
            failed = report.failed.len(),
            "idle check finished"
        );
        Ok(report)
    }

    /// Run idle checks on the configured interval until cancelled
    ///
    /// Cancellation stops scheduling new checks; hibernation cycles already
    /// running finish on their own tasks.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.ctx.config.check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.ctx.config.check_interval_secs,
            threshold_secs = self.ctx.config.idle_threshold_secs,
            "idle checker started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("idle checker stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.check_idle().await {
                        warn!(error = %e, "idle check failed");
                    }
                }
            }
        }
    }
}
