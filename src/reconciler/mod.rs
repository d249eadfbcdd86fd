//! Cluster reconciler
//!
//! Applies compiled manifests with create-if-absent semantics and provides the
//! explicit waits the lifecycle controllers depend on.
//!
//! - read first; create only when absent
//! - a conflict on create means a concurrent creator won, which is success
//! - transient failures are retried with capped exponential backoff; running
//!   out of attempts marks that one resource degraded
//! - fatal failures (quota, permissions, malformed objects) are never retried
//!
//! Within a plan the shared resources (namespace, volume, isolation policy)
//! go first. When any of them fails no container is attempted. Container
//! failures are isolated: one container failing never stops its siblings.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::cluster::{ApiError, ClusterApi, Manifest, ResourceRef};
use crate::compiler::ProjectManifests;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

// =============================================================================
// Results
// =============================================================================

/// Outcome of applying one manifest
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyResult {
    /// The object did not exist and was created
    Created {
        /// Applied object
        resource: ResourceRef,
        /// Attempts used
        attempts: u32,
    },
    /// The object already existed (or a concurrent creator made it)
    Unchanged {
        /// Applied object
        resource: ResourceRef,
    },
    /// Transient failures exhausted the retry budget
    Degraded {
        /// Applied object
        resource: ResourceRef,
        /// Last error observed
        error: ApiError,
        /// Attempts used
        attempts: u32,
    },
    /// A non-retryable failure
    Fatal {
        /// Applied object
        resource: ResourceRef,
        /// The failure
        error: ApiError,
    },
}

impl ApplyResult {
    /// The object this result is about
    pub fn resource(&self) -> &ResourceRef {
        match self {
            Self::Created { resource, .. }
            | Self::Unchanged { resource }
            | Self::Degraded { resource, .. }
            | Self::Fatal { resource, .. } => resource,
        }
    }

    /// Whether the object now exists
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Created { .. } | Self::Unchanged { .. })
    }

    /// Failure cause, if any
    pub fn error(&self) -> Option<&ApiError> {
        match self {
            Self::Degraded { error, .. } | Self::Fatal { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Per-container outcome of a plan
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainerOutcome {
    /// All of the container's objects exist
    Applied,
    /// At least one object ran out of retries
    Degraded(String),
    /// At least one object failed fatally
    Failed(String),
    /// Not attempted because a shared resource failed
    Skipped,
}

/// Report for one container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerReport {
    /// Container id
    pub container_id: Uuid,
    /// Container name
    pub container_name: String,
    /// Workload of the container
    pub workload: ResourceRef,
    /// Results per object
    pub results: Vec<ApplyResult>,
    /// Summary outcome
    pub outcome: ContainerOutcome,
}

impl ContainerReport {
    fn summarize(results: &[ApplyResult]) -> ContainerOutcome {
        let mut degraded = None;
        for r in results {
            match r {
                ApplyResult::Fatal { resource, error } => {
                    return ContainerOutcome::Failed(format!("{resource}: {error}"));
                }
                ApplyResult::Degraded {
                    resource, error, ..
                } if degraded.is_none() => {
                    degraded = Some(format!("{resource}: {error}"));
                }
                _ => {}
            }
        }
        degraded.map_or(ContainerOutcome::Applied, ContainerOutcome::Degraded)
    }
}

/// Structured result of applying a project plan
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlanReport {
    /// Results for namespace, volume and policy
    pub shared: Vec<ApplyResult>,
    /// Per-container reports in startup order
    pub containers: Vec<ContainerReport>,
}

impl PlanReport {
    /// Whether all shared resources exist
    pub fn shared_ok(&self) -> bool {
        self.shared.iter().all(ApplyResult::is_success)
    }

    /// Whether every object was applied
    pub fn is_complete(&self) -> bool {
        self.shared_ok()
            && self
                .containers
                .iter()
                .all(|c| c.outcome == ContainerOutcome::Applied)
    }

    /// Containers whose objects all exist
    pub fn applied(&self) -> impl Iterator<Item = &ContainerReport> {
        self.containers
            .iter()
            .filter(|c| c.outcome == ContainerOutcome::Applied)
    }

    /// Containers that did not apply cleanly
    pub fn unapplied(&self) -> impl Iterator<Item = &ContainerReport> {
        self.containers
            .iter()
            .filter(|c| c.outcome != ContainerOutcome::Applied)
    }

    /// First shared failure, if any
    pub fn shared_error(&self) -> Option<&ApplyResult> {
        self.shared.iter().find(|r| !r.is_success())
    }
}

// =============================================================================
// Polling
// =============================================================================

/// Poll until a condition is met or the timeout is reached
///
/// `check_fn` returns `Ok(true)` when the condition holds and `Ok(false)` to
/// keep polling. Retryable errors are logged and polling continues;
/// non-retryable errors end the poll.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    what: impl Into<String>,
    mut check_fn: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = tokio::time::Instant::now();
    let what = what.into();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!(what = %what, "condition not yet met"),
            Err(e) if e.is_retryable() => trace!(what = %what, error = %e, "poll check failed, retrying"),
            Err(e) => return Err(e),
        }

        if start.elapsed() >= timeout {
            return Err(Error::timeout(what));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Applies manifests and waits on cluster state
#[derive(Clone)]
pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    retry: RetryConfig,
    poll_interval: Duration,
}

impl Reconciler {
    /// Create a reconciler over a control-plane capability
    pub fn new(cluster: Arc<dyn ClusterApi>, retry: RetryConfig, poll_interval: Duration) -> Self {
        Self {
            cluster,
            retry,
            poll_interval,
        }
    }

    /// The control-plane capability
    pub fn cluster(&self) -> &Arc<dyn ClusterApi> {
        &self.cluster
    }

    /// Apply one manifest with create-if-absent semantics
    #[instrument(skip(self, manifest), fields(resource = %manifest.resource_ref()))]
    pub async fn apply(&self, manifest: &Manifest) -> ApplyResult {
        let resource = manifest.resource_ref();
        let cluster = &self.cluster;
        let target = &resource;

        let result = retry_with_backoff(
            &self.retry,
            &format!("apply {resource}"),
            ApiError::is_transient,
            move || async move {
                if cluster.get(target).await?.is_some() {
                    return Ok::<bool, ApiError>(false);
                }
                match cluster.create(manifest).await {
                    Ok(()) => Ok(true),
                    Err(ApiError::Conflict(msg)) => {
                        debug!(resource = %target, %msg, "created concurrently");
                        Ok(false)
                    }
                    Err(e) => Err(e),
                }
            },
        )
        .await;

        match result {
            Ok((true, attempts)) => {
                info!(resource = %resource, attempts, "created");
                ApplyResult::Created { resource, attempts }
            }
            Ok((false, _)) => ApplyResult::Unchanged { resource },
            Err(e) if e.error.is_transient() => {
                warn!(resource = %resource, attempts = e.attempts, error = %e.error, "apply degraded");
                ApplyResult::Degraded {
                    resource,
                    error: e.error,
                    attempts: e.attempts,
                }
            }
            Err(e) => {
                warn!(resource = %resource, error = %e.error, "apply failed");
                ApplyResult::Fatal {
                    resource,
                    error: e.error,
                }
            }
        }
    }

    /// Apply a whole project plan
    ///
    /// Shared resources are applied in order and must all succeed before any
    /// container is attempted. Containers are applied in startup order.
    #[instrument(skip(self, plan), fields(namespace = %plan.namespace.metadata.name))]
    pub async fn apply_plan(&self, plan: &ProjectManifests) -> PlanReport {
        let mut report = PlanReport::default();

        for manifest in plan.shared() {
            let result = self.apply(&manifest).await;
            let ok = result.is_success();
            report.shared.push(result);
            if !ok {
                break;
            }
        }
        let shared_ok = report.shared.len() == plan.shared().len() && report.shared_ok();

        for container in &plan.containers {
            let (results, outcome) = if shared_ok {
                let mut results = Vec::new();
                for manifest in container.manifests() {
                    results.push(self.apply(&manifest).await);
                }
                let outcome = ContainerReport::summarize(&results);
                (results, outcome)
            } else {
                (Vec::new(), ContainerOutcome::Skipped)
            };
            report.containers.push(ContainerReport {
                container_id: container.container_id,
                container_name: container.container_name.clone(),
                workload: container.workload_ref(),
                results,
                outcome,
            });
        }

        debug!(
            complete = report.is_complete(),
            applied = report.applied().count(),
            "applied plan"
        );
        report
    }

    /// Set the replica count of a workload, retrying transient failures
    pub async fn scale(&self, resource: &ResourceRef, replicas: u32) -> Result<()> {
        let cluster = &self.cluster;
        retry_with_backoff(
            &self.retry,
            &format!("scale {resource}"),
            ApiError::is_transient,
            move || async move { cluster.scale(resource, replicas).await },
        )
        .await
        .map_err(|e| Error::from(e.error))?;
        debug!(resource = %resource, replicas, "scaled");
        Ok(())
    }

    /// Delete an object and wait until it is gone
    ///
    /// An object that is already absent counts as deleted.
    #[instrument(skip(self), fields(resource = %resource))]
    pub async fn delete_and_wait(&self, resource: &ResourceRef, timeout: Duration) -> Result<()> {
        let cluster = &self.cluster;
        let deleted = retry_with_backoff(
            &self.retry,
            &format!("delete {resource}"),
            ApiError::is_transient,
            move || async move { cluster.delete(resource).await },
        )
        .await;
        match deleted {
            Ok(_) => {}
            Err(e) if e.error.is_not_found() => {
                debug!(resource = %resource, "already deleted");
                return Ok(());
            }
            Err(e) => return Err(e.error.into()),
        }

        poll_until(
            timeout,
            self.poll_interval,
            format!("deletion of {resource}"),
            move || async move { Ok::<_, Error>(cluster.get(resource).await?.is_none()) },
        )
        .await?;
        info!(resource = %resource, "deleted");
        Ok(())
    }

    /// Wait until at least `min_ready` of the workloads report a ready replica
    ///
    /// Returns the workloads that were ready when the condition was met.
    pub async fn wait_ready(
        &self,
        workloads: &[ResourceRef],
        min_ready: usize,
        timeout: Duration,
    ) -> Result<Vec<ResourceRef>> {
        let start = tokio::time::Instant::now();
        loop {
            let mut ready = Vec::new();
            for w in workloads {
                match self.cluster.get(w).await {
                    Ok(Some(status)) if status.has_ready_replica() => ready.push(w.clone()),
                    Ok(_) => {}
                    Err(e) if e.is_transient() => {
                        trace!(resource = %w, error = %e, "readiness check failed, retrying")
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if ready.len() >= min_ready {
                return Ok(ready);
            }
            if start.elapsed() >= timeout {
                return Err(Error::timeout(format!(
                    "{min_ready} ready workload(s), {} ready",
                    ready.len()
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Wait until no pod matching the labels remains in the namespace
    pub async fn wait_terminated(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<()> {
        let cluster = &self.cluster;
        poll_until(
            timeout,
            self.poll_interval,
            format!("pod termination in {namespace}"),
            move || async move { Ok::<_, Error>(cluster.pod_count(namespace, labels).await? == 0) },
        )
        .await
    }
}
