//! Per-project transition locks
//!
//! Only one lifecycle transition may run for a project at a time. Distinct
//! projects never contend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::config::LockPolicy;
use crate::{Error, Result};

/// Lock table keyed by project id
#[derive(Clone, Default)]
pub struct ProjectLocks {
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    in_flight: Arc<DashMap<Uuid, &'static str>>,
    policy: LockPolicy,
}

/// Held for the duration of a transition
///
/// Dropping the last guard of a project with no queued waiters removes its
/// lock entry, so the table only holds projects with work in flight.
pub struct ProjectGuard {
    project: Uuid,
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    in_flight: Arc<DashMap<Uuid, &'static str>>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for ProjectGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.project);
        // Only the table and this guard reference the mutex
        self.locks
            .remove_if(&self.project, |_, lock| Arc::strong_count(lock) <= 2);
    }
}

impl ProjectLocks {
    /// Lock table with the given contention policy
    pub fn new(policy: LockPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    fn lock_for(&self, project: Uuid) -> Arc<Mutex<()>> {
        self.locks.entry(project).or_default().clone()
    }

    fn busy(&self, project: Uuid) -> Error {
        let operation = self
            .in_flight
            .get(&project)
            .map(|op| *op)
            .unwrap_or("transition");
        Error::busy(project, operation)
    }

    fn guard(&self, project: Uuid, operation: &'static str, guard: OwnedMutexGuard<()>) -> ProjectGuard {
        self.in_flight.insert(project, operation);
        ProjectGuard {
            project,
            locks: self.locks.clone(),
            in_flight: self.in_flight.clone(),
            _guard: guard,
        }
    }

    /// Acquire the project's lock according to the configured policy
    ///
    /// With [`LockPolicy::Wait`] the call queues behind the in-flight
    /// transition; with [`LockPolicy::Reject`] it fails with [`Error::Busy`].
    pub async fn acquire(&self, project: Uuid, operation: &'static str) -> Result<ProjectGuard> {
        match self.policy {
            LockPolicy::Reject => self.try_acquire(project, operation),
            LockPolicy::Wait => {
                let lock = self.lock_for(project);
                let guard = match lock.clone().try_lock_owned() {
                    Ok(guard) => guard,
                    Err(_) => {
                        debug!(project = %project, operation, "waiting for in-flight transition");
                        lock.lock_owned().await
                    }
                };
                Ok(self.guard(project, operation, guard))
            }
        }
    }

    /// Acquire the project's lock or fail with [`Error::Busy`]
    pub fn try_acquire(&self, project: Uuid, operation: &'static str) -> Result<ProjectGuard> {
        let guard = self
            .lock_for(project)
            .try_lock_owned()
            .map_err(|_| self.busy(project))?;
        Ok(self.guard(project, operation, guard))
    }

    /// Whether a transition is in flight for the project
    pub fn is_busy(&self, project: Uuid) -> bool {
        self.in_flight.contains_key(&project)
    }

    /// Number of projects with a lock entry
    pub fn tracked(&self) -> usize {
        self.locks.len()
    }
}
