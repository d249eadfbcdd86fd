//! In-memory [`ClusterApi`] fake
//!
//! Models the semantics the reconciler relies on:
//! - create returns `Conflict` when the object exists, `NotFound` when its
//!   namespace does not
//! - delete returns `NotFound` when absent; deleting a namespace removes
//!   everything in it
//! - workloads report ready replicas immediately unless auto-ready is off
//! - pods exist for every replica of every workload until scaled or deleted
//!
//! Faults can be injected per operation (optionally per object name), either
//! for a number of calls or permanently. Termination hooks fire whenever a
//! running workload is scaled to zero or deleted, which lets tests stand in
//! for the in-pod dehydration hook.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{ApiError, ClusterApi, Manifest, ResourceKind, ResourceRef, ResourceStatus};

/// Operation selector for fault injection and call accounting
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FakeOp {
    /// [`ClusterApi::get`]
    Get,
    /// [`ClusterApi::create`]
    Create,
    /// [`ClusterApi::delete`]
    Delete,
    /// [`ClusterApi::scale`]
    Scale,
    /// [`ClusterApi::pod_count`]
    PodCount,
}

/// Callback fired when a running workload terminates
pub type TerminationHook = Arc<dyn Fn(&ResourceRef) + Send + Sync>;

#[derive(Clone, Debug)]
struct Fault {
    op: FakeOp,
    name: Option<String>,
    error: ApiError,
    remaining: Option<u32>,
}

#[derive(Clone, Debug)]
struct StoredObject {
    manifest: Manifest,
    replicas: u32,
    ready: u32,
    pod_labels: BTreeMap<String, String>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceRef, StoredObject>,
    faults: Vec<Fault>,
    creates: BTreeMap<ResourceRef, u32>,
    calls: BTreeMap<FakeOp, usize>,
    manual_ready: bool,
    held_pods: BTreeMap<String, usize>,
}

impl State {
    fn check_fault(&mut self, op: FakeOp, name: &str) -> Result<(), ApiError> {
        *self.calls.entry(op).or_default() += 1;
        let fault = self.faults.iter_mut().find(|f| {
            f.op == op
                && f.name.as_deref().map_or(true, |n| n == name)
                && f.remaining != Some(0)
        });
        match fault {
            Some(f) => {
                if let Some(n) = f.remaining.as_mut() {
                    *n -= 1;
                }
                Err(f.error.clone())
            }
            None => Ok(()),
        }
    }

    fn ready_for(&self, replicas: u32) -> u32 {
        if self.manual_ready {
            0
        } else {
            replicas
        }
    }
}

/// In-memory control plane
#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<State>,
    hooks: Mutex<Vec<TerminationHook>>,
}

impl InMemoryCluster {
    /// Empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire_hooks(&self, terminated: &[ResourceRef]) {
        if terminated.is_empty() {
            return;
        }
        let hooks: Vec<TerminationHook> = self
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for r in terminated {
            for hook in &hooks {
                hook(r);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Fault injection
    // -------------------------------------------------------------------------

    /// Fail the next `times` calls of `op` with `error`
    pub fn fail_times(&self, op: FakeOp, error: ApiError, times: u32) {
        self.state().faults.push(Fault {
            op,
            name: None,
            error,
            remaining: Some(times),
        });
    }

    /// Fail every call of `op` on objects named `name`
    pub fn fail_always(&self, op: FakeOp, name: impl Into<String>, error: ApiError) {
        self.state().faults.push(Fault {
            op,
            name: Some(name.into()),
            error,
            remaining: None,
        });
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    /// When set, workloads report zero ready replicas until [`Self::set_ready`]
    pub fn set_manual_ready(&self, manual: bool) {
        self.state().manual_ready = manual;
    }

    /// Set the ready replica count of a workload
    pub fn set_ready(&self, resource: &ResourceRef, ready: u32) {
        if let Some(obj) = self.state().objects.get_mut(resource) {
            obj.ready = ready;
        }
    }

    /// Keep `count` extra pods alive in a namespace (simulates slow termination)
    pub fn hold_pods(&self, namespace: impl Into<String>, count: usize) {
        self.state().held_pods.insert(namespace.into(), count);
    }

    /// Register a callback for workload termination
    pub fn on_termination(&self, hook: impl Fn(&ResourceRef) + Send + Sync + 'static) {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Whether an object exists
    pub fn exists(&self, resource: &ResourceRef) -> bool {
        self.state().objects.contains_key(resource)
    }

    /// Stored manifest of an object
    pub fn manifest(&self, resource: &ResourceRef) -> Option<Manifest> {
        self.state().objects.get(resource).map(|o| o.manifest.clone())
    }

    /// Current replica count of a workload
    pub fn replicas(&self, resource: &ResourceRef) -> Option<u32> {
        self.state().objects.get(resource).map(|o| o.replicas)
    }

    /// Number of successful creates of an object
    pub fn create_count(&self, resource: &ResourceRef) -> u32 {
        self.state().creates.get(resource).copied().unwrap_or(0)
    }

    /// Number of calls made for an operation (failed ones included)
    pub fn calls(&self, op: FakeOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// All stored objects of a kind
    pub fn objects(&self, kind: ResourceKind) -> Vec<ResourceRef> {
        self.state()
            .objects
            .keys()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get(&self, resource: &ResourceRef) -> Result<Option<ResourceStatus>, ApiError> {
        let mut state = self.state();
        state.check_fault(FakeOp::Get, &resource.name)?;
        Ok(state.objects.get(resource).map(|o| ResourceStatus {
            replicas: o.replicas,
            ready_replicas: o.ready,
            terminating: false,
            phase: match resource.kind {
                ResourceKind::Namespace => Some("Active".to_string()),
                ResourceKind::PersistentVolumeClaim => Some("Bound".to_string()),
                _ => None,
            },
        }))
    }

    async fn create(&self, manifest: &Manifest) -> Result<(), ApiError> {
        let resource = manifest.resource_ref();
        let mut state = self.state();
        state.check_fault(FakeOp::Create, &resource.name)?;

        if let Some(ns) = &resource.namespace {
            if !state.objects.contains_key(&ResourceRef::namespace(ns.clone())) {
                return Err(ApiError::NotFound(format!("namespaces \"{ns}\" not found")));
            }
        }
        if state.objects.contains_key(&resource) {
            return Err(ApiError::Conflict(format!("{resource} already exists")));
        }

        let replicas = manifest.replicas().unwrap_or(0);
        let pod_labels = match manifest {
            Manifest::Deployment(d) => d.spec.template.metadata.labels.clone(),
            _ => BTreeMap::new(),
        };
        let ready = state.ready_for(replicas);
        state.objects.insert(
            resource.clone(),
            StoredObject {
                manifest: manifest.clone(),
                replicas,
                ready,
                pod_labels,
            },
        );
        *state.creates.entry(resource).or_default() += 1;
        Ok(())
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), ApiError> {
        let terminated = {
            let mut state = self.state();
            state.check_fault(FakeOp::Delete, &resource.name)?;

            let Some(removed) = state.objects.remove(resource) else {
                return Err(ApiError::NotFound(format!("{resource} not found")));
            };

            let mut terminated = Vec::new();
            if resource.kind == ResourceKind::Deployment && removed.replicas > 0 {
                terminated.push(resource.clone());
            }
            if resource.kind == ResourceKind::Namespace {
                let contained: Vec<ResourceRef> = state
                    .objects
                    .keys()
                    .filter(|r| r.namespace.as_deref() == Some(resource.name.as_str()))
                    .cloned()
                    .collect();
                for r in contained {
                    if let Some(obj) = state.objects.remove(&r) {
                        if r.kind == ResourceKind::Deployment && obj.replicas > 0 {
                            terminated.push(r);
                        }
                    }
                }
                state.held_pods.remove(&resource.name);
            }
            terminated
        };
        self.fire_hooks(&terminated);
        Ok(())
    }

    async fn scale(&self, resource: &ResourceRef, replicas: u32) -> Result<(), ApiError> {
        let terminated = {
            let mut state = self.state();
            state.check_fault(FakeOp::Scale, &resource.name)?;
            let ready = state.ready_for(replicas);
            let Some(obj) = state.objects.get_mut(resource) else {
                return Err(ApiError::NotFound(format!("{resource} not found")));
            };
            let was_running = obj.replicas > 0;
            obj.replicas = replicas;
            obj.ready = ready;
            if let Manifest::Deployment(d) = &mut obj.manifest {
                d.spec.replicas = replicas;
            }
            was_running && replicas == 0
        };
        if terminated {
            self.fire_hooks(std::slice::from_ref(resource));
        }
        Ok(())
    }

    async fn pod_count(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<usize, ApiError> {
        let mut state = self.state();
        state.check_fault(FakeOp::PodCount, namespace)?;
        let running: u32 = state
            .objects
            .iter()
            .filter(|(r, _)| {
                r.kind == ResourceKind::Deployment && r.namespace.as_deref() == Some(namespace)
            })
            .filter(|(_, o)| labels.iter().all(|(k, v)| o.pod_labels.get(k) == Some(v)))
            .map(|(_, o)| o.replicas)
            .sum();
        let held = state.held_pods.get(namespace).copied().unwrap_or(0);
        Ok(running as usize + held)
    }
}
