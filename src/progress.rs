//! Progress events for long-running lifecycle operations
//!
//! Each operation gets an id; every phase boundary emits a [`ProgressEvent`]
//! to the injected [`ProgressSink`]. The API layer polls or streams these to
//! users. The engine ships a tracing sink and a channel sink.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// State of an operation at the time of an event
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ProgressState {
    /// Still running
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished with a failure
    Failed {
        /// Failure cause
        message: String,
    },
}

/// One progress update
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    /// Operation id
    pub operation_id: Uuid,
    /// Project the operation acts on
    pub project_id: Uuid,
    /// Phase name (e.g. "apply", "archive")
    pub phase: String,
    /// Step reached, 1-based
    pub step: u32,
    /// Total steps of the operation
    pub total_steps: u32,
    /// Operation state
    #[serde(flatten)]
    pub state: ProgressState,
}

impl ProgressEvent {
    /// Completion in percent
    pub fn percent(&self) -> u8 {
        if self.total_steps == 0 {
            return 100;
        }
        let pct = u64::from(self.step.min(self.total_steps)) * 100 / u64::from(self.total_steps);
        pct as u8
    }

    /// Whether this is the last event of the operation
    pub fn is_terminal(&self) -> bool {
        !matches!(self.state, ProgressState::Running)
    }
}

/// Receiver of progress events
pub trait ProgressSink: Send + Sync {
    /// Deliver an event; must not block
    fn emit(&self, event: ProgressEvent);
}

/// Sink that logs events
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn emit(&self, event: ProgressEvent) {
        info!(
            operation = %event.operation_id,
            project = %event.project_id,
            phase = %event.phase,
            percent = event.percent(),
            state = ?event.state,
            "progress"
        );
    }
}

/// Sink forwarding events over an unbounded channel
#[derive(Clone, Debug)]
pub struct ChannelProgressSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgressSink {
    /// Create a sink and its receiving end
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgressSink {
    fn emit(&self, event: ProgressEvent) {
        // A dropped receiver only means nobody is watching
        let _ = self.tx.send(event);
    }
}

/// Emits the events of a single operation
pub struct ProgressTracker<'a> {
    sink: &'a dyn ProgressSink,
    operation_id: Uuid,
    project_id: Uuid,
    total_steps: u32,
    step: u32,
    phase: String,
}

impl<'a> ProgressTracker<'a> {
    /// Start tracking an operation with a fresh id
    pub fn new(sink: &'a dyn ProgressSink, project_id: Uuid, total_steps: u32) -> Self {
        Self {
            sink,
            operation_id: Uuid::new_v4(),
            project_id,
            total_steps,
            step: 0,
            phase: String::new(),
        }
    }

    /// Operation id
    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    fn event(&self, state: ProgressState) -> ProgressEvent {
        ProgressEvent {
            operation_id: self.operation_id,
            project_id: self.project_id,
            phase: self.phase.clone(),
            step: self.step,
            total_steps: self.total_steps,
            state,
        }
    }

    /// Enter the next phase
    pub fn phase(&mut self, name: &str) {
        self.step = (self.step + 1).min(self.total_steps);
        self.phase = name.to_string();
        self.sink.emit(self.event(ProgressState::Running));
    }

    /// Report success
    pub fn succeed(mut self) {
        self.step = self.total_steps;
        self.sink.emit(self.event(ProgressState::Succeeded));
    }

    /// Report failure in the current phase
    pub fn fail(self, message: impl Into<String>) {
        self.sink.emit(self.event(ProgressState::Failed {
            message: message.into(),
        }));
    }
}
