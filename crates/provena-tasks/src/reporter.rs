//! Task lifecycle reporting

use std::sync::Arc;

use parking_lot::Mutex;

use crate::task::TaskId;
use provena_core::Priority;

/// Events emitted over a task's lifetime
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// A task entered the scheduler's insertion buffer
    Added {
        id: TaskId,
        description: String,
        hidden: bool,
    },
    /// A task left the scheduler
    Removed { id: TaskId },
    /// A task body started executing
    Started { id: TaskId },
    /// A task reported progress, as a percentage
    Progress { id: TaskId, progress: u8 },
    /// A user pause took effect at a checkpoint
    Paused { id: TaskId },
    /// A user-paused task resumed
    Resumed { id: TaskId },
    /// A task was asked to abort
    Aborted { id: TaskId },
    /// A task finished executing
    Finished { id: TaskId, aborted: bool },
    /// The scheduler moved a task to another bucket
    PriorityChanged {
        id: TaskId,
        from: Priority,
        to: Priority,
    },
}

impl TaskEvent {
    /// Id of the task the event refers to
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Added { id, .. }
            | Self::Removed { id }
            | Self::Started { id }
            | Self::Progress { id, .. }
            | Self::Paused { id }
            | Self::Resumed { id }
            | Self::Aborted { id }
            | Self::Finished { id, .. }
            | Self::PriorityChanged { id, .. } => *id,
        }
    }
}

/// Trait for observing task lifecycle events
pub trait TaskReporter: Send + Sync {
    /// Handle a task event
    fn report(&self, event: &TaskEvent);
}

/// Simple reporter that logs to tracing
#[derive(Debug, Default)]
pub struct TracingReporter;

impl TaskReporter for TracingReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Added {
                id,
                description,
                hidden,
            } => {
                if *hidden {
                    tracing::info!(hidden = true, "Queued task {}: {}", id, description);
                } else {
                    tracing::info!("Queued task {}: {}", id, description);
                }
            }
            TaskEvent::Removed { id } => tracing::info!("Task {} left the scheduler", id),
            TaskEvent::Started { id } => tracing::debug!("Task {} started", id),
            TaskEvent::Progress { id, progress } => {
                tracing::trace!("Task {} at {}%", id, progress)
            }
            TaskEvent::Paused { id } => tracing::info!("Task {} paused", id),
            TaskEvent::Resumed { id } => tracing::info!("Task {} resumed", id),
            TaskEvent::Aborted { id } => tracing::info!("Task {} aborted", id),
            TaskEvent::Finished { id, aborted } => {
                if *aborted {
                    tracing::debug!("Task {} finished after abort", id);
                } else {
                    tracing::debug!("Task {} finished", id);
                }
            }
            TaskEvent::PriorityChanged { id, from, to } => {
                tracing::debug!("Task {} moved from {} to {}", id, from, to);
            }
        }
    }
}

/// Reporter that collects events for later inspection (useful for testing)
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<TaskEvent>>,
}

impl CollectingReporter {
    /// Get all collected events
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().clone()
    }

    /// Collected events for one task, in emission order
    pub fn events_for(&self, id: TaskId) -> Vec<TaskEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.task_id() == id)
            .cloned()
            .collect()
    }
}

impl TaskReporter for CollectingReporter {
    fn report(&self, event: &TaskEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Registry of task reporters
pub struct TaskReporterRegistry {
    reporters: Vec<Arc<dyn TaskReporter>>,
}

impl TaskReporterRegistry {
    pub fn new() -> Self {
        Self {
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    pub fn empty() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn register<R: TaskReporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Arc::new(reporter));
    }

    /// Register a reporter the caller keeps a handle to
    pub fn register_shared(&mut self, reporter: Arc<dyn TaskReporter>) {
        self.reporters.push(reporter);
    }

    pub fn all(&self) -> &[Arc<dyn TaskReporter>] {
        &self.reporters
    }

    /// Broadcast an event to all registered reporters
    pub fn broadcast(&self, event: &TaskEvent) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }
}

impl Default for TaskReporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskReporter for TaskReporterRegistry {
    fn report(&self, event: &TaskEvent) {
        self.broadcast(event);
    }
}
