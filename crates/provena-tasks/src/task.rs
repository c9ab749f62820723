//! Task types and the cooperative execution checkpoint

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};

use crate::reporter::{TaskEvent, TaskReporter, TracingReporter};
use crate::scheduler::{Scheduler, WeakScheduler};
use provena_core::{Priority, SchedulerError, TaskClass};

/// How often a shutting-down scheduler polls a worker thread for exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Identifier assigned by the scheduler when a task is added.
///
/// Ids increase monotonically and order tasks within a priority bucket.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Id of a task that was never added to a scheduler
    pub const UNASSIGNED: TaskId = TaskId(0);

    pub fn is_assigned(self) -> bool {
        self != Self::UNASSIGNED
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Coarse lifecycle state derived from a task's flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Not started yet, or waiting in a scheduler bucket
    Idle,
    /// Executing on a worker thread
    Running,
    /// A pause is requested or in effect
    Paused,
    /// Abort requested, not yet finished
    Aborting,
    /// The body completed
    Finished,
}

/// Work executed by a [`Task`].
///
/// Implementors embed a `Task` and expose it through [`Runnable::task`]. Long
/// bodies should call [`Task::can_execute`] regularly and return early when it
/// answers `false`.
pub trait Runnable: Send + Sync + 'static {
    /// Control block of this unit of work
    fn task(&self) -> &Task;

    /// Body of the task
    fn run(&self);

    /// Hook invoked right after an abort is requested
    fn on_abort(&self) {}

    /// Request cancellation; observed at the next checkpoint
    fn abort(&self) {
        self.task().abort();
        self.on_abort();
    }
}

#[derive(Debug, Default)]
struct ExecutionState {
    running: bool,
    pending_pause: bool,
    pending_user_pause: bool,
    blocked: bool,
    finished: bool,
    needs_restart: bool,
    attached: bool,
}

/// Control block of a pausable, abortable unit of work
pub struct Task {
    id: AtomicU64,
    description: RwLock<String>,
    hidden: AtomicBool,
    class: TaskClass,
    priority: Mutex<Priority>,
    scheduler: Option<WeakScheduler>,
    submission: Mutex<()>,
    pub(crate) submitted: AtomicBool,
    state: Mutex<ExecutionState>,
    checkpoint: Condvar,
    aborted: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    reporter: Arc<dyn TaskReporter>,
}

impl Task {
    /// Create a task. Without a scheduler, [`submit`] runs it on the caller.
    pub fn new(scheduler: Option<&Scheduler>) -> Self {
        let reporter = scheduler
            .map(Scheduler::reporter)
            .unwrap_or_else(|| Arc::new(TracingReporter));

        Self {
            id: AtomicU64::new(TaskId::UNASSIGNED.0),
            description: RwLock::new(String::new()),
            hidden: AtomicBool::new(false),
            class: TaskClass::Normal,
            priority: Mutex::new(Priority::default()),
            scheduler: scheduler.map(Scheduler::downgrade),
            submission: Mutex::new(()),
            submitted: AtomicBool::new(false),
            state: Mutex::new(ExecutionState::default()),
            checkpoint: Condvar::new(),
            aborted: AtomicBool::new(false),
            worker: Mutex::new(None),
            reporter,
        }
    }

    pub fn with_description(self, description: impl Into<String>) -> Self {
        *self.description.write() = description.into();
        self
    }

    pub fn with_priority(self, priority: Priority) -> Self {
        *self.priority.lock() = priority;
        self
    }

    pub fn with_class(mut self, class: TaskClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn TaskReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Hidden tasks are not meant to be surfaced to the user
    pub fn hidden(self) -> Self {
        self.hidden.store(true, Ordering::Relaxed);
        self
    }

    pub fn id(&self) -> TaskId {
        TaskId(self.id.load(Ordering::Acquire))
    }

    pub(crate) fn assign_id(&self, id: TaskId) {
        self.id.store(id.0, Ordering::Release);
    }

    pub fn description(&self) -> String {
        self.description.read().clone()
    }

    pub fn set_description(&self, description: impl Into<String>) {
        *self.description.write() = description.into();
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden.load(Ordering::Relaxed)
    }

    pub fn set_hidden(&self, hidden: bool) {
        self.hidden.store(hidden, Ordering::Relaxed);
    }

    pub fn class(&self) -> TaskClass {
        self.class
    }

    pub fn priority(&self) -> Priority {
        *self.priority.lock()
    }

    /// Change the priority. A submitted task is moved by the scheduler on
    /// its next pass.
    pub fn set_priority(&self, priority: Priority) {
        let previous = {
            let mut current = self.priority.lock();
            if *current == priority {
                return;
            }
            std::mem::replace(&mut *current, priority)
        };

        let _submission = self.submission.lock();
        if self.submitted.load(Ordering::Acquire) {
            if let Some(scheduler) = self.scheduler() {
                scheduler.change_priority(self.id(), previous);
            }
        }
    }

    /// Scheduler this task was created for, while it is alive
    pub fn scheduler(&self) -> Option<Scheduler> {
        self.scheduler.as_ref().and_then(WeakScheduler::upgrade)
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    /// Ask the task to pause at its next checkpoint
    pub fn pause(&self) {
        let mut state = self.state.lock();
        state.pending_user_pause = true;
        state.pending_pause = true;
    }

    /// Withdraw a user pause.
    ///
    /// A scheduled task is woken by the scheduler once it fits under the
    /// concurrency cap again; an unscheduled task is woken right away.
    pub fn resume(&self) {
        self.state.lock().pending_user_pause = false;
        if self.scheduler.is_none() {
            self.dispatcher_resume();
        }
    }

    /// Flag the task as aborted and wake it if it is blocked at a checkpoint
    pub fn abort(&self) {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _state = self.state.lock();
            self.checkpoint.notify_all();
        }
        self.report(TaskEvent::Aborted { id: self.id() });
    }

    /// Request another run of the body once the current one returns
    pub fn restart(&self) {
        self.state.lock().needs_restart = true;
    }

    /// Cooperative checkpoint.
    ///
    /// Blocks while a pause is pending and answers whether the body should
    /// keep going. Returns `false` once the task is aborted or a restart has
    /// been requested.
    pub fn can_execute(&self) -> bool {
        let mut state = self.state.lock();

        if state.pending_pause && !self.is_aborted() {
            let user_pause = state.pending_user_pause;
            if user_pause {
                MutexGuard::unlocked(&mut state, || {
                    self.report(TaskEvent::Paused { id: self.id() })
                });
            }

            state.blocked = true;
            while state.pending_pause && !self.is_aborted() {
                self.checkpoint.wait(&mut state);
            }
            state.blocked = false;

            if user_pause && !self.is_aborted() {
                MutexGuard::unlocked(&mut state, || {
                    self.report(TaskEvent::Resumed { id: self.id() })
                });
            }
        }

        !(self.is_aborted() || state.needs_restart)
    }

    /// Report progress as a percentage; values above 100 are clamped
    pub fn report_progress(&self, progress: u8) {
        self.report(TaskEvent::Progress {
            id: self.id(),
            progress: progress.min(100),
        });
    }

    /// Executing and not user-paused
    pub fn is_running(&self) -> bool {
        let state = self.state.lock();
        state.running && !state.pending_user_pause
    }

    /// A user pause is requested
    pub fn is_paused(&self) -> bool {
        self.state.lock().pending_user_pause
    }

    /// Currently blocked at a checkpoint
    pub fn is_blocked(&self) -> bool {
        self.state.lock().blocked
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn needs_restart(&self) -> bool {
        self.state.lock().needs_restart
    }

    /// The body completed and no restart is pending
    pub fn has_finished(&self) -> bool {
        let state = self.state.lock();
        state.finished && !state.needs_restart
    }

    pub fn state(&self) -> TaskState {
        let state = self.state.lock();
        if state.finished && !state.needs_restart {
            TaskState::Finished
        } else if self.is_aborted() {
            TaskState::Aborting
        } else if state.pending_pause {
            TaskState::Paused
        } else if state.running {
            TaskState::Running
        } else {
            TaskState::Idle
        }
    }

    pub(crate) fn report(&self, event: TaskEvent) {
        self.reporter.report(&event);
    }

    /// A worker thread is executing this task's body
    pub(crate) fn is_attached(&self) -> bool {
        self.state.lock().attached
    }

    /// A pause is pending, requested either by the user or the scheduler
    pub(crate) fn is_dispatcher_paused(&self) -> bool {
        self.state.lock().pending_pause
    }

    /// May take a running slot
    pub(crate) fn is_eligible(&self) -> bool {
        !self.is_aborted() && !self.state.lock().pending_user_pause
    }

    pub(crate) fn dispatcher_pause(&self) {
        self.state.lock().pending_pause = true;
    }

    /// Wake the task unless the user still wants it paused
    pub(crate) fn dispatcher_resume(&self) {
        let mut state = self.state.lock();
        if !state.pending_user_pause {
            state.pending_pause = false;
            self.checkpoint.notify_all();
        }
    }

    fn prepare_to_run(&self) {
        self.aborted.store(false, Ordering::Release);
        let mut state = self.state.lock();
        state.finished = false;
        state.needs_restart = false;
    }

    /// Clear the submitted flag, answering whether it was set
    pub(crate) fn take_submitted(&self) -> bool {
        let _submission = self.submission.lock();
        self.submitted.swap(false, Ordering::AcqRel)
    }

    /// Wait for the worker thread to exit, up to `deadline`.
    ///
    /// Returns `false` if the thread is still running at the deadline; it is
    /// then detached and left to finish on its own.
    pub(crate) fn wait_for_exit(&self, deadline: Instant) -> bool {
        let Some(handle) = self.worker.lock().take() else {
            return true;
        };

        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }

        if handle.join().is_err() {
            tracing::warn!("Worker thread of task {} panicked", self.id());
        }
        true
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("description", &*self.description.read())
            .field("class", &self.class)
            .field("priority", &self.priority())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Submit a unit of work.
///
/// With a scheduler, the first submission registers the task and later
/// submissions request a restart. Without one, the body runs to completion
/// on the calling thread.
pub fn submit(runnable: Arc<dyn Runnable>) -> Result<TaskId, SchedulerError> {
    let task = runnable.task();

    let Some(weak) = &task.scheduler else {
        run_wrapper(&*runnable);
        return Ok(task.id());
    };
    let scheduler = weak.upgrade().ok_or(SchedulerError::Aborted)?;

    let _submission = task.submission.lock();
    if task.submitted.load(Ordering::Acquire) {
        task.restart();
        Ok(task.id())
    } else {
        task.prepare_to_run();
        scheduler.add_task(runnable.clone())
    }
}

/// Run the body on a fresh worker thread
pub(crate) fn start_worker(runnable: &Arc<dyn Runnable>) {
    let task = runnable.task();
    let mut worker = task.worker.lock();
    task.state.lock().attached = true;

    let body = Arc::clone(runnable);
    let spawned = thread::Builder::new()
        .name(format!("provena-task-{}", task.id().0))
        .spawn(move || {
            run_wrapper(&*body);
            body.task().state.lock().attached = false;
        });

    match spawned {
        Ok(handle) => *worker = Some(handle),
        Err(e) => {
            tracing::error!("Failed to spawn worker for task {}: {}", task.id(), e);
            task.state.lock().attached = false;
        }
    }
}

/// Execute the body, looping while restarts are requested
pub(crate) fn run_wrapper(runnable: &dyn Runnable) {
    let task = runnable.task();
    {
        let mut state = task.state.lock();
        state.running = true;
        state.finished = false;
        state.needs_restart = true;
    }
    task.report(TaskEvent::Started { id: task.id() });

    loop {
        {
            let mut state = task.state.lock();
            if !state.needs_restart {
                break;
            }
            state.needs_restart = false;
        }

        if !task.is_aborted() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| runnable.run())) {
                tracing::error!("Task {} panicked: {}", task.id(), panic_message(&*payload));
            }
            task.can_execute();
        }
    }

    {
        let mut state = task.state.lock();
        state.running = false;
        state.pending_pause = false;
        state.pending_user_pause = false;
        state.finished = true;
    }
    task.report(TaskEvent::Finished {
        id: task.id(),
        aborted: task.is_aborted(),
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
