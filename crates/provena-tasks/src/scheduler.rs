//! Priority scheduler
//!
//! Tasks live in one bucket per [`Priority`], ordered by [`TaskId`]. A
//! dedicated thread makes a scheduling pass every period: it drains the
//! insertion buffer, applies pending priority changes, then walks the buckets
//! from highest to lowest priority, starting or resuming tasks while the
//! concurrency cap allows and pausing the rest at their next checkpoint.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::reporter::{TaskEvent, TaskReporter};
use crate::task::{start_worker, Runnable, TaskId};
use provena_core::{Priority, SchedulerConfig, SchedulerError};

type Bucket = VecDeque<Arc<dyn Runnable>>;

/// Handle to a priority scheduler. Clones share the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

/// Non-owning handle kept by tasks
pub(crate) struct WeakScheduler(Weak<Inner>);

impl WeakScheduler {
    pub(crate) fn upgrade(&self) -> Option<Scheduler> {
        self.0.upgrade().map(|inner| Scheduler { inner })
    }
}

struct Inner {
    period: Duration,
    max_running_tasks: usize,
    shutdown_timeout: Duration,
    reporter: Arc<dyn TaskReporter>,
    next_id: AtomicU64,
    buckets: Mutex<[Bucket; Priority::COUNT]>,
    insertion_buffer: Mutex<Vec<Arc<dyn Runnable>>>,
    priority_changes: Mutex<HashMap<TaskId, Priority>>,
    running: Mutex<Vec<TaskId>>,
    aborted: AtomicBool,
    stop: Mutex<bool>,
    wakeup: Condvar,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler. Call [`Scheduler::start`] to run the scheduling
    /// loop, or drive it manually with [`Scheduler::tick`].
    pub fn new(config: &SchedulerConfig, reporter: Arc<dyn TaskReporter>) -> Self {
        let max_running_tasks = config.resolved_max_running_tasks();
        tracing::debug!(
            "Creating scheduler: period {:?}, up to {} running tasks",
            config.period(),
            max_running_tasks
        );

        Self {
            inner: Arc::new(Inner {
                period: config.period(),
                max_running_tasks,
                shutdown_timeout: config.shutdown_timeout(),
                reporter,
                next_id: AtomicU64::new(1),
                buckets: Mutex::new(Default::default()),
                insertion_buffer: Mutex::new(Vec::new()),
                priority_changes: Mutex::new(HashMap::new()),
                running: Mutex::new(Vec::new()),
                aborted: AtomicBool::new(false),
                stop: Mutex::new(false),
                wakeup: Condvar::new(),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakScheduler {
        WeakScheduler(Arc::downgrade(&self.inner))
    }

    /// Reporter shared with the tasks created for this scheduler
    pub fn reporter(&self) -> Arc<dyn TaskReporter> {
        Arc::clone(&self.inner.reporter)
    }

    pub fn max_running_tasks(&self) -> usize {
        self.inner.max_running_tasks
    }

    /// Spawn the scheduling loop thread. Calling it again is a no-op.
    pub fn start(&self) -> std::io::Result<()> {
        let mut dispatcher = self.inner.dispatcher.lock();
        if dispatcher.is_some() || self.is_aborted() {
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);
        let handle = thread::Builder::new()
            .name("provena-scheduler".to_string())
            .spawn(move || scheduling_loop(weak))?;
        *dispatcher = Some(handle);
        Ok(())
    }

    /// Run a single scheduling pass on the calling thread
    pub fn tick(&self) {
        if !self.is_aborted() {
            self.inner.schedule_pass();
        }
    }

    /// Register a task, assigning it the next id.
    ///
    /// The task waits in the insertion buffer until the next pass.
    pub fn add_task(&self, runnable: Arc<dyn Runnable>) -> Result<TaskId, SchedulerError> {
        if self.is_aborted() {
            return Err(SchedulerError::Aborted);
        }

        let task = runnable.task();
        if task.submitted.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::DuplicateTask(task.id().0));
        }

        let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        task.assign_id(id);
        let description = task.description();
        let hidden = task.is_hidden();

        self.inner.insertion_buffer.lock().push(runnable);
        self.inner.reporter.report(&TaskEvent::Added {
            id,
            description,
            hidden,
        });
        Ok(id)
    }

    /// Record that a task's priority changed; applied on the next pass
    pub fn change_priority(&self, id: TaskId, previous: Priority) {
        self.inner
            .priority_changes
            .lock()
            .entry(id)
            .or_insert(previous);
    }

    /// Stop scheduling and abort every task.
    ///
    /// Running tasks get the configured shutdown timeout to reach a
    /// checkpoint and exit. Worker threads still running after that are
    /// detached.
    pub fn abort(&self) {
        if self.inner.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Aborting scheduler");

        {
            let mut stop = self.inner.stop.lock();
            *stop = true;
            self.inner.wakeup.notify_all();
        }
        let dispatcher = self.inner.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::warn!("Scheduling loop panicked");
            }
        }

        let tasks = self.inner.drain();
        for runnable in &tasks {
            runnable.abort();
        }

        let deadline = Instant::now() + self.inner.shutdown_timeout;
        for runnable in &tasks {
            let task = runnable.task();
            if !task.wait_for_exit(deadline) {
                tracing::warn!(
                    "Task {} did not stop within {:?}, abandoning its worker thread",
                    task.id(),
                    self.inner.shutdown_timeout
                );
            }
        }
        self.inner.running.lock().clear();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// Buffered, queued and running tasks.
    ///
    /// Locks the buckets before the insertion buffer, the same order as a
    /// scheduling pass, so no task is in flight between the two.
    pub fn number_of_tasks(&self) -> usize {
        let buckets = self.inner.buckets.lock();
        let buffered = self.inner.insertion_buffer.lock().len();
        let queued: usize = buckets.iter().map(VecDeque::len).sum();
        buffered + queued
    }

    /// Tasks granted a running slot on the last pass, highest priority first
    pub fn running_tasks(&self) -> Vec<TaskId> {
        self.inner.running.lock().clone()
    }

    /// Ids held in one priority bucket, in scheduling order
    pub fn queued_tasks(&self, priority: Priority) -> Vec<TaskId> {
        self.inner.buckets.lock()[priority.index()]
            .iter()
            .map(|runnable| runnable.task().id())
            .collect()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("period", &self.inner.period)
            .field("max_running_tasks", &self.inner.max_running_tasks)
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn bucket_for(runnable: &Arc<dyn Runnable>) -> Priority {
        let task = runnable.task();
        if task.class().is_urgent() {
            Priority::VeryHigh
        } else {
            task.priority()
        }
    }

    fn schedule_pass(&self) {
        let mut buckets = self.buckets.lock();
        let incoming = std::mem::take(&mut *self.insertion_buffer.lock());
        let changes = std::mem::take(&mut *self.priority_changes.lock());

        for runnable in incoming {
            let priority = Self::bucket_for(&runnable);
            insert_ordered(&mut buckets[priority.index()], runnable);
        }

        for (id, previous) in changes {
            let Some((from, runnable)) = take_task(&mut buckets, id) else {
                continue;
            };
            let to = Self::bucket_for(&runnable);
            insert_ordered(&mut buckets[to.index()], runnable);
            if from != to {
                self.reporter.report(&TaskEvent::PriorityChanged { id, from, to });
            } else {
                tracing::trace!("Task {} kept bucket {} (was {})", id, to, previous);
            }
        }

        let mut running = Vec::new();
        for priority in Priority::DESCENDING {
            let bucket = &mut buckets[priority.index()];
            let mut index = 0;
            while index < bucket.len() {
                let runnable = Arc::clone(&bucket[index]);
                let task = runnable.task();

                if task.has_finished() || (task.is_aborted() && !task.is_attached()) {
                    bucket.remove(index);
                    if task.take_submitted() {
                        self.reporter.report(&TaskEvent::Removed { id: task.id() });
                    }
                    continue;
                }

                let urgent = task.class().is_urgent();
                if (running.len() < self.max_running_tasks || urgent) && task.is_eligible() {
                    if !task.is_attached() {
                        start_worker(&runnable);
                    } else if task.is_dispatcher_paused() {
                        task.dispatcher_resume();
                    }
                    running.push(task.id());
                } else {
                    if task.is_attached() && !task.is_dispatcher_paused() {
                        task.dispatcher_pause();
                    }
                    if task.is_aborted() && task.is_dispatcher_paused() {
                        task.dispatcher_resume();
                    }
                }
                index += 1;
            }
        }
        drop(buckets);

        *self.running.lock() = running;
    }

    /// Empty the buffer and every bucket, returning the tasks that were held
    fn drain(&self) -> Vec<Arc<dyn Runnable>> {
        self.priority_changes.lock().clear();
        let mut buckets = self.buckets.lock();
        let mut tasks: Vec<Arc<dyn Runnable>> =
            std::mem::take(&mut *self.insertion_buffer.lock());
        for bucket in buckets.iter_mut() {
            tasks.extend(bucket.drain(..));
        }
        drop(buckets);
        for runnable in &tasks {
            let task = runnable.task();
            if task.take_submitted() {
                self.reporter.report(&TaskEvent::Removed { id: task.id() });
            }
        }
        tasks
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.aborted.store(true, Ordering::Release);
        for runnable in self.drain() {
            runnable.abort();
        }
    }
}

/// Insert keeping the bucket sorted by task id
fn insert_ordered(bucket: &mut Bucket, runnable: Arc<dyn Runnable>) {
    let id = runnable.task().id();
    let position = bucket.partition_point(|queued| queued.task().id() < id);
    bucket.insert(position, runnable);
}

fn take_task(
    buckets: &mut [Bucket; Priority::COUNT],
    id: TaskId,
) -> Option<(Priority, Arc<dyn Runnable>)> {
    for priority in Priority::DESCENDING {
        let bucket = &mut buckets[priority.index()];
        if let Some(position) = bucket.iter().position(|queued| queued.task().id() == id) {
            return bucket.remove(position).map(|runnable| (priority, runnable));
        }
    }
    None
}

fn scheduling_loop(inner: Weak<Inner>) {
    tracing::debug!("Scheduling loop started");
    loop {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.aborted.load(Ordering::Acquire) {
            break;
        }

        let started = Instant::now();
        inner.schedule_pass();
        let remaining = inner.period.saturating_sub(started.elapsed());

        let mut stop = inner.stop.lock();
        if !*stop {
            inner.wakeup.wait_for(&mut stop, remaining);
        }
        if *stop {
            break;
        }
    }
    tracing::debug!("Scheduling loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::CollectingReporter;
    use crate::task::{submit, Task};
    use provena_core::TaskClass;
    use std::sync::atomic::AtomicUsize;

    /// Task whose body spins at checkpoints until released
    struct Gated {
        task: Task,
        release: Arc<AtomicBool>,
        runs: AtomicUsize,
    }

    impl Runnable for Gated {
        fn task(&self) -> &Task {
            &self.task
        }

        fn run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            while !self.release.load(Ordering::SeqCst) {
                if !self.task.can_execute() {
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn scheduler(max_running_tasks: usize) -> (Scheduler, Arc<CollectingReporter>) {
        let reporter = Arc::new(CollectingReporter::default());
        let config = SchedulerConfig {
            period_ms: 5,
            max_running_tasks,
            shutdown_timeout_ms: 2000,
        };
        (Scheduler::new(&config, reporter.clone()), reporter)
    }

    fn gated(task: Task, release: &Arc<AtomicBool>) -> Arc<Gated> {
        Arc::new(Gated {
            task,
            release: Arc::clone(release),
            runs: AtomicUsize::new(0),
        })
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_ids_increase_and_order_buckets() {
        let (scheduler, _) = scheduler(1);
        let release = Arc::new(AtomicBool::new(false));

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let task = Task::new(Some(&scheduler));
                task.pause();
                gated(task, &release)
            })
            .collect();

        let ids: Vec<TaskId> = tasks
            .iter()
            .map(|task| submit(task.clone()).unwrap())
            .collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(scheduler.number_of_tasks(), 3);

        scheduler.tick();

        // User-paused tasks are never started
        assert_eq!(scheduler.queued_tasks(Priority::Normal), ids);
        assert!(scheduler.running_tasks().is_empty());
        assert!(tasks.iter().all(|task| task.runs.load(Ordering::SeqCst) == 0));

        scheduler.abort();
    }

    #[test]
    fn test_duplicate_add_is_rejected() {
        let (scheduler, _) = scheduler(1);
        let release = Arc::new(AtomicBool::new(true));
        let task = gated(Task::new(Some(&scheduler)), &release);

        let id = scheduler.add_task(task.clone()).unwrap();
        assert_eq!(
            scheduler.add_task(task.clone()),
            Err(SchedulerError::DuplicateTask(id.0))
        );
        scheduler.abort();
    }

    #[test]
    fn test_cap_bounds_running_tasks() {
        let (scheduler, _) = scheduler(2);
        let release = Arc::new(AtomicBool::new(false));

        let tasks: Vec<_> = (0..4)
            .map(|_| gated(Task::new(Some(&scheduler)), &release))
            .collect();
        for task in &tasks {
            submit(task.clone()).unwrap();
        }

        scheduler.tick();
        let running = scheduler.running_tasks();
        assert_eq!(running, vec![tasks[0].task.id(), tasks[1].task.id()]);
        assert!(wait_until(|| tasks[0].runs.load(Ordering::SeqCst) == 1
            && tasks[1].runs.load(Ordering::SeqCst) == 1));
        assert_eq!(tasks[2].runs.load(Ordering::SeqCst), 0);
        assert_eq!(tasks[3].runs.load(Ordering::SeqCst), 0);

        release.store(true, Ordering::SeqCst);
        scheduler.start().unwrap();
        assert!(wait_until(|| scheduler.number_of_tasks() == 0));
        assert!(tasks.iter().all(|task| task.runs.load(Ordering::SeqCst) == 1));
        scheduler.abort();
    }

    #[test]
    fn test_urgent_task_exceeds_cap() {
        let (scheduler, _) = scheduler(1);
        let release = Arc::new(AtomicBool::new(false));

        let normal = gated(
            Task::new(Some(&scheduler)).with_priority(Priority::VeryHigh),
            &release,
        );
        let urgent = gated(
            Task::new(Some(&scheduler))
                .with_priority(Priority::VeryLow)
                .with_class(TaskClass::Urgent),
            &release,
        );
        submit(normal.clone()).unwrap();
        submit(urgent.clone()).unwrap();

        scheduler.tick();

        assert_eq!(
            scheduler.queued_tasks(Priority::VeryHigh),
            vec![normal.task.id(), urgent.task.id()]
        );
        assert_eq!(scheduler.running_tasks().len(), 2);
        assert!(wait_until(|| urgent.runs.load(Ordering::SeqCst) == 1));

        scheduler.abort();
    }

    #[test]
    fn test_priority_change_moves_task() {
        let (scheduler, reporter) = scheduler(1);
        let release = Arc::new(AtomicBool::new(false));
        let task = Task::new(Some(&scheduler)).with_priority(Priority::Low);
        task.pause();
        let task = gated(task, &release);
        let id = submit(task.clone()).unwrap();

        scheduler.tick();
        assert_eq!(scheduler.queued_tasks(Priority::Low), vec![id]);

        task.task.set_priority(Priority::High);
        // Buffered until the next pass
        assert_eq!(scheduler.queued_tasks(Priority::Low), vec![id]);

        scheduler.tick();
        assert!(scheduler.queued_tasks(Priority::Low).is_empty());
        assert_eq!(scheduler.queued_tasks(Priority::High), vec![id]);
        assert!(reporter.events().contains(&TaskEvent::PriorityChanged {
            id,
            from: Priority::Low,
            to: Priority::High,
        }));

        scheduler.abort();
    }

    #[test]
    fn test_lower_priority_task_is_paused_at_cap() {
        let (scheduler, _) = scheduler(1);
        let release = Arc::new(AtomicBool::new(false));

        let low = gated(
            Task::new(Some(&scheduler)).with_priority(Priority::Low),
            &release,
        );
        submit(low.clone()).unwrap();
        scheduler.tick();
        assert!(wait_until(|| low.runs.load(Ordering::SeqCst) == 1));

        let high = gated(
            Task::new(Some(&scheduler)).with_priority(Priority::High),
            &release,
        );
        submit(high.clone()).unwrap();
        scheduler.tick();

        assert_eq!(scheduler.running_tasks(), vec![high.task.id()]);
        assert!(wait_until(|| low.task.is_blocked()));

        release.store(true, Ordering::SeqCst);
        scheduler.start().unwrap();
        assert!(wait_until(|| low.task.has_finished() && high.task.has_finished()));
        scheduler.abort();
    }

    #[test]
    fn test_resubmit_restarts_body() {
        let (scheduler, _) = scheduler(1);
        let release = Arc::new(AtomicBool::new(false));
        let task = gated(Task::new(Some(&scheduler)), &release);

        let id = submit(task.clone()).unwrap();
        scheduler.tick();
        assert!(wait_until(|| task.runs.load(Ordering::SeqCst) == 1));

        assert_eq!(submit(task.clone()).unwrap(), id);
        assert!(wait_until(|| task.runs.load(Ordering::SeqCst) == 2));

        release.store(true, Ordering::SeqCst);
        scheduler.start().unwrap();
        assert!(wait_until(|| scheduler.number_of_tasks() == 0));
        assert_eq!(task.runs.load(Ordering::SeqCst), 2);
        scheduler.abort();
    }

    #[test]
    fn test_user_pause_and_resume_under_scheduler() {
        let (scheduler, reporter) = scheduler(2);
        let release = Arc::new(AtomicBool::new(false));
        let task = gated(Task::new(Some(&scheduler)), &release);
        let id = submit(task.clone()).unwrap();
        scheduler.start().unwrap();
        assert!(wait_until(|| task.runs.load(Ordering::SeqCst) == 1));

        task.task.pause();
        assert!(wait_until(|| task.task.is_blocked()));
        assert!(!task.task.is_running());

        task.task.resume();
        assert!(wait_until(|| !task.task.is_blocked()));

        release.store(true, Ordering::SeqCst);
        assert!(wait_until(|| task.task.has_finished()));

        let events = reporter.events_for(id);
        let paused = events.iter().position(|e| *e == TaskEvent::Paused { id });
        let resumed = events.iter().position(|e| *e == TaskEvent::Resumed { id });
        assert!(paused.is_some() && resumed.is_some() && paused < resumed);
        scheduler.abort();
    }

    #[test]
    fn test_abort_finishes_running_tasks() {
        let (scheduler, reporter) = scheduler(2);
        let release = Arc::new(AtomicBool::new(false));

        let tasks: Vec<_> = (0..4)
            .map(|_| gated(Task::new(Some(&scheduler)), &release))
            .collect();
        for task in &tasks {
            submit(task.clone()).unwrap();
        }
        scheduler.start().unwrap();
        assert!(wait_until(|| scheduler.running_tasks().len() == 2));

        scheduler.abort();

        assert_eq!(scheduler.number_of_tasks(), 0);
        assert!(scheduler.running_tasks().is_empty());
        assert!(tasks[..2].iter().all(|task| task.task.has_finished()));
        for task in &tasks[..2] {
            assert!(reporter.events_for(task.task.id()).contains(&TaskEvent::Finished {
                id: task.task.id(),
                aborted: true,
            }));
        }
        assert_eq!(
            scheduler.add_task(tasks[0].clone()),
            Err(SchedulerError::Aborted)
        );
    }

    #[test]
    fn test_abort_before_start_removes_task() {
        let (scheduler, reporter) = scheduler(1);
        let release = Arc::new(AtomicBool::new(true));
        let task = gated(Task::new(Some(&scheduler)), &release);
        let id = submit(task.clone()).unwrap();

        task.abort();
        scheduler.tick();

        assert_eq!(scheduler.number_of_tasks(), 0);
        assert_eq!(task.runs.load(Ordering::SeqCst), 0);
        assert!(reporter.events().contains(&TaskEvent::Removed { id }));
    }

    #[test]
    fn test_number_of_tasks_counts_buffered_during_pass() {
        let (scheduler, _) = scheduler(1);
        let release = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let ticker = {
            let scheduler = scheduler.clone();
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    scheduler.tick();
                }
            })
        };

        // Paused tasks stay queued, so the count can only grow
        for submitted in 1..=2000 {
            let task = Task::new(Some(&scheduler));
            task.pause();
            submit(gated(task, &release)).unwrap();
            assert!(scheduler.number_of_tasks() >= submitted);
        }

        stop.store(true, Ordering::SeqCst);
        ticker.join().unwrap();
        scheduler.tick();
        assert_eq!(scheduler.number_of_tasks(), 2000);

        scheduler.abort();
    }
}
