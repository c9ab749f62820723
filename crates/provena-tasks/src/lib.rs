//! Provena Tasks - cooperative task scheduling
//!
//! This crate provides pausable, abortable tasks and a priority scheduler
//! that runs each active task on its own worker thread, bounding how many
//! run concurrently and reconciling runtime priority changes.

pub mod reporter;
pub mod scheduler;
pub mod task;

pub use reporter::{CollectingReporter, TaskEvent, TaskReporter, TaskReporterRegistry, TracingReporter};
pub use scheduler::Scheduler;
pub use task::{submit, Runnable, Task, TaskId, TaskState};

pub use provena_core::{Priority, TaskClass};
