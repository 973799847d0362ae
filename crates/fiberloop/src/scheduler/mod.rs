//! Task Scheduler
//!
//! Tasks are cooperatively scheduled on the loop that owns them: the loop
//! thread (or a task it is executing) resumes one task at a time, and a task
//! gives control back only at a suspension point.

#[allow(clippy::module_inception)]
mod scheduler;
mod task;

pub use scheduler::{Scheduler, SchedulerStats};
pub use task::{Task, TaskFn, TaskId, TaskState, TaskStatus};
