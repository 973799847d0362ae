//! Task structure and execution state
//!
//! A task owns a dedicated OS thread that serves purely as its stack. Control
//! moves between the resumer and the task over a pair of rendezvous channels:
//! [`Task::exec`] hands the baton over and blocks until the task calls
//! [`Task::suspend`] or returns, so exactly one side runs at any moment. The
//! loop's tasks therefore interleave as if they shared one thread.

use crate::error::{LoopError, LoopResult};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

/// Entry point of a task
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// Unique identifier for a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// State of a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Created, never resumed
    Created,
    /// Currently holding the baton
    Running,
    /// Parked at a suspension point
    Suspended,
    /// Entry returned (or panicked, or was cancelled)
    Finished,
}

/// Outcome of one [`Task::exec`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task suspended and can be resumed again
    Suspended,
    /// The task will never run again
    Finished,
}

/// Resumer → task
enum Resume {
    Run,
    Cancel,
}

/// Task → resumer
enum Yielded {
    Suspended,
    Finished,
    Panicked(String),
}

/// A cooperatively scheduled unit of execution with its own stack
pub struct Task {
    /// Unique identifier
    id: TaskId,

    /// Thread name
    name: String,

    /// Current state (written by the resumer only)
    state: Mutex<TaskState>,

    /// Opaque value passed across the suspend boundary
    data: Mutex<Option<Box<dyn Any + Send>>>,

    /// Set once the task must not park again
    cancelled: AtomicBool,

    /// Thread backing this task's stack
    thread_id: ThreadId,

    resume_tx: Sender<Resume>,
    resume_rx: Receiver<Resume>,
    yield_tx: Sender<Yielded>,
    yield_rx: Receiver<Yielded>,

    /// Joined once the task has finished
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Task {
    /// Create a task running `entry` on a stack of `stack_size` bytes
    /// (`0` = platform default). The entry does not start until the first
    /// [`exec`](Task::exec).
    pub fn create(name_prefix: &str, stack_size: usize, entry: TaskFn) -> LoopResult<Task> {
        let id = TaskId::new();
        let name = format!("{}-{}", name_prefix, id);
        let (resume_tx, resume_rx) = channel::bounded(1);
        let (yield_tx, yield_rx) = channel::bounded(1);

        let fiber_resume = resume_rx.clone();
        let fiber_yield = yield_tx.clone();

        let mut builder = thread::Builder::new().name(name.clone());
        if stack_size > 0 {
            builder = builder.stack_size(stack_size);
        }
        let handle = builder.spawn(move || Self::fiber_main(entry, fiber_resume, fiber_yield))?;

        Ok(Self {
            id,
            name,
            state: Mutex::new(TaskState::Created),
            data: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            thread_id: handle.thread().id(),
            resume_tx,
            resume_rx,
            yield_tx,
            yield_rx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Body of the backing thread
    fn fiber_main(entry: TaskFn, resume: Receiver<Resume>, yielded: Sender<Yielded>) {
        match resume.recv() {
            Ok(Resume::Run) => {}
            // Cancelled (or dropped) before it ever ran
            Ok(Resume::Cancel) | Err(_) => {
                drop(entry);
                let _ = yielded.send(Yielded::Finished);
                return;
            }
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(entry));
        let msg = match outcome {
            Ok(()) => Yielded::Finished,
            Err(payload) => Yielded::Panicked(panic_message(payload.as_ref())),
        };
        let _ = yielded.send(msg);
    }

    /// Get the Task's unique ID
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Thread name backing this task
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state
    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Whether the calling thread is this task's own stack
    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Whether the task was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resume the task until it next suspends or returns.
    ///
    /// Blocks the calling thread for as long as the task runs.
    pub fn exec(&self) -> LoopResult<TaskStatus> {
        if self.is_current_thread() {
            return Err(LoopError::InvalidState("a task cannot resume itself"));
        }
        {
            let mut state = self.state.lock();
            match *state {
                TaskState::Finished => {
                    return Err(LoopError::InvalidState("task already finished"))
                }
                TaskState::Running => return Err(LoopError::InvalidState("task is already running")),
                TaskState::Created | TaskState::Suspended => *state = TaskState::Running,
            }
        }

        let cmd = if self.is_cancelled() {
            Resume::Cancel
        } else {
            Resume::Run
        };
        if self.resume_tx.send(cmd).is_err() {
            self.finish();
            return Ok(TaskStatus::Finished);
        }

        match self.yield_rx.recv() {
            Ok(Yielded::Suspended) => {
                *self.state.lock() = TaskState::Suspended;
                Ok(TaskStatus::Suspended)
            }
            Ok(Yielded::Finished) | Err(_) => {
                self.finish();
                Ok(TaskStatus::Finished)
            }
            Ok(Yielded::Panicked(msg)) => {
                tracing::error!(task = %self.id, panic = %msg, "task panicked");
                self.finish();
                Ok(TaskStatus::Finished)
            }
        }
    }

    /// Park the calling task until the next [`exec`](Task::exec).
    ///
    /// Must be called from the task's own stack. A cancelled task returns
    /// [`LoopError::Terminated`] without parking.
    pub fn suspend(&self) -> LoopResult<()> {
        if !self.is_current_thread() {
            return Err(LoopError::InvalidState(
                "suspend called outside the task's own stack",
            ));
        }
        if self.is_cancelled() {
            return Err(LoopError::Terminated);
        }
        if self.yield_tx.send(Yielded::Suspended).is_err() {
            return Err(LoopError::Terminated);
        }
        match self.resume_rx.recv() {
            Ok(Resume::Run) => Ok(()),
            Ok(Resume::Cancel) | Err(_) => Err(LoopError::Terminated),
        }
    }

    /// Cancel a task that is not running and drive it to completion.
    ///
    /// The pending (and any later) suspension returns
    /// [`LoopError::Terminated`]; a task that never ran is finished without
    /// running its entry.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        loop {
            match self.state() {
                TaskState::Finished | TaskState::Running => return,
                TaskState::Created | TaskState::Suspended => match self.exec() {
                    Ok(TaskStatus::Suspended) => continue,
                    Ok(TaskStatus::Finished) | Err(_) => return,
                },
            }
        }
    }

    /// Store the opaque data value
    pub fn set_data(&self, data: Box<dyn Any + Send>) {
        *self.data.lock() = Some(data);
    }

    /// Take the data value if it has type `D`
    pub fn take_data<D: Any>(&self) -> Option<Box<D>> {
        let mut slot = self.data.lock();
        let data = slot.take()?;
        match data.downcast::<D>() {
            Ok(value) => Some(value),
            Err(other) => {
                *slot = Some(other);
                None
            }
        }
    }

    /// Drop any data value
    pub fn clear_data(&self) {
        self.data.lock().take();
    }

    fn finish(&self) {
        *self.state.lock() = TaskState::Finished;
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        // A parked task nobody will resume: let its thread unwind detached
        if *self.state.get_mut() != TaskState::Finished {
            self.cancelled.store(true, Ordering::Release);
            let _ = self.resume_tx.try_send(Resume::Cancel);
            tracing::debug!(task = %self.id, "unfinished task dropped");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
