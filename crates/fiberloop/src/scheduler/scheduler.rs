//! Per-loop task registry

use super::task::{Task, TaskFn, TaskId, TaskState};
use crate::error::{LoopError, LoopResult};
use crate::pool::Pool;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Scheduler statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Total tasks spawned
    pub tasks_spawned: u64,

    /// Total tasks completed
    pub tasks_completed: u64,

    /// Currently active tasks
    pub active_tasks: usize,
}

/// Registry of a loop's tasks and the stack of currently executing ones.
///
/// The scheduler never resumes anything itself; whoever calls
/// [`Task::exec`] brackets it with [`enter`](Scheduler::enter) and
/// [`leave`](Scheduler::leave) so [`current`](Scheduler::current) stays
/// accurate through nested execution.
pub struct Scheduler {
    /// Every task not yet deleted
    tasks: FxHashMap<TaskId, Arc<Task>>,

    /// Executing tasks, innermost last
    current: Vec<Arc<Task>>,

    /// Thread name prefix for task stacks
    name_prefix: String,

    /// Stack size used when a caller asks for `0`
    default_stack_size: usize,

    initialized: bool,

    stats: SchedulerStats,
}

impl Scheduler {
    /// Create a scheduler; `init` must run before tasks can be created
    pub fn new(name_prefix: impl Into<String>, default_stack_size: usize) -> Self {
        Self {
            tasks: FxHashMap::default(),
            current: Vec::new(),
            name_prefix: name_prefix.into(),
            default_stack_size,
            initialized: false,
            stats: SchedulerStats::default(),
        }
    }

    /// Bind the scheduler to its (already initialized) pool
    pub fn init(&mut self) {
        self.initialized = true;
    }

    /// Create and register a task. It does not run until executed.
    pub fn create(
        &mut self,
        pool: &mut Pool,
        stack_size: usize,
        entry: TaskFn,
    ) -> LoopResult<Arc<Task>> {
        if !self.initialized {
            return Err(LoopError::InvalidState("scheduler not initialized"));
        }
        pool.alloc("task")?;

        let stack_size = if stack_size == 0 {
            self.default_stack_size
        } else {
            stack_size
        };
        let task = match Task::create(&self.name_prefix, stack_size, entry) {
            Ok(task) => Arc::new(task),
            Err(e) => {
                pool.free();
                return Err(e);
            }
        };

        self.tasks.insert(task.id(), task.clone());
        self.stats.tasks_spawned += 1;
        self.stats.active_tasks = self.tasks.len();
        Ok(task)
    }

    /// Push `task` as the current one
    pub fn enter(&mut self, task: Arc<Task>) {
        self.current.push(task);
    }

    /// Pop `id` off the current stack, restoring the outer task
    pub fn leave(&mut self, id: TaskId) {
        match self.current.last() {
            Some(top) if top.id() == id => {
                self.current.pop();
            }
            _ => {
                tracing::warn!(task = %id, "leave does not match the current task");
                self.current.retain(|t| t.id() != id);
            }
        }
    }

    /// Innermost executing task
    pub fn current(&self) -> Option<&Arc<Task>> {
        self.current.last()
    }

    /// Whether `id` is registered here
    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    /// Look up a registered task
    pub fn get(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.get(&id).cloned()
    }

    /// Delete a finished task, releasing its pool slot.
    ///
    /// Suspended tasks are left alone: something may still resume them.
    pub fn delete(&mut self, pool: &mut Pool, id: TaskId) -> bool {
        let finished = self
            .tasks
            .get(&id)
            .is_some_and(|t| t.state() == TaskState::Finished);
        if !finished {
            return false;
        }
        self.tasks.remove(&id);
        pool.free();
        self.stats.tasks_completed += 1;
        self.stats.active_tasks = self.tasks.len();
        true
    }

    /// Unfinished tasks, for the caller to cancel without holding the
    /// scheduler
    pub fn unfinished(&self) -> Vec<Arc<Task>> {
        let mut tasks: Vec<_> = self
            .tasks
            .values()
            .filter(|t| t.state() != TaskState::Finished)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id());
        tasks
    }

    /// Drop every registered task and release its slot. Returns how many
    /// were still unfinished.
    pub fn destroy(&mut self, pool: &mut Pool) -> usize {
        let mut unfinished = 0;
        for (_, task) in self.tasks.drain() {
            if task.state() == TaskState::Finished {
                self.stats.tasks_completed += 1;
            } else {
                unfinished += 1;
            }
            pool.free();
        }
        self.current.clear();
        self.stats.active_tasks = 0;
        self.initialized = false;
        unfinished
    }

    /// Registered tasks
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }
}
