//! Cross-loop wait / notify
//!
//! A task on loop `C` that wants to know when loop `L` has finished pushes a
//! node onto `L`'s wait-list. When `L` cleans up it closes the list, copies
//! every `(task, origin)` pair out and hands each resumption back to the
//! origin loop as a wake packet, so the waiter always resumes on its own
//! loop thread.

use crate::arena::{Arena, ArenaKey};
use crate::error::{LoopError, LoopResult};
use crate::event_loop::{Loop, Suspension};
use crate::scheduler::Task;
use std::sync::Arc;

/// Key of a registered wait node
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct WaitKey(ArenaKey);

/// Result of [`wait_exec`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitRegistration {
    /// A node is queued on the target
    Registered(WaitKey),
    /// The target already notified its waiters; nothing to wait for
    TargetFinished,
}

/// "Task `task` on loop `origin` waits for this loop to finish"
pub(crate) struct WaitNode {
    task: Arc<Task>,
    origin: Loop,
}

/// Waiters of one loop
pub struct WaitList {
    nodes: Arena<WaitNode>,
    notified: bool,
}

impl WaitList {
    /// Create an open, empty list
    pub fn new() -> Self {
        Self {
            nodes: Arena::new(),
            notified: false,
        }
    }

    fn push(&mut self, node: WaitNode) -> Option<WaitKey> {
        if self.notified {
            return None;
        }
        Some(WaitKey(self.nodes.insert(node)))
    }

    /// Unlink a node that will not be notified after all. Stale keys are
    /// ignored.
    pub fn remove(&mut self, key: WaitKey) -> bool {
        self.nodes.remove(key.0).is_some()
    }

    fn close(&mut self) -> Vec<WaitNode> {
        self.notified = true;
        self.nodes.drain()
    }

    /// Queued waiters
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// No queued waiters
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether the owning loop has notified
    pub fn is_notified(&self) -> bool {
        self.notified
    }
}

impl Default for WaitList {
    fn default() -> Self {
        Self::new()
    }
}

/// Register the current task of `current` as a waiter on `target`.
///
/// With `should_sleep` the task parks right away and the call returns once
/// `target` has notified; otherwise the caller parks later and must
/// [`WaitList::remove`] the node if it gives up.
pub fn wait_exec(current: &Loop, target: &Loop, should_sleep: bool) -> LoopResult<WaitRegistration> {
    let task = current.require_current()?;
    if current.same_loop(target) {
        return Err(LoopError::InvalidState("a loop cannot wait on itself"));
    }
    current.ensure_accepting()?;

    let node = WaitNode {
        task: task.clone(),
        origin: current.clone(),
    };
    let Some(key) = target.waiters().lock().push(node) else {
        return Ok(WaitRegistration::TargetFinished);
    };
    tracing::trace!(
        waiter = %task.id(),
        origin = current.name(),
        target_loop = target.name(),
        "waiter registered"
    );

    if should_sleep {
        if let Err(e) = current.suspend_as(&task, Suspension::Remote) {
            target.waiters().lock().remove(key);
            return Err(e);
        }
    }
    Ok(WaitRegistration::Registered(key))
}

/// Resume everything waiting on `lp`. Runs once, from cleanup; returns the
/// number of waiters handed off.
pub fn notify(lp: &Loop) -> usize {
    let nodes = lp.waiters().lock().close();
    let count = nodes.len();
    for WaitNode { task, origin } in nodes {
        if let Err(e) = origin.wake(&task) {
            // The origin is going down too; its teardown cancels the task
            tracing::warn!(
                waiter = %task.id(),
                origin = origin.name(),
                error = %e,
                "waiter wake rejected"
            );
        }
    }
    count
}
