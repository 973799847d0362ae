//! Async post / exec
//!
//! Work crosses loops as packets on the target's completion port. Two
//! handles are registered on every port: [`AsyncPost`] turns a posted
//! callback into a fresh task, and [`TaskWake`] resumes a task of this loop
//! that was parked waiting for another loop.

use crate::event_loop::{Loop, LoopFn};
use crate::port::{Completable, CompletionEvent};
use crate::scheduler::Task;
use crossbeam::channel::{self, Receiver, Sender};
use std::sync::Arc;

/// Callback-as-task travelling in a post packet
pub(crate) struct PostedCall {
    callback: LoopFn,
    stack_size: usize,
    reply: Option<ExecReply>,
}

impl PostedCall {
    pub(crate) fn new(callback: LoopFn, stack_size: usize) -> Self {
        Self {
            callback,
            stack_size,
            reply: None,
        }
    }

    pub(crate) fn with_reply(callback: LoopFn, stack_size: usize, reply: ExecReply) -> Self {
        Self {
            callback,
            stack_size,
            reply: Some(reply),
        }
    }

    /// Drop without waking anyone; the post never happened
    pub(crate) fn disarm(mut self) {
        if let Some(reply) = self.reply.take() {
            reply.disarm();
        }
    }

    fn into_task_fn(self) -> (LoopFn, usize) {
        let PostedCall {
            callback,
            stack_size,
            reply,
        } = self;
        let job: LoopFn = Box::new(move |lp: &Loop| {
            callback(lp);
            if let Some(reply) = reply {
                reply.complete();
            }
        });
        (job, stack_size)
    }
}

/// How an [`exec`](Loop::exec)'d callback ended, as seen by the caller
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ExecOutcome {
    /// The callback ran to completion on the target
    Completed,
    /// The target dropped the callback (closed port, spawn failure, panic)
    Dropped,
}

/// Wakes the exec caller when dropped, whichever way the callback went
pub(crate) struct ExecReply {
    origin: Loop,
    task: Arc<Task>,
    outcome: Sender<ExecOutcome>,
    completed: bool,
    armed: bool,
}

impl ExecReply {
    /// Reply for `task` on `origin`, and the receiver the outcome lands in
    /// before the wake
    pub(crate) fn new(origin: Loop, task: Arc<Task>) -> (Self, Receiver<ExecOutcome>) {
        let (outcome, rx) = channel::bounded(1);
        let reply = Self {
            origin,
            task,
            outcome,
            completed: false,
            armed: true,
        };
        (reply, rx)
    }

    fn complete(mut self) {
        self.completed = true;
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ExecReply {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let outcome = if self.completed {
            ExecOutcome::Completed
        } else {
            ExecOutcome::Dropped
        };
        // The caller only reads after the wake; it may be gone already
        let _ = self.outcome.try_send(outcome);
        if let Err(e) = self.origin.wake(&self.task) {
            // The caller's loop is tearing down and cancels the task itself
            tracing::debug!(
                task = %self.task.id(),
                origin = self.origin.name(),
                error = %e,
                "exec reply not delivered"
            );
        }
    }
}

/// Runs posted callbacks as new tasks
pub(crate) struct AsyncPost;

impl Completable for AsyncPost {
    fn process(&self, lp: &Loop, mut event: CompletionEvent) {
        let Some(call) = event.take_descriptor::<PostedCall>() else {
            tracing::warn!(loop_name = lp.name(), "post packet without a callback");
            return;
        };
        let (job, stack_size) = (*call).into_task_fn();
        if let Err(e) = lp.spawn_task(stack_size, job) {
            tracing::warn!(loop_name = lp.name(), error = %e, "posted callback dropped");
        }
    }
}

/// Resumes a parked task of this loop
pub(crate) struct TaskWake;

impl Completable for TaskWake {
    fn process(&self, lp: &Loop, mut event: CompletionEvent) {
        let Some(task) = event.take_descriptor::<Arc<Task>>() else {
            tracing::warn!(loop_name = lp.name(), "wake packet without a task");
            return;
        };
        lp.resume_parked(&task);
    }
}
