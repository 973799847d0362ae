//! Event loop
//!
//! A [`Loop`] owns a completion port, a pool, three timer queues, a task
//! scheduler and a wait-list. One OS thread drives it: either the caller of
//! [`Loop::run`], or the thread spawned by [`Loop::start`]. Each iteration
//! of the run cycle:
//!
//! 1. fires due sleep timers against `now`
//! 2. blocks on the port for at most the nearest timer deadline
//! 3. classifies the wait: closed port (exit), timed out (fire idle timers),
//!    completion (dispatch to its handle) or fatal failure (exit)
//! 4. fires due timeout timers against inactivity
//!
//! [`Loop::stop`] closes the port from any thread. The next wait observes
//! the closure, the cycle exits, and cleanup resumes everything still
//! pending: timers fire now, waiters are notified, remaining tasks are
//! cancelled and the pool is released.
//!
//! No loop lock is held while a task runs, so tasks may call back into the
//! loop freely.

use crate::asynch::{AsyncPost, ExecOutcome, ExecReply, PostedCall, TaskWake};
use crate::clock::Clock;
use crate::config::LoopConfig;
use crate::error::{LoopError, LoopResult};
use crate::pool::Pool;
use crate::port::{
    Completable, CompletionEvent, CompletionPort, Descriptor, HandleKey, PortError, QueuedStatus,
};
use crate::scheduler::{Scheduler, SchedulerStats, Task, TaskFn, TaskId, TaskState, TaskStatus};
use crate::timer::{combined_deadline, TimerKey, TimerKind, TimerQueue};
use crate::wait::{self, WaitList, WaitRegistration};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Callback run as a task on a loop
pub type LoopFn = Box<dyn FnOnce(&Loop) + Send + 'static>;

// ============================================================================
// Identity & status
// ============================================================================

/// Unique identifier for a Loop
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LoopId(u64);

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

impl LoopId {
    fn next() -> Self {
        LoopId(NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Lifecycle of a loop. Only ever moves forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LoopStatus {
    /// Initialized, run cycle not entered yet
    Created = 0,
    /// Run cycle active
    Running = 1,
    /// Port closed, run cycle about to exit
    Stopping = 2,
    /// Run cycle exited, cleanup in progress
    Draining = 3,
    /// Cleanup done
    Stopped = 4,
}

impl LoopStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LoopStatus::Created,
            1 => LoopStatus::Running,
            2 => LoopStatus::Stopping,
            3 => LoopStatus::Draining,
            _ => LoopStatus::Stopped,
        }
    }
}

/// Loop statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Run-cycle iterations entered
    pub iterations: u64,
    /// Completions dispatched to a handle
    pub completions: u64,
    /// Waits that timed out
    pub timed_out_waits: u64,
    /// Waits that observed the closed port
    pub abandoned_waits: u64,
    /// Fatal wait failures
    pub failed_waits: u64,
    /// Sleep timers fired by the run cycle
    pub sleeps_fired: u64,
    /// Idle timers fired by the run cycle
    pub idles_fired: u64,
    /// Timeout timers fired by the run cycle
    pub timeouts_fired: u64,
    /// Timers resumed by cleanup
    pub timers_terminated: u64,
    /// Waiters handed off by notify
    pub waiters_notified: u64,
    /// Pending sleep timers
    pub pending_sleeps: usize,
    /// Pending idle timers
    pub pending_idles: usize,
    /// Pending timeout timers
    pub pending_timeouts: usize,
    /// Pool slots in use
    pub pool_in_use: usize,
    /// Whether the pool has been released
    pub pool_released: bool,
    /// Task counters
    pub scheduler: SchedulerStats,
}

// ============================================================================
// Internal state
// ============================================================================

/// What a suspended task is waiting for. Only the matching [`Wake`] may
/// resume it, so no early wake-up leaves a stale timer or wait node behind.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Suspension {
    /// `sleep`, `idle` or `timeout`: ended by the timer holding this ticket
    Timer(u64),
    /// `park`: ended by `resume` or a timeout armed with `arm_timeout`
    Parked,
    /// Cross-loop wait or exec: ended by the wake packet
    Remote,
}

/// Source of a resumption
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Wake {
    /// A fired or drained timer; `None` for guards from `arm_timeout`
    Timer(Option<u64>),
    /// `Loop::resume`
    Resume,
    /// A wake packet from another loop
    Packet,
}

impl Suspension {
    fn ended_by(self, wake: Wake) -> bool {
        match (self, wake) {
            (Suspension::Timer(ticket), Wake::Timer(Some(fired))) => ticket == fired,
            (Suspension::Parked, Wake::Timer(None) | Wake::Resume) => true,
            (Suspension::Remote, Wake::Packet) => true,
            _ => false,
        }
    }
}

/// A timer entry: the task to resume and the suspension it ends
struct Armed {
    task: Arc<Task>,
    ticket: Option<u64>,
}

/// Everything only the loop's own context touches
struct LoopState {
    pool: Pool,
    sleeps: TimerQueue<Armed>,
    idles: TimerQueue<Armed>,
    timeouts: TimerQueue<Armed>,
    scheduler: Scheduler,
    suspended: FxHashMap<TaskId, Suspension>,
    next_ticket: u64,
    now: u64,
    last_activity: u64,
    stats: LoopStats,
}

impl LoopState {
    fn new(config: &LoopConfig) -> Self {
        Self {
            pool: Pool::new(config.pool_capacity),
            sleeps: TimerQueue::new(TimerKind::Sleep),
            idles: TimerQueue::new(TimerKind::Idle),
            timeouts: TimerQueue::new(TimerKind::Timeout),
            scheduler: Scheduler::new(config.name.clone(), config.default_stack_size),
            suspended: FxHashMap::default(),
            next_ticket: 0,
            now: 0,
            last_activity: 0,
            stats: LoopStats::default(),
        }
    }

    fn inactivity(&self) -> u64 {
        self.now.saturating_sub(self.last_activity)
    }

    /// What `kind` timers are measured against
    fn reference(&self, kind: TimerKind) -> u64 {
        match kind {
            TimerKind::Sleep => self.now,
            TimerKind::Idle | TimerKind::Timeout => self.inactivity(),
        }
    }

    fn split(&mut self, kind: TimerKind) -> (&mut TimerQueue<Armed>, &mut Pool) {
        let LoopState {
            pool,
            sleeps,
            idles,
            timeouts,
            ..
        } = self;
        let queue = match kind {
            TimerKind::Sleep => sleeps,
            TimerKind::Idle => idles,
            TimerKind::Timeout => timeouts,
        };
        (queue, pool)
    }

    /// Take the right to resume `task` for `wake`, clearing its suspension
    fn claim(&mut self, task: TaskId, wake: Wake) -> bool {
        match self.suspended.get(&task) {
            Some(suspension) if suspension.ended_by(wake) => {
                self.suspended.remove(&task);
                true
            }
            _ => false,
        }
    }
}

struct LoopInner {
    id: LoopId,
    config: LoopConfig,
    port: CompletionPort,
    state: Mutex<LoopState>,
    waiters: Mutex<WaitList>,
    status: AtomicU8,

    /// Thread driving the run cycle
    owner: Mutex<Option<ThreadId>>,

    /// Set for loops created by `start`
    thread: Mutex<Option<JoinHandle<()>>>,

    exited: Mutex<bool>,
    exited_cv: Condvar,

    post_key: HandleKey,
    wake_key: HandleKey,
}

/// How the run cycle reads one wait
enum WaitOutcome {
    Abandoned,
    TimedOut,
    Dispatch(CompletionEvent),
    Fatal(i32),
}

fn classify(status: QueuedStatus) -> WaitOutcome {
    match status {
        QueuedStatus::Failed(PortError::Abandoned) => WaitOutcome::Abandoned,
        QueuedStatus::Failed(PortError::TimedOut) => WaitOutcome::TimedOut,
        QueuedStatus::Failed(PortError::Io(code)) => WaitOutcome::Fatal(code),
        QueuedStatus::Completion {
            key,
            bytes_transferred,
            descriptor,
            error: None,
        } => WaitOutcome::Dispatch(CompletionEvent {
            key,
            bytes_transferred,
            descriptor,
            error: None,
        }),
        // Graceful peer close; the handle sees the error
        QueuedStatus::Completion {
            key,
            bytes_transferred: 0,
            descriptor,
            error: Some(code),
        } => WaitOutcome::Dispatch(CompletionEvent {
            key,
            bytes_transferred: 0,
            descriptor,
            error: Some(code),
        }),
        // Failed after moving data: the handle never sees it
        QueuedStatus::Completion { error: Some(code), .. } => WaitOutcome::Fatal(code),
    }
}

// ============================================================================
// Loop
// ============================================================================

/// Handle to an event loop. Cheap to clone; every clone refers to the same
/// loop.
#[derive(Clone)]
pub struct Loop {
    inner: Arc<LoopInner>,
}

impl Loop {
    fn create(config: LoopConfig) -> LoopResult<Loop> {
        let port = CompletionPort::new();
        let keys = port
            .register(Arc::new(AsyncPost))
            .and_then(|post| Ok((post, port.register(Arc::new(TaskWake))?)));
        let (post_key, wake_key) = match keys {
            Ok(keys) => keys,
            Err(e) => {
                let _ = port.close();
                return Err(e);
            }
        };

        let mut state = LoopState::new(&config);
        state.pool.init();

        let lp = Loop {
            inner: Arc::new(LoopInner {
                id: LoopId::next(),
                config,
                port,
                state: Mutex::new(state),
                waiters: Mutex::new(WaitList::new()),
                status: AtomicU8::new(LoopStatus::Created as u8),
                owner: Mutex::new(None),
                thread: Mutex::new(None),
                exited: Mutex::new(false),
                exited_cv: Condvar::new(),
                post_key,
                wake_key,
            }),
        };
        tracing::debug!(loop_name = lp.name(), id = lp.id().as_u64(), "loop created");
        Ok(lp)
    }

    /// Create a loop and run it on a new named thread.
    pub fn start(config: LoopConfig) -> LoopResult<Loop> {
        let lp = Self::create(config)?;
        let runner = lp.clone();
        let spawned = thread::Builder::new()
            .name(lp.name().to_string())
            .spawn(move || {
                if let Err(e) = runner.run_internal() {
                    tracing::error!(loop_name = runner.name(), error = %e, "loop failed to run");
                }
            });
        match spawned {
            Ok(handle) => {
                *lp.inner.thread.lock() = Some(handle);
                Ok(lp)
            }
            Err(err) => {
                let err = LoopError::from(err);
                lp.abandon();
                Err(err)
            }
        }
    }

    /// Create a loop on the calling thread and run it until stopped.
    ///
    /// `callback`, if any, is posted before the cycle starts and runs as the
    /// loop's first task with `stack_size` (`0` = configured default).
    pub fn run(config: LoopConfig, callback: Option<LoopFn>, stack_size: usize) -> LoopResult<()> {
        let lp = Self::create(config)?;
        if let Some(callback) = callback {
            if let Err(e) = lp.post_call(PostedCall::new(callback, stack_size)) {
                lp.abandon();
                return Err(e);
            }
        }
        lp.run_internal()
    }

    /// [`run`](Loop::run) with a bootstrap closure and the default stack
    pub fn run_with<F>(config: LoopConfig, f: F) -> LoopResult<()>
    where
        F: FnOnce(&Loop) + Send + 'static,
    {
        Self::run(config, Some(Box::new(f)), 0)
    }

    /// Tear down a loop whose run cycle never started
    fn abandon(&self) {
        *self.inner.owner.lock() = Some(thread::current().id());
        self.advance_status(LoopStatus::Draining);
        self.cleanup();
        if !self.inner.port.is_closed() {
            let _ = self.inner.port.close();
        }
        self.advance_status(LoopStatus::Stopped);
        self.mark_exited();
    }

    fn run_internal(&self) -> LoopResult<()> {
        {
            let mut owner = self.inner.owner.lock();
            if owner.is_some() {
                return Err(LoopError::InvalidState("loop is already running"));
            }
            *owner = Some(thread::current().id());
        }
        let _ = self.inner.status.compare_exchange(
            LoopStatus::Created as u8,
            LoopStatus::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        {
            let mut st = self.lock_state();
            st.scheduler.init();
            let now = self.clock().now();
            st.now = now;
            st.last_activity = now;
        }
        tracing::debug!(loop_name = self.name(), id = self.id().as_u64(), "loop running");

        self.run_cycle();

        self.advance_status(LoopStatus::Draining);
        self.cleanup();
        if !self.inner.port.is_closed() {
            if let Err(e) = self.inner.port.close() {
                tracing::warn!(loop_name = self.name(), error = %e, "port close failed");
            }
        }
        self.advance_status(LoopStatus::Stopped);
        self.mark_exited();
        tracing::debug!(loop_name = self.name(), "loop stopped");
        Ok(())
    }

    fn run_cycle(&self) {
        loop {
            self.lock_state().stats.iterations += 1;

            if self.process_timers(TimerKind::Sleep) > 0 {
                self.refresh_activity();
            }

            let bound = self.wait_bound().map(Duration::from_millis);
            let status = self.inner.port.wait(bound);
            self.refresh_now();

            let mut fatal = false;
            match classify(status) {
                WaitOutcome::Abandoned => {
                    self.lock_state().stats.abandoned_waits += 1;
                    tracing::debug!(loop_name = self.name(), "port closed, leaving run cycle");
                    break;
                }
                WaitOutcome::TimedOut => {
                    self.lock_state().stats.timed_out_waits += 1;
                    tracing::trace!(loop_name = self.name(), "wait timed out");
                    if self.process_timers(TimerKind::Idle) > 0 {
                        self.refresh_activity();
                    }
                }
                WaitOutcome::Dispatch(event) => {
                    self.dispatch(event);
                    self.refresh_activity();
                }
                WaitOutcome::Fatal(code) => {
                    self.lock_state().stats.failed_waits += 1;
                    tracing::error!(loop_name = self.name(), code, "completion wait failed");
                    fatal = true;
                }
            }

            self.process_timers(TimerKind::Timeout);
            self.refresh_now();

            if fatal {
                break;
            }
        }
        self.advance_status(LoopStatus::Stopping);
    }

    fn dispatch(&self, event: CompletionEvent) {
        let Some(handle) = self.inner.port.resolve(event.key) else {
            tracing::warn!(
                loop_name = self.name(),
                key = ?event.key,
                "completion for unknown handle dropped"
            );
            return;
        };
        self.refresh_activity();
        self.lock_state().stats.completions += 1;
        tracing::trace!(
            loop_name = self.name(),
            bytes = event.bytes_transferred,
            error = ?event.error,
            "dispatching completion"
        );
        handle.process(self, event);
    }

    fn wait_bound(&self) -> Option<u64> {
        let st = self.lock_state();
        let inactivity = st.inactivity();
        combined_deadline([
            st.sleeps.nearest_deadline(st.now),
            st.idles.nearest_deadline(inactivity),
            st.timeouts.nearest_deadline(inactivity),
        ])
    }

    /// Fire every due timer of `kind`. Returns the count of tasks resumed.
    fn process_timers(&self, kind: TimerKind) -> usize {
        let mut fired = {
            let mut st = self.lock_state();
            let reference = st.reference(kind);
            let (queue, pool) = st.split(kind);
            queue.expire(pool, reference)
        };
        // Sleep and idle firings are activity; timers re-armed by the resumed
        // tasks measure inactivity from here
        if !fired.is_empty() && kind != TimerKind::Timeout {
            self.refresh_activity();
        }
        let count = self.resume_armed(kind, &mut fired);

        let mut st = self.lock_state();
        st.split(kind).0.recycle(fired);
        match kind {
            TimerKind::Sleep => st.stats.sleeps_fired += count as u64,
            TimerKind::Idle => st.stats.idles_fired += count as u64,
            TimerKind::Timeout => st.stats.timeouts_fired += count as u64,
        }
        if count > 0 {
            tracing::trace!(loop_name = self.name(), timer = %kind, count, "timers fired");
        }
        count
    }

    /// Resume every pending timer of `kind` exactly once
    fn terminate_timers(&self, kind: TimerKind) -> usize {
        let mut pending = {
            let mut st = self.lock_state();
            let (queue, pool) = st.split(kind);
            queue.drain(pool)
        };
        let count = self.resume_armed(kind, &mut pending);
        let mut st = self.lock_state();
        st.split(kind).0.recycle(pending);
        st.stats.timers_terminated += count as u64;
        count
    }

    /// Resume the task of every entry that still ends its suspension
    fn resume_armed(&self, kind: TimerKind, entries: &mut Vec<Armed>) -> usize {
        let mut resumed = 0;
        for Armed { task, ticket } in entries.drain(..) {
            if !self.lock_state().claim(task.id(), Wake::Timer(ticket)) {
                tracing::debug!(loop_name = self.name(), timer = %kind, task = %task.id(), "stale timer dropped");
                continue;
            }
            resumed += 1;
            if let Err(e) = self.exec_task(&task) {
                tracing::warn!(loop_name = self.name(), timer = %kind, error = %e, "timer resume failed");
            }
        }
        resumed
    }

    fn cleanup(&self) {
        let mut terminated = 0;
        for kind in [TimerKind::Idle, TimerKind::Sleep, TimerKind::Timeout] {
            terminated += self.terminate_timers(kind);
        }

        let notified = wait::notify(self);
        self.lock_state().stats.waiters_notified += notified as u64;

        let cancelled = self.destroy_scheduler();

        let leaked = self.lock_state().pool.cleanup();
        if leaked > 0 {
            tracing::warn!(loop_name = self.name(), leaked, "pool released with live allocations");
        }
        self.inner.port.clear_handles();
        tracing::debug!(
            loop_name = self.name(),
            terminated,
            notified,
            cancelled,
            "loop cleaned up"
        );
    }

    /// Cancel every task still registered, then drop the registry
    fn destroy_scheduler(&self) -> usize {
        let remaining = self.lock_state().scheduler.unfinished();
        let cancelled = remaining.len();
        for task in remaining {
            self.lock_state().scheduler.enter(task.clone());
            task.cancel();
            self.lock_state().scheduler.leave(task.id());
        }
        let mut guard = self.lock_state();
        let st = &mut *guard;
        let stuck = st.scheduler.destroy(&mut st.pool);
        st.suspended.clear();
        if stuck > 0 {
            tracing::warn!(loop_name = self.name(), stuck, "tasks still running at teardown");
        }
        cancelled
    }

    // ------------------------------------------------------------------------
    // Task plumbing
    // ------------------------------------------------------------------------

    /// Resume `task`, tracking it as current, and delete it once finished
    fn exec_task(&self, task: &Arc<Task>) -> LoopResult<TaskStatus> {
        if !self.in_loop_context() {
            return Err(LoopError::InvalidState("task resumed outside its loop"));
        }
        self.lock_state().scheduler.enter(task.clone());
        let result = task.exec();

        let mut guard = self.lock_state();
        let st = &mut *guard;
        st.scheduler.leave(task.id());
        if matches!(result, Ok(TaskStatus::Finished)) {
            st.scheduler.delete(&mut st.pool, task.id());
        }
        result
    }

    /// Create a task for `job` and run it until it first suspends
    pub(crate) fn spawn_task(&self, stack_size: usize, job: LoopFn) -> LoopResult<TaskStatus> {
        self.ensure_accepting()?;
        let lp = self.clone();
        let entry: TaskFn = Box::new(move || job(&lp));
        let task = {
            let mut guard = self.lock_state();
            let st = &mut *guard;
            st.scheduler.create(&mut st.pool, stack_size, entry)?
        };
        self.exec_task(&task)
    }

    /// Resume a task parked on a cross-loop wait or exec
    pub(crate) fn resume_parked(&self, task: &Arc<Task>) {
        {
            let mut st = self.lock_state();
            if !st.scheduler.contains(task.id()) {
                drop(st);
                tracing::warn!(loop_name = self.name(), task = %task.id(), "wake for an unknown task");
                return;
            }
            if !st.claim(task.id(), Wake::Packet) {
                drop(st);
                tracing::warn!(loop_name = self.name(), task = %task.id(), "wake for a task not waiting on another loop");
                return;
            }
        }
        if let Err(e) = self.exec_task(task) {
            tracing::warn!(loop_name = self.name(), task = %task.id(), error = %e, "wake failed");
        }
    }

    /// Hand `task` back to this loop through a wake packet
    pub(crate) fn wake(&self, task: &Arc<Task>) -> LoopResult<()> {
        self.inner
            .port
            .post(self.inner.wake_key, 0, Some(Box::new(task.clone())))
            .map_err(LoopError::from)
    }

    pub(crate) fn post_call(&self, call: PostedCall) -> LoopResult<()> {
        match self.inner.port.post(self.inner.post_key, 0, Some(Box::new(call))) {
            Ok(()) => Ok(()),
            Err(rejected) => {
                let call = rejected
                    .descriptor
                    .and_then(|d| d.downcast::<PostedCall>().ok());
                if let Some(call) = call {
                    (*call).disarm();
                }
                Err(LoopError::HandleClosed)
            }
        }
    }

    pub(crate) fn waiters(&self) -> &Mutex<WaitList> {
        &self.inner.waiters
    }

    /// Whether the calling thread is this loop's thread or one of its
    /// executing tasks
    fn in_loop_context(&self) -> bool {
        let me = thread::current().id();
        if *self.inner.owner.lock() == Some(me) {
            return true;
        }
        self.lock_state()
            .scheduler
            .current()
            .is_some_and(|t| t.is_current_thread())
    }

    pub(crate) fn require_current(&self) -> LoopResult<Arc<Task>> {
        self.current_task().ok_or(LoopError::InvalidState(
            "must be called from within a task of this loop",
        ))
    }

    pub(crate) fn ensure_accepting(&self) -> LoopResult<()> {
        if self.status() >= LoopStatus::Stopping {
            Err(LoopError::Terminated)
        } else {
            Ok(())
        }
    }

    pub(crate) fn same_loop(&self, other: &Loop) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn schedule_timer(&self, kind: TimerKind, armed: Armed, period: u64) -> LoopResult<TimerKey> {
        let mut st = self.lock_state();
        st.now = self.clock().now();
        let reference = st.reference(kind);
        let (queue, pool) = st.split(kind);
        queue.schedule(pool, armed, reference, period)
    }

    fn cancel_timer(&self, key: TimerKey) -> bool {
        let mut st = self.lock_state();
        let (queue, pool) = st.split(key.kind());
        queue.cancel(pool, key).is_some()
    }

    /// Park the current task on a `kind` timer
    fn suspend_on(&self, kind: TimerKind, period: u64) -> LoopResult<()> {
        let task = self.require_current()?;
        self.ensure_accepting()?;
        let ticket = {
            let mut st = self.lock_state();
            st.next_ticket += 1;
            st.next_ticket
        };
        let armed = Armed {
            task: task.clone(),
            ticket: Some(ticket),
        };
        let key = self.schedule_timer(kind, armed, period)?;
        if let Err(e) = self.suspend_as(&task, Suspension::Timer(ticket)) {
            self.cancel_timer(key);
            return Err(e);
        }
        Ok(())
    }

    /// Suspend `task`, the current task, recording what may resume it
    pub(crate) fn suspend_as(&self, task: &Arc<Task>, why: Suspension) -> LoopResult<()> {
        self.lock_state().suspended.insert(task.id(), why);
        let result = task.suspend();
        // Already cleared by whoever resumed us, unless teardown cancelled
        self.lock_state().suspended.remove(&task.id());
        result
    }

    fn lock_state(&self) -> MutexGuard<'_, LoopState> {
        self.inner.state.lock()
    }

    fn refresh_now(&self) {
        let now = self.clock().now();
        self.lock_state().now = now;
    }

    fn refresh_activity(&self) {
        let now = self.clock().now();
        let mut st = self.lock_state();
        st.now = now;
        st.last_activity = now;
    }

    fn advance_status(&self, to: LoopStatus) {
        self.inner.status.fetch_max(to as u8, Ordering::AcqRel);
    }

    fn mark_exited(&self) {
        let mut exited = self.inner.exited.lock();
        *exited = true;
        self.inner.exited_cv.notify_all();
    }

    // ------------------------------------------------------------------------
    // Public API
    // ------------------------------------------------------------------------

    /// Request shutdown by closing the port. Safe from any thread; a second
    /// call is a no-op.
    pub fn stop(&self) -> LoopResult<()> {
        match self.inner.port.close() {
            Ok(()) => {
                self.advance_status(LoopStatus::Stopping);
                tracing::debug!(loop_name = self.name(), "stop requested");
            }
            Err(_) => tracing::trace!(loop_name = self.name(), "loop already stopping"),
        }
        Ok(())
    }

    /// Stop `target` and park the current task until `target` has cleaned
    /// up.
    pub fn stop_and_wait(&self, target: &Loop) -> LoopResult<()> {
        let task = self.require_current()?;
        match wait::wait_exec(self, target, false)? {
            WaitRegistration::TargetFinished => Ok(()),
            WaitRegistration::Registered(key) => {
                if let Err(e) = target.stop() {
                    target.waiters().lock().remove(key);
                    return Err(e);
                }
                if let Err(e) = self.suspend_as(&task, Suspension::Remote) {
                    target.waiters().lock().remove(key);
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Park the current task until `target` has cleaned up, without asking
    /// it to stop.
    pub fn wait(&self, target: &Loop) -> LoopResult<()> {
        wait::wait_exec(self, target, true).map(|_| ())
    }

    /// Queue `f` to run as a new task on this loop. Safe from any thread.
    pub fn post<F>(&self, stack_size: usize, f: F) -> LoopResult<()>
    where
        F: FnOnce(&Loop) + Send + 'static,
    {
        self.post_call(PostedCall::new(Box::new(f), stack_size))
    }

    /// Run `f` as a task on `target` and park the current task until it
    /// has returned. Fails with `Terminated` if `target` dropped it unrun.
    pub fn exec<F>(&self, target: &Loop, stack_size: usize, f: F) -> LoopResult<()>
    where
        F: FnOnce(&Loop) + Send + 'static,
    {
        let task = self.require_current()?;
        self.ensure_accepting()?;

        let (reply, outcome) = ExecReply::new(self.clone(), task.clone());
        target.post_call(PostedCall::with_reply(Box::new(f), stack_size, reply))?;
        self.suspend_as(&task, Suspension::Remote)?;

        match outcome.try_recv() {
            Ok(ExecOutcome::Completed) => Ok(()),
            Ok(ExecOutcome::Dropped) | Err(_) => Err(LoopError::Terminated),
        }
    }

    /// Run `f` as a new task right now, returning when it first suspends or
    /// finishes. Only valid on the loop's own thread or inside one of its
    /// tasks.
    pub fn call<F>(&self, stack_size: usize, f: F) -> LoopResult<()>
    where
        F: FnOnce(&Loop) + Send + 'static,
    {
        if !self.in_loop_context() {
            return Err(LoopError::InvalidState("call is only valid inside the loop"));
        }
        self.spawn_task(stack_size, Box::new(f)).map(|_| ())
    }

    /// Park the current task for `ms` of loop time
    pub fn sleep(&self, ms: u64) -> LoopResult<()> {
        self.suspend_on(TimerKind::Sleep, ms)
    }

    /// Park the current task until the loop has seen no completion for `ms`.
    /// Checked only when a wait times out.
    pub fn idle(&self, ms: u64) -> LoopResult<()> {
        self.suspend_on(TimerKind::Idle, ms)
    }

    /// Park the current task until the loop has seen no completion for `ms`.
    /// Checked every iteration.
    pub fn timeout(&self, ms: u64) -> LoopResult<()> {
        self.suspend_on(TimerKind::Timeout, ms)
    }

    /// Schedule a timeout timer that resumes `task`, typically around a
    /// [`park`](Loop::park)ed I/O wait. Loop context only.
    pub fn arm_timeout(&self, task: &Arc<Task>, ms: u64) -> LoopResult<TimerKey> {
        if !self.in_loop_context() {
            return Err(LoopError::InvalidState("arm_timeout is only valid inside the loop"));
        }
        self.ensure_accepting()?;
        let guard = Armed {
            task: task.clone(),
            ticket: None,
        };
        self.schedule_timer(TimerKind::Timeout, guard, ms)
    }

    /// Cancel a timer before it fires. Returns whether it was still pending.
    pub fn disarm_timeout(&self, key: TimerKey) -> bool {
        self.cancel_timer(key)
    }

    /// Park the current task until something [`resume`](Loop::resume)s it
    /// or a timeout armed for it fires.
    pub fn park(&self) -> LoopResult<()> {
        let task = self.require_current()?;
        self.ensure_accepting()?;
        self.suspend_as(&task, Suspension::Parked)
    }

    /// Resume a task of this loop suspended in [`park`](Loop::park). Tasks
    /// suspended in a timer or a cross-loop wait are refused. Loop context
    /// only.
    pub fn resume(&self, task: &Arc<Task>) -> LoopResult<TaskStatus> {
        if !self.in_loop_context() {
            return Err(LoopError::InvalidState("resume is only valid inside the loop"));
        }
        {
            let mut st = self.lock_state();
            if !st.scheduler.contains(task.id()) {
                return Err(LoopError::InvalidState("task does not belong to this loop"));
            }
            if task.state() != TaskState::Suspended || !st.claim(task.id(), Wake::Resume) {
                return Err(LoopError::InvalidState("task is not parked"));
            }
        }
        self.exec_task(task)
    }

    /// The task calling this, if it is one of this loop's
    pub fn current_task(&self) -> Option<Arc<Task>> {
        self.lock_state()
            .scheduler
            .current()
            .filter(|t| t.is_current_thread())
            .cloned()
    }

    /// Register a completion handle with this loop's port
    pub fn register(&self, handle: Arc<dyn Completable>) -> LoopResult<HandleKey> {
        self.inner.port.register(handle)
    }

    /// Remove a handle. Returns whether it was registered.
    pub fn deregister(&self, key: HandleKey) -> bool {
        self.inner.port.deregister(key).is_some()
    }

    /// Report a successful operation on `key`. Safe from any thread.
    pub fn complete(&self, key: HandleKey, bytes: usize, descriptor: Option<Descriptor>) -> LoopResult<()> {
        self.inner.port.post(key, bytes, descriptor).map_err(LoopError::from)
    }

    /// Report a failed operation on `key`. Safe from any thread.
    ///
    /// With zero `bytes` the handle sees a peer close; a failure that moved
    /// bytes ends the run cycle instead.
    pub fn complete_with_error(
        &self,
        key: HandleKey,
        bytes: usize,
        descriptor: Descriptor,
        code: i32,
    ) -> LoopResult<()> {
        self.inner
            .port
            .post_failure(key, bytes, descriptor, code)
            .map_err(LoopError::from)
    }

    /// Block until the thread of a started loop has exited. Not valid from
    /// inside the loop.
    pub fn join(&self) -> LoopResult<()> {
        if self.in_loop_context() {
            return Err(LoopError::InvalidState("a loop cannot join itself"));
        }
        let handle = self.inner.thread.lock().take();
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| LoopError::InvalidState("loop thread panicked")),
            None => {
                self.wait_stopped(None);
                Ok(())
            }
        }
    }

    /// Block until cleanup finished, at most `timeout`. Returns whether it
    /// did.
    pub fn wait_stopped(&self, timeout: Option<Duration>) -> bool {
        let mut exited = self.inner.exited.lock();
        match timeout.and_then(|t| Instant::now().checked_add(t)) {
            Some(deadline) => {
                while !*exited {
                    if self.inner.exited_cv.wait_until(&mut exited, deadline).timed_out() {
                        break;
                    }
                }
            }
            None => {
                while !*exited {
                    self.inner.exited_cv.wait(&mut exited);
                }
            }
        }
        *exited
    }

    /// Snapshot of the loop's counters
    pub fn stats(&self) -> LoopStats {
        let st = self.lock_state();
        let mut stats = st.stats.clone();
        stats.pending_sleeps = st.sleeps.len();
        stats.pending_idles = st.idles.len();
        stats.pending_timeouts = st.timeouts.len();
        stats.pool_in_use = st.pool.in_use();
        stats.pool_released = st.pool.is_released();
        stats.scheduler = st.scheduler.stats();
        stats
    }

    /// Current lifecycle status
    pub fn status(&self) -> LoopStatus {
        LoopStatus::from_u8(self.inner.status.load(Ordering::Acquire))
    }

    /// Loop time as of the last refresh, in milliseconds
    pub fn now(&self) -> u64 {
        self.lock_state().now
    }

    /// Loop name
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Loop id
    pub fn id(&self) -> LoopId {
        self.inner.id
    }

    /// Time source
    pub fn clock(&self) -> &dyn Clock {
        self.inner.config.clock.as_ref()
    }

    /// Settings the loop was created with
    pub fn config(&self) -> &LoopConfig {
        &self.inner.config
    }
}

impl fmt::Debug for Loop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loop")
            .field("id", &self.inner.id)
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}
