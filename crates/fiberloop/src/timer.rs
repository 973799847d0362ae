//! Timer queues: sleep, idle and timeout
//!
//! Each queue is ordered by `(deadline, insertion sequence)`, so the earliest
//! deadline fires first and equal deadlines fire in insertion order. What a
//! deadline is measured against depends on the [`TimerKind`]: sleep timers
//! compare with the absolute loop time, idle and timeout timers with the
//! inactivity span (`now - last_activity`). The queue itself only ever sees
//! the `reference` value the loop passes in.
//!
//! Every live entry holds one slot of the loop's [`Pool`].

use crate::error::LoopResult;
use crate::pool::Pool;
use std::collections::BTreeMap;
use std::fmt;

/// Emptied snapshots a queue holds on to for reuse
const SPARE_SNAPSHOTS: usize = 4;

/// Which clock a queue measures against
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Absolute time, checked before each wait
    Sleep,
    /// Inactivity, checked only after a wait times out
    Idle,
    /// Inactivity, checked after every iteration
    Timeout,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimerKind::Sleep => "sleep",
            TimerKind::Idle => "idle",
            TimerKind::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Handle to a scheduled entry, used to cancel it early
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    kind: TimerKind,
    deadline: u64,
    seq: u64,
}

impl TimerKey {
    /// Queue the entry lives in
    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    /// Deadline, in the queue's reference units
    pub fn deadline(&self) -> u64 {
        self.deadline
    }
}

/// One ordered timer queue
pub struct TimerQueue<T> {
    kind: TimerKind,
    entries: BTreeMap<(u64, u64), T>,
    next_seq: u64,
    spare: Vec<Vec<T>>,
}

impl<T> TimerQueue<T> {
    /// Create an empty queue
    pub fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
            next_seq: 0,
            spare: Vec::new(),
        }
    }

    /// Queue kind
    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    /// Insert `item` to fire at `reference + period`.
    ///
    /// Fails with `OutOfMemory` when the pool has no slot left.
    pub fn schedule(
        &mut self,
        pool: &mut Pool,
        item: T,
        reference: u64,
        period: u64,
    ) -> LoopResult<TimerKey> {
        pool.alloc("timer entry")?;
        let deadline = reference.saturating_add(period);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((deadline, seq), item);
        Ok(TimerKey {
            kind: self.kind,
            deadline,
            seq,
        })
    }

    /// Time left until the earliest entry fires; `None` when empty.
    pub fn nearest_deadline(&self, reference: u64) -> Option<u64> {
        self.entries
            .keys()
            .next()
            .map(|&(deadline, _)| deadline.saturating_sub(reference))
    }

    /// Remove every entry whose deadline is `<= reference`, in firing order.
    ///
    /// The returned vector is a snapshot: entries scheduled while the caller
    /// walks it are not part of it. Hand it back with
    /// [`recycle`](TimerQueue::recycle) once drained.
    pub fn expire(&mut self, pool: &mut Pool, reference: u64) -> Vec<T> {
        let mut due = self.spare.pop().unwrap_or_default();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > reference {
                break;
            }
            due.push(entry.remove());
            pool.free();
        }
        due
    }

    /// Remove a pending entry. Returns it if it had not fired yet.
    pub fn cancel(&mut self, pool: &mut Pool, key: TimerKey) -> Option<T> {
        if key.kind != self.kind {
            return None;
        }
        let item = self.entries.remove(&(key.deadline, key.seq))?;
        pool.free();
        Some(item)
    }

    /// Remove every entry regardless of deadline, in firing order.
    pub fn drain(&mut self, pool: &mut Pool) -> Vec<T> {
        let mut all = self.spare.pop().unwrap_or_default();
        while let Some((_, item)) = self.entries.pop_first() {
            all.push(item);
            pool.free();
        }
        all
    }

    /// Hand back a walked snapshot so the next pass reuses its capacity
    pub fn recycle(&mut self, mut snapshot: Vec<T>) {
        if self.spare.len() < SPARE_SNAPSHOTS {
            snapshot.clear();
            self.spare.push(snapshot);
        }
    }

    /// Whether `key` is still pending
    pub fn contains(&self, key: TimerKey) -> bool {
        key.kind == self.kind && self.entries.contains_key(&(key.deadline, key.seq))
    }

    /// Pending entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No pending entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Smallest of several nearest deadlines; `None` (infinite) when all are.
pub fn combined_deadline<I>(deadlines: I) -> Option<u64>
where
    I: IntoIterator<Item = Option<u64>>,
{
    deadlines.into_iter().flatten().min()
}
