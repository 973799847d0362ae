//! Completion port
//!
//! A portable completion queue in the shape of an I/O completion port:
//! producers on any thread [`post`](CompletionPort::post) packets, the loop
//! thread blocks in [`wait`](CompletionPort::wait) for the next one, and
//! [`close`](CompletionPort::close) makes every current and future wait
//! report [`PortError::Abandoned`].
//!
//! Packets name their target by [`HandleKey`], a generation-checked key into
//! the port's handle registry. The registered [`Completable`] receives the
//! packet as a [`CompletionEvent`] when the loop dispatches it.

use crate::arena::{Arena, ArenaKey};
use crate::error::{LoopError, LoopResult};
use crate::event_loop::Loop;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Wait reported by a port that has been closed; the IOCP
/// `ERROR_ABANDONED_WAIT_0` value
pub const ABANDONED_WAIT_CODE: i32 = 735;

/// Wait that ran out of time; the IOCP `WAIT_TIMEOUT` value
pub const TIMED_OUT_CODE: i32 = 258;

/// Per-operation payload carried by a packet
pub type Descriptor = Box<dyn Any + Send>;

/// Key of a handle registered with a port
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HandleKey(ArenaKey);

/// Capability of a handle that receives completions
pub trait Completable: Send + Sync {
    /// Handle one completion. Runs on the loop thread with no loop lock held.
    fn process(&self, lp: &Loop, event: CompletionEvent);
}

/// A dequeued packet, as delivered to a [`Completable`]
pub struct CompletionEvent {
    /// Handle the packet was posted to
    pub key: HandleKey,
    /// Bytes the operation transferred
    pub bytes_transferred: usize,
    /// Per-operation payload
    pub descriptor: Option<Descriptor>,
    /// Platform error code when the operation failed
    pub error: Option<i32>,
}

impl CompletionEvent {
    /// Take the descriptor out if it has type `D`
    pub fn take_descriptor<D: Any>(&mut self) -> Option<Box<D>> {
        let descriptor = self.descriptor.take()?;
        match descriptor.downcast::<D>() {
            Ok(d) => Some(d),
            Err(other) => {
                self.descriptor = Some(other);
                None
            }
        }
    }

    /// Borrow the descriptor if it has type `D`
    pub fn descriptor_ref<D: Any>(&self) -> Option<&D> {
        self.descriptor.as_ref().and_then(|d| (**d).downcast_ref::<D>())
    }

    /// Failed with nothing transferred: the peer closed gracefully
    pub fn is_peer_closed(&self) -> bool {
        self.error.is_some() && self.bytes_transferred == 0
    }
}

impl fmt::Debug for CompletionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionEvent")
            .field("key", &self.key)
            .field("bytes_transferred", &self.bytes_transferred)
            .field("has_descriptor", &self.descriptor.is_some())
            .field("error", &self.error)
            .finish()
    }
}

/// Why a wait did not produce a successful packet
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PortError {
    /// The port was closed
    Abandoned,
    /// The wait bound elapsed with nothing queued
    TimedOut,
    /// The port itself failed
    Io(i32),
}

impl PortError {
    /// Platform code for this outcome
    pub fn code(self) -> i32 {
        match self {
            PortError::Abandoned => ABANDONED_WAIT_CODE,
            PortError::TimedOut => TIMED_OUT_CODE,
            PortError::Io(code) => code,
        }
    }
}

/// Result of one [`CompletionPort::wait`]
pub enum QueuedStatus {
    /// A packet posted to a handle was dequeued
    Completion {
        /// Handle the packet was posted to
        key: HandleKey,
        /// Bytes the operation transferred
        bytes_transferred: usize,
        /// Per-operation payload
        descriptor: Option<Descriptor>,
        /// Platform error code when the operation failed
        error: Option<i32>,
    },
    /// No handle packet: the port closed, the wait timed out or the port
    /// itself failed
    Failed(PortError),
}

impl fmt::Debug for QueuedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueuedStatus::Completion {
                key,
                bytes_transferred,
                descriptor,
                error,
            } => f
                .debug_struct("Completion")
                .field("key", key)
                .field("bytes_transferred", bytes_transferred)
                .field("has_descriptor", &descriptor.is_some())
                .field("error", error)
                .finish(),
            QueuedStatus::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
        }
    }
}

/// A post refused by a closed port; hands the descriptor back
pub struct Rejected {
    /// Descriptor of the refused packet
    pub descriptor: Option<Descriptor>,
}

impl From<Rejected> for LoopError {
    fn from(_: Rejected) -> Self {
        LoopError::HandleClosed
    }
}

enum Packet {
    Completion {
        key: HandleKey,
        bytes: usize,
        descriptor: Option<Descriptor>,
        error: Option<i32>,
    },
    Fault(i32),
}

struct PortState {
    queue: VecDeque<Packet>,
    closed: bool,
}

/// Multi-producer, single-consumer completion queue
pub struct CompletionPort {
    state: Mutex<PortState>,
    ready: Condvar,
    handles: Mutex<Arena<Arc<dyn Completable>>>,
}

impl CompletionPort {
    /// Create an open port
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PortState {
                queue: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
            handles: Mutex::new(Arena::new()),
        }
    }

    /// Register a handle. Fails once the port is closed.
    pub fn register(&self, handle: Arc<dyn Completable>) -> LoopResult<HandleKey> {
        if self.is_closed() {
            return Err(LoopError::HandleClosed);
        }
        Ok(HandleKey(self.handles.lock().insert(handle)))
    }

    /// Remove a handle; later packets for its key are dropped at dispatch
    pub fn deregister(&self, key: HandleKey) -> Option<Arc<dyn Completable>> {
        self.handles.lock().remove(key.0)
    }

    /// Look up a live handle
    pub fn resolve(&self, key: HandleKey) -> Option<Arc<dyn Completable>> {
        self.handles.lock().get(key.0).cloned()
    }

    /// Drop every registered handle
    pub fn clear_handles(&self) -> usize {
        let handles = self.handles.lock().drain();
        handles.len()
    }

    /// Queue a successful completion
    pub fn post(
        &self,
        key: HandleKey,
        bytes: usize,
        descriptor: Option<Descriptor>,
    ) -> Result<(), Rejected> {
        self.enqueue(Packet::Completion {
            key,
            bytes,
            descriptor,
            error: None,
        })
    }

    /// Queue a failed completion. A failure always carries its descriptor.
    pub fn post_failure(
        &self,
        key: HandleKey,
        bytes: usize,
        descriptor: Descriptor,
        code: i32,
    ) -> Result<(), Rejected> {
        self.enqueue(Packet::Completion {
            key,
            bytes,
            descriptor: Some(descriptor),
            error: Some(code),
        })
    }

    /// Queue a failure of the port itself, seen by the waiter as
    /// [`PortError::Io`]. A loop draining the port leaves its run cycle on it.
    pub fn post_fault(&self, code: i32) -> Result<(), Rejected> {
        self.enqueue(Packet::Fault(code))
    }

    fn enqueue(&self, packet: Packet) -> Result<(), Rejected> {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            let descriptor = match packet {
                Packet::Completion { descriptor, .. } => descriptor,
                Packet::Fault(_) => None,
            };
            return Err(Rejected { descriptor });
        }
        state.queue.push_back(packet);
        self.ready.notify_one();
        Ok(())
    }

    /// Block for the next packet, at most `timeout` (`None` = forever).
    ///
    /// A closed port reports [`PortError::Abandoned`] even if packets were
    /// queued before the close.
    pub fn wait(&self, timeout: Option<Duration>) -> QueuedStatus {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return QueuedStatus::Failed(PortError::Abandoned);
            }
            if let Some(packet) = state.queue.pop_front() {
                return match packet {
                    Packet::Completion {
                        key,
                        bytes,
                        descriptor,
                        error,
                    } => QueuedStatus::Completion {
                        key,
                        bytes_transferred: bytes,
                        descriptor,
                        error,
                    },
                    Packet::Fault(code) => QueuedStatus::Failed(PortError::Io(code)),
                };
            }
            match (timeout, deadline) {
                (Some(_), Some(deadline)) => {
                    if Instant::now() >= deadline {
                        return QueuedStatus::Failed(PortError::TimedOut);
                    }
                    self.ready.wait_until(&mut state, deadline);
                }
                // No bound, or one too large to represent
                _ => self.ready.wait(&mut state),
            }
        }
    }

    /// Close the port, waking every waiter. Queued packets are discarded.
    ///
    /// A second close reports `InvalidState`.
    pub fn close(&self) -> LoopResult<()> {
        let discarded = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(LoopError::InvalidState("completion port already closed"));
            }
            state.closed = true;
            self.ready.notify_all();
            std::mem::take(&mut state.queue)
        };
        // Descriptors may post elsewhere when dropped; never under our lock
        drop(discarded);
        Ok(())
    }

    /// Whether `close` ran
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Packets waiting to be dequeued
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }
}

impl Default for CompletionPort {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct Nop;

    impl Completable for Nop {
        fn process(&self, _lp: &Loop, _event: CompletionEvent) {}
    }

    fn port_with_handle() -> (CompletionPort, HandleKey) {
        let port = CompletionPort::new();
        let key = port.register(Arc::new(Nop)).unwrap();
        (port, key)
    }

    /// Unpack a dequeued handle packet
    fn completion(status: QueuedStatus) -> (HandleKey, usize, Option<Descriptor>, Option<i32>) {
        match status {
            QueuedStatus::Completion {
                key,
                bytes_transferred,
                descriptor,
                error,
            } => (key, bytes_transferred, descriptor, error),
            other => panic!("expected a completion, got {other:?}"),
        }
    }

    fn failure(status: QueuedStatus) -> PortError {
        match status {
            QueuedStatus::Failed(err) => err,
            other => panic!("expected a failed wait, got {other:?}"),
        }
    }

    #[test]
    fn test_post_then_wait_is_fifo() {
        let (port, key) = port_with_handle();
        port.post(key, 1, None).ok().unwrap();
        port.post(key, 2, Some(Box::new("two"))).ok().unwrap();
        assert_eq!(port.pending(), 2);

        let (first_key, first_bytes, _, first_error) = completion(port.wait(Some(Duration::ZERO)));
        assert_eq!(first_key, key);
        assert_eq!(first_bytes, 1);
        assert_eq!(first_error, None);

        let (_, bytes, descriptor, _) = completion(port.wait(None));
        assert_eq!(bytes, 2);
        let d = descriptor.unwrap();
        assert_eq!(d.downcast_ref::<&str>(), Some(&"two"));
    }

    #[test]
    fn test_wait_times_out() {
        let port = CompletionPort::new();
        assert_eq!(failure(port.wait(Some(Duration::from_millis(10)))), PortError::TimedOut);
    }

    #[test]
    fn test_failure_keeps_descriptor() {
        let (port, key) = port_with_handle();
        port.post_failure(key, 0, Box::new(7u8), 10054).ok().unwrap();
        let (_, bytes, descriptor, error) = completion(port.wait(None));
        assert_eq!(bytes, 0);
        assert_eq!(error, Some(10054));
        assert!(descriptor.is_some());
    }

    #[test]
    fn test_fault_is_a_port_failure_in_queue_order() {
        let (port, key) = port_with_handle();
        port.post(key, 3, None).ok().unwrap();
        port.post_fault(1450).ok().unwrap();

        assert_eq!(completion(port.wait(None)).1, 3);
        assert_eq!(failure(port.wait(None)), PortError::Io(1450));
        assert_eq!(PortError::Io(1450).code(), 1450);

        port.close().unwrap();
        assert!(port.post_fault(1450).err().unwrap().descriptor.is_none());
    }

    #[test]
    fn test_close_abandons_blocked_wait() {
        let port = Arc::new(CompletionPort::new());
        let waiter = {
            let port = port.clone();
            thread::spawn(move || failure(port.wait(None)))
        };
        thread::sleep(Duration::from_millis(20));
        port.close().unwrap();
        assert_eq!(waiter.join().unwrap(), PortError::Abandoned);
    }

    #[test]
    fn test_double_close_and_post_after_close() {
        let (port, key) = port_with_handle();
        port.post(key, 0, None).ok().unwrap();
        port.close().unwrap();
        assert!(matches!(port.close(), Err(LoopError::InvalidState(_))));
        assert_eq!(port.pending(), 0);

        let rejected = port.post(key, 0, Some(Box::new(5u32))).err().unwrap();
        assert_eq!(
            rejected.descriptor.and_then(|d| d.downcast::<u32>().ok()).map(|b| *b),
            Some(5)
        );
        assert_eq!(failure(port.wait(None)), PortError::Abandoned);
        assert!(matches!(port.register(Arc::new(Nop)), Err(LoopError::HandleClosed)));
    }

    #[test]
    fn test_deregistered_key_no_longer_resolves() {
        let (port, key) = port_with_handle();
        assert!(port.resolve(key).is_some());
        assert!(port.deregister(key).is_some());
        assert!(port.resolve(key).is_none());
        let other = port.register(Arc::new(Nop)).unwrap();
        assert_ne!(key, other);
        assert!(port.resolve(key).is_none());
        assert_eq!(port.clear_handles(), 1);
    }

    #[test]
    fn test_event_descriptor_downcast() {
        let (_port, key) = port_with_handle();
        let mut event = CompletionEvent {
            key,
            bytes_transferred: 0,
            descriptor: Some(Box::new(String::from("payload"))),
            error: Some(64),
        };
        assert!(event.is_peer_closed());
        assert!(event.take_descriptor::<u32>().is_none());
        assert_eq!(event.descriptor_ref::<String>().map(String::as_str), Some("payload"));
        assert_eq!(event.take_descriptor::<String>().map(|b| *b), Some("payload".to_string()));
        assert!(event.descriptor.is_none());
    }
}
