//! Integration tests for loop start / run / stop and the timer classes

mod common;

use common::{eventually, init_test_logging, shutdown, start_loop, PATIENCE};
use crossbeam::channel;
use fiberloop::{Completable, CompletionEvent, Loop, LoopConfig, LoopError, LoopStatus, ManualClock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// Start / stop
// ============================================================================

#[test]
fn test_stop_unblocks_the_wait_and_cleans_up() {
    let lp = start_loop("stop-unblocks");
    thread::sleep(Duration::from_millis(20));
    assert_eq!(lp.status(), LoopStatus::Running);

    shutdown(&lp);

    assert_eq!(lp.status(), LoopStatus::Stopped);
    let stats = lp.stats();
    // Blocked with no timers: exactly one abandoned wait, no timeouts
    assert_eq!(stats.abandoned_waits, 1);
    assert_eq!(stats.timed_out_waits, 0);
    assert!(stats.pool_released);
    assert_eq!(stats.pool_in_use, 0);
    assert_eq!(stats.pending_sleeps + stats.pending_idles + stats.pending_timeouts, 0);
    assert_eq!(stats.scheduler.active_tasks, 0);
}

#[test]
fn test_stop_is_idempotent() {
    let lp = start_loop("stop-twice");
    assert!(lp.stop().is_ok());
    assert!(lp.stop().is_ok());
    lp.join().unwrap();
    assert!(lp.stop().is_ok());
    assert!(lp.wait_stopped(Some(Duration::ZERO)));
}

#[test]
fn test_post_after_stop_is_rejected() {
    let lp = start_loop("post-after-stop");
    shutdown(&lp);
    assert_eq!(lp.post(0, |_| {}), Err(LoopError::HandleClosed));
}

#[test]
fn test_run_blocks_until_bootstrap_stops_the_loop() {
    init_test_logging();
    let (tx, rx) = channel::unbounded();
    Loop::run_with(LoopConfig::default().with_name("run-sleep"), move |lp| {
        let before = lp.clock().now();
        lp.sleep(10).unwrap();
        tx.send(lp.clock().now() - before).unwrap();
        lp.stop().unwrap();
    })
    .unwrap();

    let advanced = rx.recv_timeout(PATIENCE).unwrap();
    assert!(advanced >= 10, "sleep(10) resumed after {advanced} ms");
}

#[test]
fn test_join_from_inside_the_loop_is_invalid() {
    let lp = start_loop("self-join");
    let (tx, rx) = channel::unbounded();
    lp.post(0, move |lp| {
        tx.send(lp.join()).unwrap();
    })
    .unwrap();
    assert!(matches!(
        rx.recv_timeout(PATIENCE).unwrap(),
        Err(LoopError::InvalidState(_))
    ));
    shutdown(&lp);
}

// ============================================================================
// Timers
// ============================================================================

#[test]
fn test_sleep_waits_for_clock_advancement() {
    init_test_logging();
    let clock = Arc::new(ManualClock::new(0));
    let lp = Loop::start(
        LoopConfig::default()
            .with_name("manual-sleep")
            .with_clock(clock.clone()),
    )
    .unwrap();

    let woke = Arc::new(AtomicBool::new(false));
    let w = woke.clone();
    lp.post(0, move |lp| {
        lp.sleep(10).unwrap();
        w.store(true, Ordering::SeqCst);
    })
    .unwrap();
    assert!(eventually(|| lp.stats().pending_sleeps == 1));

    clock.advance(9);
    thread::sleep(Duration::from_millis(30));
    assert!(!woke.load(Ordering::SeqCst));

    clock.advance(1);
    assert!(eventually(|| woke.load(Ordering::SeqCst)));
    assert!(eventually(|| lp.stats().sleeps_fired == 1));
    shutdown(&lp);
}

#[test]
fn test_idle_fires_repeatedly_without_io() {
    init_test_logging();
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    Loop::run_with(LoopConfig::default().with_name("idle-repeat"), move |lp| {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(200) {
            lp.idle(50).unwrap();
            f.fetch_add(1, Ordering::SeqCst);
        }
        lp.stop().unwrap();
    })
    .unwrap();
    assert!(fired.load(Ordering::SeqCst) >= 3);
}

#[test]
fn test_timeout_measures_inactivity() {
    init_test_logging();
    let (tx, rx) = channel::unbounded();
    Loop::run_with(LoopConfig::default().with_name("timeout"), move |lp| {
        let start = Instant::now();
        lp.timeout(30).unwrap();
        tx.send(start.elapsed()).unwrap();
        lp.stop().unwrap();
    })
    .unwrap();
    assert!(rx.recv_timeout(PATIENCE).unwrap() >= Duration::from_millis(30));
}

/// Counts completions
struct Counter(Arc<AtomicUsize>);

impl Completable for Counter {
    fn process(&self, _lp: &Loop, _event: CompletionEvent) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_idle_holds_off_while_completions_arrive() {
    let lp = start_loop("idle-busy");
    let hits = Arc::new(AtomicUsize::new(0));
    let key = lp.register(Arc::new(Counter(hits.clone()))).unwrap();
    let (tx, rx) = channel::unbounded();
    lp.post(0, move |lp| {
        tx.send(lp.idle(100)).unwrap();
    })
    .unwrap();
    assert!(eventually(|| lp.stats().pending_idles == 1));

    // A completion every 10 ms for 300 ms
    let feeder = lp.clone();
    thread::spawn(move || {
        for _ in 0..30 {
            feeder.complete(key, 1, None).unwrap();
            thread::sleep(Duration::from_millis(10));
        }
    })
    .join()
    .unwrap();
    assert!(eventually(|| hits.load(Ordering::SeqCst) == 30));
    assert_eq!(lp.stats().idles_fired, 0);
    assert!(rx.try_recv().is_err());

    // Quiet from here on
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), Ok(()));
    assert!(eventually(|| lp.stats().idles_fired == 1));
    shutdown(&lp);
}

#[test]
fn test_timeout_fires_on_the_dispatch_iteration() {
    init_test_logging();
    // A frozen clock keeps inactivity at zero
    let lp = Loop::start(
        LoopConfig::default()
            .with_name("same-iteration")
            .with_clock(Arc::new(ManualClock::new(0))),
    )
    .unwrap();
    let (tx, rx) = channel::unbounded();
    lp.post(0, move |lp| {
        let before = lp.stats();
        lp.timeout(0).unwrap();
        let after_timeout = lp.stats();
        lp.idle(0).unwrap();
        let after_idle = lp.stats();
        tx.send((before, after_timeout, after_idle)).unwrap();
    })
    .unwrap();

    let (before, after_timeout, after_idle) = rx.recv_timeout(PATIENCE).unwrap();
    // The timeout pass right after dispatching the post resumed it
    assert_eq!(after_timeout.iterations, before.iterations);
    assert_eq!(after_timeout.timed_out_waits, before.timed_out_waits);
    // Idle timers need an iteration whose wait timed out
    assert!(after_idle.iterations > after_timeout.iterations);
    assert!(after_idle.timed_out_waits > after_timeout.timed_out_waits);
    shutdown(&lp);
}

#[test]
fn test_disarmed_timeout_never_fires() {
    let lp = start_loop("disarm");
    let (tx, rx) = channel::unbounded();
    lp.post(0, move |lp| {
        let me = lp.current_task().unwrap();
        let key = lp.arm_timeout(&me, 10).unwrap();
        tx.send(lp.disarm_timeout(key)).unwrap();
        tx.send(lp.disarm_timeout(key)).unwrap();
    })
    .unwrap();
    assert!(rx.recv_timeout(PATIENCE).unwrap());
    assert!(!rx.recv_timeout(PATIENCE).unwrap());
    thread::sleep(Duration::from_millis(30));
    assert_eq!(lp.stats().timeouts_fired, 0);
    shutdown(&lp);
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_stop_fires_pending_timers_exactly_once() {
    let lp = start_loop("terminate-timers");
    let (tx, rx) = channel::unbounded();
    for _ in 0..3 {
        let tx = tx.clone();
        lp.post(0, move |lp| {
            tx.send(lp.sleep(60_000)).unwrap();
            // Teardown resumed us; the loop takes no new timers
            tx.send(lp.sleep(1)).unwrap();
        })
        .unwrap();
    }
    assert!(eventually(|| lp.stats().pending_sleeps == 3));
    shutdown(&lp);

    let results: Vec<_> = rx.try_iter().collect();
    assert_eq!(results.len(), 6);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
    assert_eq!(
        results.iter().filter(|r| **r == Err(LoopError::Terminated)).count(),
        3
    );
    let stats = lp.stats();
    assert_eq!(stats.timers_terminated, 3);
    assert_eq!(stats.sleeps_fired, 0);
    assert!(stats.pool_released);
}

#[test]
fn test_parked_task_is_cancelled_at_teardown() {
    let lp = start_loop("cancel-parked");
    let (tx, rx) = channel::unbounded();
    lp.post(0, move |lp| {
        tx.send(lp.park()).unwrap();
    })
    .unwrap();
    assert!(eventually(|| lp.stats().scheduler.active_tasks == 1));
    shutdown(&lp);
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), Err(LoopError::Terminated));
    assert_eq!(lp.stats().scheduler.active_tasks, 0);
}

// ============================================================================
// Tasks
// ============================================================================

#[test]
fn test_call_runs_until_the_inner_task_suspends() {
    let lp = start_loop("nested-call");
    let (tx, rx) = channel::unbounded();
    lp.post(0, move |lp| {
        tx.send("outer-start").unwrap();
        let inner = tx.clone();
        lp.call(0, move |_| inner.send("inner-done").unwrap()).unwrap();
        let inner = tx.clone();
        lp.call(0, move |lp| {
            lp.sleep(5).unwrap();
            inner.send("inner-woke").unwrap();
        })
        .unwrap();
        tx.send("outer-end").unwrap();
    })
    .unwrap();

    let order: Vec<_> = (0..4).map(|_| rx.recv_timeout(PATIENCE).unwrap()).collect();
    assert_eq!(order, vec!["outer-start", "inner-done", "outer-end", "inner-woke"]);
    shutdown(&lp);
}

#[test]
fn test_call_from_outside_the_loop_is_invalid() {
    let lp = start_loop("call-outside");
    assert!(matches!(lp.call(0, |_| {}), Err(LoopError::InvalidState(_))));
    shutdown(&lp);
}

#[test]
fn test_panicking_task_leaves_the_loop_running() {
    let lp = start_loop("panic");
    lp.post(0, |_| panic!("task failure")).unwrap();
    let (tx, rx) = channel::unbounded();
    lp.post(0, move |_| tx.send(()).unwrap()).unwrap();
    assert!(rx.recv_timeout(PATIENCE).is_ok());
    shutdown(&lp);
    assert_eq!(lp.stats().scheduler.tasks_completed, 2);
}

#[test]
fn test_pool_capacity_surfaces_out_of_memory() {
    init_test_logging();
    let lp = Loop::start(
        LoopConfig::default()
            .with_name("tight-pool")
            .with_pool_capacity(1),
    )
    .unwrap();
    let (tx, rx) = channel::unbounded();
    lp.post(0, move |lp| {
        // The task itself holds the only slot
        tx.send(lp.sleep(1)).unwrap();
    })
    .unwrap();
    assert!(matches!(
        rx.recv_timeout(PATIENCE).unwrap(),
        Err(LoopError::OutOfMemory(_))
    ));
    shutdown(&lp);
}

#[test]
fn test_custom_stack_size_task() {
    let lp = start_loop("stack-size");
    let (tx, rx) = channel::unbounded();
    lp.post(1024 * 1024, move |_| {
        let buf = [1u8; 256 * 1024];
        tx.send(buf.iter().map(|&b| b as usize).sum::<usize>()).unwrap();
    })
    .unwrap();
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), 256 * 1024);
    shutdown(&lp);
}
