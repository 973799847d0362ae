//! Cross-loop wait / notify and exec

mod common;

use common::{eventually, shutdown, start_loop, PATIENCE};
use crossbeam::channel;
use fiberloop::{LoopError, LoopStatus};
use std::thread;
use std::time::Duration;

#[test]
fn test_stop_and_wait_resumes_after_target_exit() {
    let waiter = start_loop("saw-waiter");
    let target = start_loop("saw-target");
    let (tx, rx) = channel::unbounded();

    let t = target.clone();
    waiter
        .post(0, move |lp| {
            let result = lp.stop_and_wait(&t);
            tx.send((result, t.status(), t.stats().abandoned_waits)).unwrap();
        })
        .unwrap();

    let (result, status, abandoned) = rx.recv_timeout(PATIENCE).unwrap();
    assert_eq!(result, Ok(()));
    // The target's run cycle was over before the waiter resumed
    assert!(status >= LoopStatus::Draining);
    assert_eq!(abandoned, 1);

    target.join().unwrap();
    assert_eq!(target.stats().waiters_notified, 1);
    shutdown(&waiter);
}

#[test]
fn test_wait_does_not_stop_the_target() {
    let waiter = start_loop("wait-waiter");
    let target = start_loop("wait-target");
    let (tx, rx) = channel::unbounded();

    let t = target.clone();
    waiter
        .post(0, move |lp| {
            tx.send(lp.wait(&t)).unwrap();
        })
        .unwrap();

    thread::sleep(Duration::from_millis(30));
    assert_eq!(target.status(), LoopStatus::Running);
    assert!(rx.try_recv().is_err());

    shutdown(&target);
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), Ok(()));
    shutdown(&waiter);
}

#[test]
fn test_wait_on_finished_target_returns_immediately() {
    let waiter = start_loop("finished-waiter");
    let target = start_loop("finished-target");
    shutdown(&target);

    let (tx, rx) = channel::unbounded();
    let t = target.clone();
    waiter
        .post(0, move |lp| {
            tx.send((lp.wait(&t), lp.stop_and_wait(&t))).unwrap();
        })
        .unwrap();
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), (Ok(()), Ok(())));
    shutdown(&waiter);
}

#[test]
fn test_wait_on_self_is_invalid() {
    let lp = start_loop("self-wait");
    let (tx, rx) = channel::unbounded();
    lp.post(0, move |lp| {
        tx.send(lp.wait(lp)).unwrap();
    })
    .unwrap();
    assert!(matches!(
        rx.recv_timeout(PATIENCE).unwrap(),
        Err(LoopError::InvalidState(_))
    ));
    shutdown(&lp);
}

#[test]
fn test_waiter_removed_when_its_loop_stops_first() {
    let waiter = start_loop("gone-waiter");
    let target = start_loop("gone-target");
    let (tx, rx) = channel::unbounded();

    let t = target.clone();
    waiter
        .post(0, move |lp| {
            tx.send(lp.wait(&t)).unwrap();
        })
        .unwrap();
    assert!(eventually(|| waiter.stats().scheduler.active_tasks == 1));
    thread::sleep(Duration::from_millis(10));

    // Tearing the waiter down cancels the parked task
    shutdown(&waiter);
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), Err(LoopError::Terminated));

    // Its node is gone, so the target has nobody to notify
    shutdown(&target);
    assert_eq!(target.stats().waiters_notified, 0);
}

#[test]
fn test_exec_runs_on_target_and_resumes_caller() {
    let caller = start_loop("exec-caller");
    let target = start_loop("exec-target");
    let (tx, rx) = channel::unbounded();
    let target_id = target.id();

    let t = target.clone();
    caller
        .post(0, move |lp| {
            let (seen_tx, seen_rx) = channel::bounded(1);
            let result = lp.exec(&t, 0, move |remote| {
                seen_tx.send(remote.id()).unwrap();
            });
            // The callback finished before exec returned
            tx.send((result, seen_rx.try_recv().ok())).unwrap();
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), (Ok(()), Some(target_id)));
    shutdown(&target);
    shutdown(&caller);
}

#[test]
fn test_exec_on_stopped_target_is_rejected() {
    let caller = start_loop("exec-closed-caller");
    let target = start_loop("exec-closed-target");
    shutdown(&target);

    let (tx, rx) = channel::unbounded();
    let t = target.clone();
    caller
        .post(0, move |lp| {
            tx.send(lp.exec(&t, 0, |_| {})).unwrap();
        })
        .unwrap();
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), Err(LoopError::HandleClosed));
    shutdown(&caller);
}

#[test]
fn test_exec_dropped_by_stopping_target_terminates_caller() {
    let caller = start_loop("exec-drop-caller");
    let target = start_loop("exec-drop-target");
    let (busy_tx, busy_rx) = channel::unbounded();
    let (tx, rx) = channel::unbounded();

    // Keep the target's thread busy so the exec packet stays queued
    target
        .post(0, move |_| {
            busy_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(150));
        })
        .unwrap();
    busy_rx.recv_timeout(PATIENCE).unwrap();

    let t = target.clone();
    caller
        .post(0, move |lp| {
            let (ran_tx, ran_rx) = channel::bounded(1);
            let result = lp.exec(&t, 0, move |_| ran_tx.send(()).unwrap());
            tx.send((result, ran_rx.try_recv().is_ok())).unwrap();
        })
        .unwrap();
    thread::sleep(Duration::from_millis(40));
    target.stop().unwrap();

    assert_eq!(
        rx.recv_timeout(PATIENCE).unwrap(),
        (Err(LoopError::Terminated), false)
    );
    target.join().unwrap();
    shutdown(&caller);
}

#[test]
fn test_exec_callback_panic_terminates_caller() {
    let caller = start_loop("exec-panic-caller");
    let target = start_loop("exec-panic-target");
    let (tx, rx) = channel::unbounded();

    let t = target.clone();
    caller
        .post(0, move |lp| {
            tx.send(lp.exec(&t, 0, |_| panic!("remote failure"))).unwrap();
        })
        .unwrap();
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), Err(LoopError::Terminated));

    // The target keeps serving
    let (ok_tx, ok_rx) = channel::unbounded();
    target.post(0, move |_| ok_tx.send(()).unwrap()).unwrap();
    assert!(ok_rx.recv_timeout(PATIENCE).is_ok());
    shutdown(&target);
    shutdown(&caller);
}

#[test]
fn test_resume_refuses_a_task_waiting_on_another_loop() {
    let waiter = start_loop("remote-resume-waiter");
    let target = start_loop("remote-resume-target");
    let (task_tx, task_rx) = channel::unbounded();
    let (tx, rx) = channel::unbounded();

    let t = target.clone();
    waiter
        .post(0, move |lp| {
            task_tx.send(lp.current_task().unwrap()).unwrap();
            tx.send(lp.wait(&t)).unwrap();
        })
        .unwrap();
    let parked = task_rx.recv_timeout(PATIENCE).unwrap();

    let (resume_tx, resume_rx) = channel::unbounded();
    waiter
        .post(0, move |lp| resume_tx.send(lp.resume(&parked)).unwrap())
        .unwrap();
    assert!(matches!(
        resume_rx.recv_timeout(PATIENCE).unwrap(),
        Err(LoopError::InvalidState(_))
    ));
    assert!(rx.try_recv().is_err());

    // Only the target's notify ends the wait
    shutdown(&target);
    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), Ok(()));
    assert_eq!(target.stats().waiters_notified, 1);
    shutdown(&waiter);
}

#[test]
fn test_exec_keeps_the_callers_task_data() {
    let caller = start_loop("exec-data-caller");
    let target = start_loop("exec-data-target");
    let (tx, rx) = channel::unbounded();

    let t = target.clone();
    caller
        .post(0, move |lp| {
            let me = lp.current_task().unwrap();
            me.set_data(Box::new(7u32));
            let result = lp.exec(&t, 0, |_| {});
            tx.send((result, me.take_data::<u32>().map(|d| *d))).unwrap();
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(PATIENCE).unwrap(), (Ok(()), Some(7)));
    shutdown(&target);
    shutdown(&caller);
}
