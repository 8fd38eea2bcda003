//! Thread affinity and the UI pump.

use std::time::Duration;

use ravel::{Affinity, Error, TaskManager};

use crate::fixtures::manager;

/// Test: affinity hops
/// Given A(UI) -> B(Concurrent) -> C(UI)
/// When the chain runs
/// Then A and C ran on the pump thread and B did not
#[test]
fn test_ui_concurrent_ui_thread_ids() {
    let tm = manager();
    let ids = tm
        .task_on(Affinity::Ui, |cx| Ok(cx.thread_id()))
        .then(|cx, a| Ok((a, cx.thread_id())))
        .then_in_ui(|cx, (a, b)| Ok((a, b, cx.thread_id())))
        .wait()
        .unwrap();
    let (a, b, c) = ids;
    let ui = tm.ui_thread_id().unwrap();
    assert_eq!(a, ui);
    assert_eq!(c, ui);
    assert_ne!(b, ui);
}

/// Test: UI send
/// Given a running pump
/// When a value is sent from another thread
/// Then it comes back after the pump ran it
#[test]
fn test_ui_send_returns_hello() {
    let tm = manager();
    let ui = tm.ui_thread_id();
    let (value, ran_on) = tm
        .send_to_ui(|| ("Hello".to_string(), std::thread::current().id()))
        .unwrap();
    assert_eq!(value, "Hello");
    assert_eq!(Some(ran_on), ui);
}

/// Test: UI task observed from another thread
/// Given a UI-affine task returning "Hello"
/// When a worker thread starts it and waits for it
/// Then the worker gets "Hello", produced on the pump thread
#[test]
fn test_ui_task_hello_observed_from_worker() {
    let tm = manager();
    let task = tm.task_on(Affinity::Ui, |cx| Ok(("Hello".to_string(), cx.thread_id())));
    let observer = {
        let task = task.clone();
        std::thread::spawn(move || (task.wait(), std::thread::current().id()))
    };
    let (result, observer_thread) = observer.join().unwrap();
    let (value, ran_on) = result.unwrap();
    assert_eq!(value, "Hello");
    assert_eq!(Some(ran_on), tm.ui_thread_id());
    assert_ne!(ran_on, observer_thread);
    assert_eq!(task.result().map(|(v, _)| v), Some("Hello".to_string()));
}

/// Test: send from the pump thread runs inline instead of deadlocking
#[test]
fn test_send_from_pump_thread_runs_inline() {
    let tm = manager();
    let pump = tm.ui_pump().clone();
    let nested = tm
        .task_on(Affinity::Ui, move |_| {
            Ok(pump.send_with_result(|| 40 + 2)?)
        })
        .wait()
        .unwrap();
    assert_eq!(nested, 42);
}

/// Test: posts from a worker land on the pump thread
#[test]
fn test_post_to_ui_from_worker() {
    let tm = manager();
    let (tx, rx) = crossbeam_channel::bounded(1);
    tm.post_to_ui(move || {
        let _ = tx.send(std::thread::current().id());
    })
    .unwrap();
    let ran_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(Some(ran_on), tm.ui_thread_id());
}

/// Test: stopped pump rejects sends
#[test]
fn test_send_after_stop_fails() {
    let tm = manager();
    tm.stop();
    assert!(matches!(
        tm.send_to_ui(|| ()),
        Err(Error::PumpStopped)
    ));
}

/// Test: exclusive tasks share one worker thread
#[test]
fn test_exclusive_tasks_share_worker() {
    let tm = manager();
    let a = tm.task_on(Affinity::Exclusive, |cx| Ok(cx.thread_id()));
    let b = tm.task_on(Affinity::Exclusive, |cx| Ok(cx.thread_id()));
    let (a, b) = (a.wait().unwrap(), b.wait().unwrap());
    assert_eq!(a, b);
    assert_eq!(a, tm.exclusive_thread_id());
}

/// Test: retargeting a task before it starts
#[test]
fn test_with_affinity_before_start() {
    let tm = manager();
    let task = tm
        .task(|cx| Ok(cx.affinity()))
        .with_affinity(Affinity::Exclusive);
    assert_eq!(task.affinity(), Affinity::Exclusive);
    assert_eq!(task.wait().unwrap(), Affinity::Exclusive);
}

/// Test: two managers keep separate pumps
#[test]
fn test_managers_have_independent_pumps() {
    let first: TaskManager = manager();
    let second: TaskManager = manager();
    assert_ne!(first.ui_thread_id(), second.ui_thread_id());
}
