//! Fault propagation through catch, finally and failure continuations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ravel::{Affinity, RunCondition, TaskError, TaskState};

use crate::fixtures::{manager, wait_until, Trace};

/// Test: fault propagation
/// Given a chain with a failing step followed by then/catch/then/catch/finally
/// When it runs
/// Then each catch sees the fault once, finally runs once, no then runs
#[test]
fn test_fault_reaches_every_catch_and_finally_once() {
    let tm = manager();
    let trace = Trace::new();
    let (t1, t2, t3, t4, t5) = (
        trace.clone(),
        trace.clone(),
        trace.clone(),
        trace.clone(),
        trace.clone(),
    );
    let end = tm
        .task(|_| -> Result<(), TaskError> { Err(TaskError::msg("broken")) })
        .then(move |_, _| {
            t1.push("then1");
            Ok(())
        })
        .catch(move |e| t2.push(format!("catch1:{}", e)))
        .then(move |_, _| {
            t3.push("then2");
            Ok(())
        })
        .catch(move |e| t4.push(format!("catch2:{}", e)))
        .finally(Affinity::Concurrent, move |success, err| {
            t5.push(format!("finally:{}:{}", success, err.map(|e| e.to_string()).unwrap_or_default()));
        });

    end.wait().unwrap();
    assert_eq!(
        trace.snapshot(),
        vec!["catch1:broken", "catch2:broken", "finally:false:broken"]
    );
}

/// Test: absorbing catch
/// Given a catch that absorbs the fault
/// When the chain continues
/// Then later catches and OnFailure nodes stay quiet and finally sees a success
#[test]
fn test_absorbed_fault() {
    let tm = manager();
    let trace = Trace::new();
    let (t1, t2, t3) = (trace.clone(), trace.clone(), trace.clone());
    let head = tm
        .task(|_| -> Result<(), TaskError> { Err(TaskError::msg("handled")) })
        .catch_and_absorb(move |_| {
            t1.push("absorb");
            true
        })
        .catch(move |_| t2.push("late catch"));
    let recovery = tm.task(move |_| {
        t3.push("recovery");
        Ok(())
    });
    let recovery = head.then_task(&recovery, RunCondition::OnFailure).unwrap();
    let seen = recovery.finally_with_result(Affinity::Concurrent, |success, err, _| {
        (success, err.map(|e| e.to_string()))
    });

    assert_eq!(seen.wait().unwrap(), (true, None));
    assert_eq!(trace.snapshot(), vec!["absorb"]);
    assert_eq!(recovery.state(), TaskState::Cancelled);
}

/// Test: success path resumes after absorption
/// Given a faulting task whose fault a catch absorbs
/// When OnSuccess continuations follow the catch
/// Then they run, and a plain then sees the absorbed value as None
#[test]
fn test_on_success_runs_after_absorbed_fault() {
    let tm = manager();
    let trace = Trace::new();
    let (t1, t2) = (trace.clone(), trace.clone());
    let absorbed = tm
        .task(|_| -> Result<i32, TaskError> { Err(TaskError::msg("e")) })
        .catch_and_absorb(|_| true);

    let follow_up = tm.task(move |_| {
        t1.push("on success");
        Ok("resumed")
    });
    let follow_up = absorbed
        .then_task(&follow_up, RunCondition::OnSuccess)
        .unwrap();
    let mapped = absorbed.then(move |_, value: Option<i32>| {
        t2.push("then");
        Ok(value.unwrap_or(-1))
    });

    assert_eq!(follow_up.wait().unwrap(), "resumed");
    assert_eq!(mapped.wait().unwrap(), -1);
    assert_eq!(follow_up.state(), TaskState::Succeeded);
    assert_eq!(trace.count("on success"), 1);
    assert_eq!(trace.count("then"), 1);
}

/// Test: OnFailure continuation
/// Given an OnFailure continuation after a failing task
/// When the task faults
/// Then the continuation runs
#[test]
fn test_on_failure_continuation_runs() {
    let tm = manager();
    let failing = tm.task(|_| -> Result<(), TaskError> { Err(TaskError::msg("no")) });
    let recovery = tm.task(|_| Ok("recovered"));
    let recovery = failing
        .then_task(&recovery, RunCondition::OnFailure)
        .unwrap();
    assert_eq!(recovery.wait().unwrap(), "recovered");
}

/// Test: Always continuation after a fault still runs its body
#[test]
fn test_always_continuation_runs_after_fault() {
    let tm = manager();
    let failing = tm.task(|_| -> Result<(), TaskError> { Err(TaskError::msg("no")) });
    let cleanup = tm.task(|_| Ok(1));
    let cleanup = failing.then_task(&cleanup, RunCondition::Always).unwrap();
    assert_eq!(cleanup.wait().unwrap(), 1);
}

/// Test: a panicking finally handler starts a new unobserved fault
#[test]
fn test_panicking_finally_reports_unobserved() {
    let tm = manager();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    tm.set_unobserved_fault_handler(move |_, err| {
        if matches!(err, TaskError::Panicked(_)) {
            h.fetch_add(1, Ordering::SeqCst);
        }
    });
    let end = tm
        .task(|_| Ok(()))
        .finally(Affinity::Concurrent, |_, _| panic!("finally blew up"));
    end.start();
    assert!(wait_until(Duration::from_secs(5), || hits.load(Ordering::SeqCst) == 1));
    assert_eq!(end.state(), TaskState::Faulted);
}

/// Test: faults seen by a catch are not reported as unobserved
#[test]
fn test_caught_fault_is_not_reported() {
    let tm = manager();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    tm.set_unobserved_fault_handler(move |_, _| {
        h.fetch_add(1, Ordering::SeqCst);
    });
    let (tx, rx) = crossbeam_channel::bounded(1);
    let end = tm
        .task(|_| -> Result<(), TaskError> { Err(TaskError::msg("seen")) })
        .catch(|_| {});
    end.on_end(move |state, _| {
        let _ = tx.send(state);
    });
    end.start();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        TaskState::Faulted
    );
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

/// Test: start_and_swallow_exception never errors or hangs
#[tokio::test]
async fn test_swallow_exception_resolves_for_every_outcome() {
    let tm = manager();
    let ok = tm.task(|_| Ok(3));
    let faulted = tm.task(|_| -> Result<i32, TaskError> { Err(TaskError::msg("f")) });
    let panicked = tm.task(|_| -> Result<i32, TaskError> { panic!("p") });
    let cancelled = tm.task(|_| -> Result<i32, TaskError> { Err(TaskError::Cancelled) });

    let results = tokio::time::timeout(Duration::from_secs(10), async {
        (
            ok.start_and_swallow_exception().await,
            faulted.start_and_swallow_exception().await,
            panicked.start_and_swallow_exception().await,
            cancelled.start_and_swallow_exception().await,
        )
    })
    .await
    .unwrap();
    assert_eq!(results, (Some(3), None, None, None));
    assert_eq!(cancelled.state(), TaskState::Cancelled);
}

/// Test: awaiting a faulted chain end returns the error
#[tokio::test]
async fn test_start_as_async_returns_fault() {
    let tm = manager();
    let task = tm
        .task(|_| Ok(1))
        .then(|_, _: i32| -> Result<i32, TaskError> { Err(TaskError::msg("step two")) });
    match task.start_as_async().await {
        Err(TaskError::Failed { message }) => assert_eq!(message, "step two"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(task.error(), Some(TaskError::Failed { .. })));
}

/// Test: tokio-test block_on drives a task future
#[test]
fn test_block_on_task_future() {
    let tm = manager();
    let task = tm.task(|_| Ok("sync caller"));
    let value = tokio_test::block_on(task.start_as_async()).unwrap();
    assert_eq!(value, "sync caller");
}
