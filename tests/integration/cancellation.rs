//! Cooperative cancellation.

use std::time::Duration;

use ravel::{Affinity, TaskError, TaskState};

use crate::fixtures::{manager, wait_until, Trace};

/// Test: cancellation path
/// Given a long-running body watching its token, followed by catch and finally
/// When cancellation is requested
/// Then the body ends cancelled, catch is skipped and finally runs with Cancelled
#[test]
fn test_cancel_runs_finally_and_skips_catch() {
    let tm = manager();
    let trace = Trace::new();
    let (t1, t2) = (trace.clone(), trace.clone());
    let (started_tx, started_rx) = crossbeam_channel::bounded(1);

    let body = tm.task(move |cx| {
        let _ = started_tx.send(());
        while !cx.is_cancelled() {
            std::thread::sleep(Duration::from_millis(1));
        }
        cx.check_cancelled()?;
        Ok(())
    });
    let end = body
        .catch(move |_| t1.push("catch"))
        .finally(Affinity::Concurrent, move |success, err| {
            let cancelled = err.map(|e| e.is_cancelled()).unwrap_or(false);
            t2.push(format!("finally:{}:{}", success, cancelled));
        });
    end.start();

    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    tm.cancel();
    assert!(wait_until(Duration::from_secs(5), || end.is_finished()));

    assert_eq!(trace.snapshot(), vec!["finally:false:true"]);
    assert_eq!(trace.count("catch"), 0);
    assert_eq!(body.state(), TaskState::Cancelled);
    assert_eq!(end.state(), TaskState::Succeeded);
}

/// Test: cancellation keeps the UI and exclusive schedulers serving finally
/// Given a body spinning until cancelled, with a UI finally and an exclusive finally
/// When cancellation is requested
/// Then both finally handlers run on their own threads with Cancelled
#[test]
fn test_cancel_runs_ui_and_exclusive_finally() {
    let tm = manager();
    let trace = Trace::new();
    let (t1, t2) = (trace.clone(), trace.clone());
    let (started_tx, started_rx) = crossbeam_channel::bounded(1);

    let body = tm.task(move |cx| {
        let _ = started_tx.send(());
        while !cx.is_cancelled() {
            std::thread::sleep(Duration::from_millis(1));
        }
        Err::<(), _>(TaskError::Cancelled)
    });
    let ui_end = body.finally_with_result(Affinity::Ui, move |_, err, _| {
        t1.push("ui finally");
        (err.map(|e| e.is_cancelled()), std::thread::current().id())
    });
    let exclusive_end = ui_end.finally_with_result(Affinity::Exclusive, move |success, _, _| {
        t2.push("exclusive finally");
        (success, std::thread::current().id())
    });
    exclusive_end.start();

    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    tm.cancel();
    assert!(wait_until(Duration::from_secs(5), || exclusive_end.is_finished()));

    assert_eq!(trace.snapshot(), vec!["ui finally", "exclusive finally"]);
    let (cancelled, ui_thread) = ui_end.result().unwrap();
    assert_eq!(cancelled, Some(true));
    assert_eq!(Some(ui_thread), tm.ui_thread_id());
    let (success, exclusive_thread) = exclusive_end.result().unwrap();
    assert!(success);
    assert_eq!(exclusive_thread, tm.exclusive_thread_id());
    assert_eq!(ui_end.state(), TaskState::Succeeded);
    assert!(!tm.ui_pump().is_stopped());
}

/// Test: UI work submitted after cancellation still runs
#[test]
fn test_pump_keeps_ticking_after_cancel() {
    let tm = manager();
    tm.cancel();
    let value = tm.send_to_ui(|| "still pumping").unwrap();
    assert_eq!(value, "still pumping");
}

/// Test: bodies do not start after cancellation
#[test]
fn test_body_not_run_after_cancel() {
    let tm = manager();
    let trace = Trace::new();
    let t = trace.clone();
    tm.cancel();
    let task = tm.task(move |_| {
        t.push("ran");
        Ok(())
    });
    assert!(matches!(task.wait(), Err(TaskError::Cancelled)));
    assert_eq!(trace.len(), 0);
}

/// Test: cancellation skips OnSuccess continuations but not finally
#[test]
fn test_cancel_mid_chain() {
    let tm = manager();
    let trace = Trace::new();
    let (t1, t2) = (trace.clone(), trace.clone());
    let end = tm
        .task(|_| -> Result<(), TaskError> { Err(TaskError::Cancelled) })
        .then(move |_, _| {
            t1.push("then");
            Ok(())
        })
        .finally_with_result(Affinity::Exclusive, move |success, err, _| {
            t2.push("finally");
            (success, err.map(|e| e.is_cancelled()))
        });
    assert_eq!(end.wait().unwrap(), (false, Some(true)));
    assert_eq!(trace.snapshot(), vec!["finally"]);
}

/// Test: stopping the manager settles queued work instead of hanging awaiters
#[tokio::test]
async fn test_stop_does_not_hang_awaiters() {
    let tm = manager();
    let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(1);
    let blocker = tm.task_on(Affinity::Exclusive, move |_| {
        let _ = gate_rx.recv_timeout(Duration::from_millis(200));
        Ok(())
    });
    let follower = blocker.then_in_ui(|_, _| Ok("after"));
    let pending = follower.start_as_async();

    tm.stop();
    drop(gate_tx);
    let result = tokio::time::timeout(Duration::from_secs(10), pending)
        .await
        .expect("awaiter hung after stop");
    assert!(matches!(result, Err(TaskError::Cancelled)));
}

/// Test: child tokens follow the manager
#[test]
fn test_child_token_cancelled_with_manager() {
    let tm = manager();
    let child = tm.cancellation().child();
    assert!(!child.is_cancelled());
    tm.cancel();
    assert!(child.is_cancelled());
    assert!(tm.token().is_cancelled());
}
