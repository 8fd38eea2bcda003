//! Process tasks against real programs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ravel::{Affinity, ProcessEnvironment, ProcessSpec, TaskError, TaskState};

use crate::fixtures::{git_available, manager, wait_until, TestRepo};

/// Test: git process task
/// Given a temporary repository
/// When `git log --oneline` runs as a task in it
/// Then the output holds the initial commit
#[test]
fn test_git_log_in_repo() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let repo = TestRepo::new();
    let tm = manager().with_process_environment(ProcessEnvironment::new().with_working_dir(&repo.path));
    let output = tm
        .process(ProcessSpec::git(["log", "--oneline"]))
        .wait()
        .unwrap();
    assert!(output.success());
    assert_eq!(output.stdout.len(), 1);
    assert!(output.stdout[0].contains("Initial commit"));
}

/// Test: nonzero exit faults the task and reaches catch
#[test]
fn test_git_failure_is_process_failed() {
    if !git_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let tm = manager();
    let caught = Arc::new(Mutex::new(None));
    let c = caught.clone();
    let task = tm
        .process(ProcessSpec::git(["rev-parse", "HEAD"]).cwd(dir.path()))
        .catch(move |e| *c.lock().unwrap() = Some(e.clone()));
    assert!(task.wait().is_err());
    match caught.lock().unwrap().clone() {
        Some(TaskError::ProcessFailed { program, code, .. }) => {
            assert_eq!(program, "git");
            assert_ne!(code, Some(0));
        }
        other => panic!("unexpected {:?}", other),
    };
}

/// Test: output streams line by line and feeds a UI continuation
#[cfg(unix)]
#[test]
fn test_streamed_output_then_ui() {
    let tm = manager();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let l = lines.clone();
    let spec = ProcessSpec::new("sh")
        .args(["-c", "for i in 1 2 3; do echo line$i; done"])
        .on_output(move |line| l.lock().unwrap().push(line.to_string()));
    let ui_thread = tm.ui_thread_id();
    let summary = tm
        .process(spec)
        .then_in_ui(move |cx, output| {
            assert_eq!(Some(cx.thread_id()), ui_thread);
            Ok(output.stdout.join(","))
        })
        .wait()
        .unwrap();
    assert_eq!(summary, "line1,line2,line3");
    assert_eq!(*lines.lock().unwrap(), vec!["line1", "line2", "line3"]);
}

/// Test: cancelling kills a running child
#[cfg(unix)]
#[test]
fn test_cancel_kills_child() {
    let tm = manager();
    let task = tm
        .process(ProcessSpec::new("sh").args(["-c", "echo started; sleep 30"]))
        .with_affinity(Affinity::Exclusive);
    let started = Arc::new(Mutex::new(false));
    task.on_start({
        let started = started.clone();
        move |_| *started.lock().unwrap() = true
    });
    task.start();
    assert!(wait_until(Duration::from_secs(5), || *started.lock().unwrap()));
    std::thread::sleep(Duration::from_millis(50));
    tm.cancel();
    assert!(wait_until(Duration::from_secs(5), || task.is_finished()));
    assert_eq!(task.state(), TaskState::Cancelled);
}

/// Test: a missing program faults instead of panicking
#[test]
fn test_missing_program_faults() {
    let tm = manager();
    let task = tm.process(ProcessSpec::new("ravel-no-such-program"));
    let err = task.wait().unwrap_err();
    assert!(err.to_string().contains("ravel-no-such-program"));
    assert_eq!(task.state(), TaskState::Faulted);
}
