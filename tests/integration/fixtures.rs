//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Building a task manager with a fast UI tick
//! - Recording execution traces across threads
//! - Creating temporary git repositories

use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use ravel::{RuntimeConfig, TaskManager};

/// A manager whose UI pump ticks every millisecond.
pub fn manager() -> TaskManager {
    manager_with_threads(4)
}

pub fn manager_with_threads(threads: usize) -> TaskManager {
    TaskManager::new(
        RuntimeConfig::default()
            .with_ui_tick(Duration::from_millis(1))
            .with_concurrent_threads(threads),
    )
    .expect("Failed to create task manager")
}

/// Thread-safe, append-only record of what ran.
#[derive(Clone, Default)]
pub struct Trace {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.as_str() == entry)
            .count()
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

pub fn git_available() -> bool {
    which::which("git").is_ok()
}

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// Kept alive for the lifetime of the repo.
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test User"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(&path)
                .output()
                .expect("Failed to configure git");
        }

        std::fs::write(path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");

        Command::new("git")
            .args(["add", "."])
            .current_dir(&path)
            .output()
            .expect("Failed to git add");
        Command::new("git")
            .args(["commit", "-m", "Initial commit"])
            .current_dir(&path)
            .output()
            .expect("Failed to git commit");

        Self { temp_dir, path }
    }
}
