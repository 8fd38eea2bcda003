//! External program tasks.
//!
//! The process body runs on a scheduler thread: it spawns the child, streams
//! stdout line by line and watches the cancellation token while doing so.

use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::RecvTimeoutError;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::TaskContext;
use crate::error::{Error, Result, TaskError};
use crate::{rlog_debug, rlog_trace, rlog_warn};

const CANCEL_POLL: Duration = Duration::from_millis(25);

pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Where programs are found and what they run with.
#[derive(Debug, Clone, Default)]
pub struct ProcessEnvironment {
    git_path: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl ProcessEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            git_path: config.git_path(),
            ..Self::default()
        }
    }

    pub fn with_git_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.git_path = Some(path.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Resolve `program` to an executable path.
    ///
    /// `git` prefers the configured path. Names containing a path separator
    /// are taken as paths; everything else goes through `PATH`.
    pub fn resolve(&self, program: &str) -> Result<PathBuf> {
        if program == "git" {
            if let Some(path) = &self.git_path {
                if path.is_file() {
                    return Ok(path.clone());
                }
                rlog_warn!(
                    "Configured git path {} does not exist, falling back to PATH",
                    path.display()
                );
            }
        }
        if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
            let path = PathBuf::from(program);
            return if path.is_file() {
                Ok(path)
            } else {
                Err(Error::ExecutableNotFound(program.to_string()))
            };
        }
        which::which(program).map_err(|_| Error::ExecutableNotFound(program.to_string()))
    }
}

/// A program invocation.
#[derive(Clone)]
pub struct ProcessSpec {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    on_output: Option<OutputCallback>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            on_output: None,
        }
    }

    /// `git` with the given arguments.
    pub fn git<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new("git").args(args)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Called with every stdout line as it arrives, on the task's thread.
    pub fn on_output<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_output = Some(Arc::new(f));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub(crate) fn display_name(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

impl fmt::Debug for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("cwd", &self.cwd)
            .field("env", &self.env)
            .field("on_output", &self.on_output.is_some())
            .finish()
    }
}

/// What a finished program left behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    pub program: String,
    pub args: Vec<String>,
    pub code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }
}

/// Body of a process task.
pub(crate) fn run(
    env: &ProcessEnvironment,
    spec: ProcessSpec,
    cx: &TaskContext,
) -> std::result::Result<ProcessOutput, TaskError> {
    cx.check_cancelled()?;
    let executable = env.resolve(&spec.program)?;
    let started_at = Utc::now();
    let started = Instant::now();

    let mut command = Command::new(&executable);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = spec.cwd.as_deref().or(env.working_dir()) {
        command.current_dir(dir);
    }
    for (key, value) in env.env.iter().chain(spec.env.iter()) {
        command.env(key, value);
    }

    rlog_debug!(
        "process: spawning {} {:?} (task {})",
        executable.display(),
        spec.args,
        cx.id().short()
    );
    let mut child = command.spawn()?;

    let stderr_reader = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut text = String::new();
            let _ = pipe.read_to_string(&mut text);
            text
        })
    });

    let (tx, rx) = crossbeam_channel::unbounded::<String>();
    if let Some(pipe) = child.stdout.take() {
        thread::spawn(move || {
            for line in BufReader::new(pipe).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    } else {
        drop(tx);
    }

    let mut stdout = Vec::new();
    loop {
        match rx.recv_timeout(CANCEL_POLL) {
            Ok(line) => {
                rlog_trace!("process {}: {}", spec.program, line);
                if let Some(callback) = &spec.on_output {
                    callback(&line);
                }
                stdout.push(line);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if cx.is_cancelled() {
            rlog_debug!("process: cancelling {} (task {})", spec.program, cx.id().short());
            let _ = child.kill();
            let _ = child.wait();
            return Err(TaskError::Cancelled);
        }
    }

    let status = child.wait()?;
    let stderr = stderr_reader
        .and_then(|reader| reader.join().ok())
        .unwrap_or_default();
    let output = ProcessOutput {
        program: spec.program.clone(),
        args: spec.args.clone(),
        code: status.code(),
        stdout,
        stderr,
        started_at,
        duration_ms: started.elapsed().as_millis() as u64,
    };
    rlog_debug!(
        "process: {} exited with {:?} after {}ms",
        spec.program,
        output.code,
        output.duration_ms
    );

    if output.success() {
        Ok(output)
    } else {
        Err(TaskError::ProcessFailed {
            program: output.program,
            code: output.code,
            stderr: output.stderr.trim_end().to_string(),
        })
    }
}
