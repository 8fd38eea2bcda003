use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::{rlog_debug, Error, Result};

const DEFAULT_UI_TICK_MS: u64 = 16; // ~60 ticks per second
const DEFAULT_SEND_TIMEOUT_MS: u64 = 30_000;

/// User configuration, read from `~/.ravel/ravel.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub debug: bool,
    pub concurrent_threads: Option<usize>,
    pub ui_tick_ms: Option<u64>,
    pub send_timeout_ms: Option<u64>,
    pub git_path: Option<String>,
}

impl Config {
    pub fn ravel_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".ravel"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::ravel_dir()?.join("ravel.toml"))
    }

    pub fn effective_concurrent_threads(&self) -> usize {
        self.concurrent_threads
            .filter(|&n| n > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4)
            })
    }

    pub fn effective_ui_tick(&self) -> Duration {
        Duration::from_millis(self.ui_tick_ms.unwrap_or(DEFAULT_UI_TICK_MS).max(1))
    }

    pub fn effective_send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.unwrap_or(DEFAULT_SEND_TIMEOUT_MS))
    }

    pub fn git_path(&self) -> Option<PathBuf> {
        self.git_path.as_deref().map(expand_tilde)
    }

    pub fn runtime(&self) -> RuntimeConfig {
        RuntimeConfig {
            concurrent_threads: self.effective_concurrent_threads(),
            ui_tick: self.effective_ui_tick(),
            send_timeout: self.effective_send_timeout(),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        rlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            rlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        rlog_debug!(
            "Config loaded: concurrent_threads={:?}, ui_tick_ms={:?}, git_path={:?}",
            config.concurrent_threads,
            config.ui_tick_ms,
            config.git_path
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::ravel_dir()?;
        if !dir.exists() {
            rlog_debug!("Creating ravel directory");
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        rlog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}

/// Resolved settings the [`TaskManager`](crate::TaskManager) is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Upper bound on threads running concurrent-affinity bodies.
    pub concurrent_threads: usize,
    /// Minimum interval between two UI pump ticks.
    pub ui_tick: Duration,
    /// How long a blocking `send` into the UI pump waits before giving up.
    pub send_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Config::default().runtime()
    }
}

impl RuntimeConfig {
    pub fn with_ui_tick(mut self, tick: Duration) -> Self {
        self.ui_tick = tick;
        self
    }

    pub fn with_concurrent_threads(mut self, threads: usize) -> Self {
        self.concurrent_threads = threads.max(1);
        self
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
