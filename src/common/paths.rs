//! Filesystem locations for monitor state.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the state directory
pub const STATE_DIR_ENV: &str = "CLAUDE_MONITOR_DIR";

/// Directory holding the config file, PID marker and log file.
///
/// One directory supports exactly one monitored session; a second monitor
/// needs its own directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default per-user state directory
    pub fn default_root() -> PathBuf {
        dirs::config_dir()
            .map(|c| c.join("claude-tmux-monitor"))
            .or_else(|| dirs::home_dir().map(|h| h.join(".claude-monitor")))
            .unwrap_or_else(|| PathBuf::from("/tmp").join("claude-tmux-monitor"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("monitor.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("monitor.log")
    }

    /// Create the state directory if needed
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create state directory {}", self.root.display()))
    }
}
