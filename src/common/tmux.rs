//! tmux command helpers.

use crate::common::process::output_with_timeout;
use std::process::Command;
use std::time::Duration;
use tracing::debug;

const TMUX_TIMEOUT: Duration = Duration::from_secs(2);

/// Read-only view of a terminal multiplexer session
pub trait SessionProbe {
    /// Whether the session exists. Failures to ask count as "no".
    fn exists(&self, session: &str) -> bool;

    /// Last `max_lines` lines of the session's active pane, or "" on failure
    fn capture(&self, session: &str, max_lines: usize) -> String;
}

/// `SessionProbe` backed by the tmux binary
#[derive(Debug, Clone)]
pub struct TmuxProbe {
    binary: String,
    timeout: Duration,
}

impl Default for TmuxProbe {
    fn default() -> Self {
        Self {
            binary: "tmux".to_string(),
            timeout: TMUX_TIMEOUT,
        }
    }
}

impl TmuxProbe {
    #[cfg(test)]
    fn with_binary(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
            ..Self::default()
        }
    }
}

fn has_session_args(session: &str) -> Vec<String> {
    vec!["has-session".into(), "-t".into(), session.to_string()]
}

fn capture_pane_args(session: &str, max_lines: usize) -> Vec<String> {
    vec![
        "capture-pane".into(),
        "-t".into(),
        session.to_string(),
        "-p".into(),
        "-S".into(),
        format!("-{}", max_lines),
    ]
}

impl SessionProbe for TmuxProbe {
    fn exists(&self, session: &str) -> bool {
        match output_with_timeout(
            Command::new(&self.binary).args(has_session_args(session)),
            self.timeout,
        ) {
            Ok(output) => output.status.success(),
            Err(e) => {
                debug!(session = %session, error = %e, "tmux has-session failed");
                false
            }
        }
    }

    fn capture(&self, session: &str, max_lines: usize) -> String {
        match output_with_timeout(
            Command::new(&self.binary).args(capture_pane_args(session, max_lines)),
            self.timeout,
        ) {
            Ok(output) if output.status.success() => output.stdout,
            Ok(output) => {
                debug!(session = %session, status = %output.status, "tmux capture-pane exited non-zero");
                String::new()
            }
            Err(e) => {
                debug!(session = %session, error = %e, "tmux capture-pane failed");
                String::new()
            }
        }
    }
}
