//! Bounded execution of external commands.
//!
//! Every tmux call and audio player goes through here so a hung tool can
//! delay the monitor by at most its timeout.

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const POLL_STEP: Duration = Duration::from_millis(20);

/// Exit status and captured stdout of a finished command
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
}

/// Run `command` to completion, killing it if it outlives `timeout`.
///
/// Missing binaries and timeouts are errors; a non-zero exit is not.
pub fn output_with_timeout(command: &mut Command, timeout: Duration) -> Result<CommandOutput> {
    let program = command.get_program().to_string_lossy().into_owned();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to spawn {}", program))?;

    // Drain stdout on the side so a chatty child can't block on a full pipe.
    // Background processes may inherit the pipe, so the reader shares the deadline.
    let mut stdout = child.stdout.take();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(out) = stdout.as_mut() {
            let _ = out.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child
            .try_wait()
            .with_context(|| format!("Failed to wait for {}", program))?
        {
            Some(status) => break status,
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                bail!("{} timed out after {:?}", program, timeout);
            }
            None => thread::sleep(POLL_STEP),
        }
    };

    let remaining = deadline.saturating_duration_since(Instant::now());
    let stdout = match rx.recv_timeout(remaining) {
        Ok(buf) => buf,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            bail!("{} output still open after {:?}", program, timeout)
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Vec::new(),
    };
    Ok(CommandOutput {
        status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_captures_stdout_and_status() {
        let out = output_with_timeout(
            Command::new("sh").args(["-c", "echo hello; exit 3"]),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.status.code(), Some(3));
    }

    #[test]
    fn test_missing_binary_is_error() {
        let result = output_with_timeout(
            &mut Command::new("definitely-not-a-real-binary-4821"),
            Duration::from_secs(1),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_hung_command_is_killed_at_timeout() {
        let started = Instant::now();
        let result = output_with_timeout(
            Command::new("sleep").arg("10"),
            Duration::from_millis(200),
        );
        let err = result.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_background_grandchild_does_not_extend_timeout() {
        let started = Instant::now();
        let result = output_with_timeout(
            Command::new("sh").args(["-c", "sleep 6 & exit 0"]),
            Duration::from_millis(200),
        );
        assert!(result.is_err());
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "blocked {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn test_large_output_does_not_deadlock() {
        let out = output_with_timeout(
            Command::new("sh").args(["-c", "head -c 200000 /dev/zero | tr '\\0' 'x'"]),
            Duration::from_secs(10),
        )
        .unwrap();
        assert!(out.status.success());
        assert_eq!(out.stdout.len(), 200_000);
    }
}
