//! Background daemon lifecycle tracked through a PID marker file.
//!
//! The marker file is the only record of a running daemon. Nothing checks
//! that the stored PID is alive, so a marker left behind by a crash blocks
//! `start` until it is removed by hand or by `stop`.

use crate::common::tmux::SessionProbe;
use crate::daemon::monitor::{MonitorLoop, ShutdownFlag};
use crate::daemon::notifier::Notifier;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{self, Command, Stdio};
use tracing::{info, warn};

/// PID marker file
#[derive(Debug, Clone)]
pub struct PidMarker {
    path: PathBuf,
}

impl PidMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a daemon owns this state directory.
    ///
    /// Only checks that the marker exists; the PID is not verified.
    pub fn is_daemon_running(&self) -> bool {
        self.path.exists()
    }

    pub fn read(&self) -> Result<u32> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        content
            .trim()
            .parse()
            .with_context(|| format!("Invalid PID in {}: {:?}", self.path.display(), content.trim()))
    }

    pub fn write(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&self.path, pid.to_string())
            .with_context(|| format!("Failed to write PID file {}", self.path.display()))
    }

    /// When the marker was last written
    pub fn written_at(&self) -> Option<DateTime<Local>> {
        fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Local>::from)
    }

    /// Remove the marker unless it names a PID other than `owner`.
    ///
    /// Returns false when another daemon has taken the marker over.
    pub fn release(&self, owner: u32) -> Result<bool> {
        if let Ok(pid) = self.read() {
            if pid != owner {
                return Ok(false);
            }
        }
        self.remove()?;
        Ok(true)
    }

    /// Remove the marker; a missing marker is not an error
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}

/// A detached daemon as seen by the process that launched it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonHandle {
    pub pid: u32,
    pub marker_path: PathBuf,
}

/// Platform operations the supervisor needs
pub trait ProcessControl {
    /// Start the daemon entrypoint in the background and return its PID
    fn detach(&self) -> Result<u32>;

    /// Ask `pid` to shut down
    fn terminate(&self, pid: u32) -> Result<()>;

    /// Route termination signals for this process into `flag`
    fn install_shutdown_handler(&self, flag: ShutdownFlag) -> Result<()>;
}

/// Re-executes the current binary in a new session with the hidden `run` command
#[derive(Debug, Clone)]
pub struct DetachedProcess {
    exe: PathBuf,
    args: Vec<OsString>,
}

impl DetachedProcess {
    pub fn current(state_dir: &Path) -> Result<Self> {
        let exe = std::env::current_exe().context("Cannot determine current executable")?;
        Ok(Self {
            exe,
            args: vec![
                "--state-dir".into(),
                state_dir.as_os_str().to_owned(),
                "run".into(),
            ],
        })
    }
}

impl ProcessControl for DetachedProcess {
    fn detach(&self) -> Result<u32> {
        let mut command = Command::new(&self.exe);
        // stdout stays attached so the terminal bell reaches the launching terminal
        command.args(&self.args).stdin(Stdio::null()).stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // SAFETY: setsid is async-signal-safe and touches no parent state
            unsafe {
                command.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = command.spawn().context("Failed to spawn monitor daemon")?;
        Ok(child.id())
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> Result<()> {
        let raw = libc::pid_t::try_from(pid).with_context(|| format!("PID {} out of range", pid))?;
        // SAFETY: kill has no memory-safety preconditions
        if unsafe { libc::kill(raw, libc::SIGTERM) } != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("Failed to signal PID {}", pid));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&self, pid: u32) -> Result<()> {
        bail!("Stopping PID {} is only supported on Unix", pid)
    }

    fn install_shutdown_handler(&self, flag: ShutdownFlag) -> Result<()> {
        ctrlc::set_handler(move || {
            info!("Received stop signal");
            flag.request();
        })
        .context("Failed to install signal handler")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(DaemonHandle),
    /// Marker already present; `pid` is whatever it contains
    AlreadyRunning { pid: Option<u32> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped { pid: u32 },
    /// Marker was removed but the signal could not be delivered
    SignalFailed { pid: Option<u32>, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub since: Option<DateTime<Local>>,
}

pub struct DaemonSupervisor<C> {
    marker: PidMarker,
    control: C,
}

impl<C: ProcessControl> DaemonSupervisor<C> {
    pub fn new(marker: PidMarker, control: C) -> Self {
        Self { marker, control }
    }

    /// Launch the daemon unless the marker says one is already running
    pub fn start(&self) -> Result<StartOutcome> {
        if self.marker.is_daemon_running() {
            return Ok(StartOutcome::AlreadyRunning {
                pid: self.marker.read().ok(),
            });
        }

        let pid = self.control.detach()?;
        if let Err(e) = self.marker.write(pid) {
            if let Err(kill_err) = self.control.terminate(pid) {
                warn!(pid, error = %kill_err, "Failed to stop daemon after PID file write failed");
            }
            return Err(e);
        }
        info!(pid, "Started monitor daemon");
        Ok(StartOutcome::Started(DaemonHandle {
            pid,
            marker_path: self.marker.path().to_path_buf(),
        }))
    }

    /// Body of the daemon process: claim the marker, run the loop until a
    /// stop signal, then remove the marker whatever happened unless a newer
    /// daemon has already replaced it.
    pub fn run_foreground<P, N>(&self, monitor: &mut MonitorLoop<P, N>) -> Result<()>
    where
        P: SessionProbe,
        N: Notifier,
    {
        let pid = process::id();
        match self.marker.read() {
            Ok(owner) if owner != pid => {
                bail!(
                    "Another monitor owns {} (PID {})",
                    self.marker.path().display(),
                    owner
                );
            }
            Ok(_) => {}
            Err(_) => self.marker.write(pid)?,
        }

        let _cleanup = scopeguard::guard(&self.marker, move |marker| match marker.release(pid) {
            Ok(true) => info!("Removed PID file"),
            Ok(false) => info!("PID file now belongs to another monitor, leaving it"),
            Err(e) => warn!(error = %e, "Failed to remove PID file"),
        });

        self.control
            .install_shutdown_handler(monitor.shutdown_flag())?;
        monitor.run();
        info!(phase = ?monitor.phase(), "Monitor exited");
        Ok(())
    }

    /// Signal the daemon named by the marker and remove the marker
    pub fn stop(&self) -> StopOutcome {
        if !self.marker.is_daemon_running() {
            return StopOutcome::NotRunning;
        }

        let outcome = match self.marker.read() {
            Ok(pid) => match self.control.terminate(pid) {
                Ok(()) => StopOutcome::Stopped { pid },
                Err(e) => StopOutcome::SignalFailed {
                    pid: Some(pid),
                    reason: format!("{:#}", e),
                },
            },
            Err(e) => StopOutcome::SignalFailed {
                pid: None,
                reason: format!("{:#}", e),
            },
        };

        if let Err(e) = self.marker.remove() {
            warn!(error = %e, "Failed to remove PID file");
        }
        outcome
    }

    /// Marker-only view; never inspects the process table
    pub fn status(&self) -> DaemonStatus {
        if !self.marker.is_daemon_running() {
            return DaemonStatus {
                running: false,
                pid: None,
                since: None,
            };
        }
        DaemonStatus {
            running: true,
            pid: self.marker.read().ok(),
            since: self.marker.written_at(),
        }
    }
}
