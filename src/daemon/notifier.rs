//! Audible notifications with an ordered fallback chain.

use crate::common::config::{Config, PlayerCommand};
use crate::common::process::output_with_timeout;
use anyhow::{bail, Result};
use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

const PLAYER_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that can make the user look up
pub trait Notifier {
    /// Best effort; failures are logged, never returned
    fn notify(&self, audio_file: Option<&Path>);
}

/// One way of making a sound
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackStrategy {
    /// External player with the audio file as last argument
    Player(PlayerCommand),
    /// Windows SoundPlayer through powershell.exe (WSL)
    PowerShellSound,
    /// `[console]::beep` through powershell.exe
    PowerShellBeep,
    /// BEL on stdout
    TerminalBell,
}

impl PlaybackStrategy {
    pub fn name(&self) -> &str {
        match self {
            PlaybackStrategy::Player(player) => &player.program,
            PlaybackStrategy::PowerShellSound => "powershell-soundplayer",
            PlaybackStrategy::PowerShellBeep => "powershell-beep",
            PlaybackStrategy::TerminalBell => "terminal-bell",
        }
    }

    fn needs_file(&self) -> bool {
        matches!(
            self,
            PlaybackStrategy::Player(_) | PlaybackStrategy::PowerShellSound
        )
    }

    /// External command for this strategy, `None` when it writes to the terminal
    fn command(&self, file: Option<&Path>) -> Option<Command> {
        match self {
            PlaybackStrategy::Player(player) => {
                let mut cmd = Command::new(&player.program);
                cmd.args(&player.args);
                if let Some(file) = file {
                    cmd.arg(file);
                }
                Some(cmd)
            }
            PlaybackStrategy::PowerShellSound => {
                let path = file
                    .map(|f| f.to_string_lossy().replace('\'', "''"))
                    .unwrap_or_default();
                let mut cmd = Command::new("powershell.exe");
                cmd.args([
                    "-c",
                    &format!("(New-Object Media.SoundPlayer '{}').PlaySync()", path),
                ]);
                Some(cmd)
            }
            PlaybackStrategy::PowerShellBeep => {
                let mut cmd = Command::new("powershell.exe");
                cmd.args(["-c", "[console]::beep(800,500)"]);
                Some(cmd)
            }
            PlaybackStrategy::TerminalBell => None,
        }
    }
}

/// Runs a single playback attempt
pub trait PlaybackBackend {
    fn attempt(&self, strategy: &PlaybackStrategy, file: Option<&Path>) -> Result<()>;
}

/// Spawns real processes and writes to the real terminal
#[derive(Debug, Clone)]
pub struct SystemBackend {
    timeout: Duration,
}

impl Default for SystemBackend {
    fn default() -> Self {
        Self {
            timeout: PLAYER_TIMEOUT,
        }
    }
}

impl PlaybackBackend for SystemBackend {
    fn attempt(&self, strategy: &PlaybackStrategy, file: Option<&Path>) -> Result<()> {
        match strategy.command(file) {
            Some(mut cmd) => {
                let output = output_with_timeout(&mut cmd, self.timeout)?;
                if !output.status.success() {
                    bail!("{} exited with {}", strategy.name(), output.status);
                }
                Ok(())
            }
            None => {
                let mut stdout = std::io::stdout();
                stdout.write_all(b"\x07")?;
                stdout.flush()?;
                Ok(())
            }
        }
    }
}

/// Tries each strategy in order until one succeeds
pub struct NotificationDispatcher<B = SystemBackend> {
    strategies: Vec<PlaybackStrategy>,
    backend: B,
}

/// Players from the config, then the platform fallbacks
pub fn strategies_for(players: &[PlayerCommand]) -> Vec<PlaybackStrategy> {
    players
        .iter()
        .cloned()
        .map(PlaybackStrategy::Player)
        .chain([
            PlaybackStrategy::PowerShellSound,
            PlaybackStrategy::PowerShellBeep,
            PlaybackStrategy::TerminalBell,
        ])
        .collect()
}

impl NotificationDispatcher<SystemBackend> {
    pub fn from_config(config: &Config) -> Self {
        Self::with_backend(strategies_for(&config.players), SystemBackend::default())
    }
}

impl<B: PlaybackBackend> NotificationDispatcher<B> {
    pub fn with_backend(strategies: Vec<PlaybackStrategy>, backend: B) -> Self {
        Self {
            strategies,
            backend,
        }
    }
}

impl<B: PlaybackBackend> Notifier for NotificationDispatcher<B> {
    fn notify(&self, audio_file: Option<&Path>) {
        let file = match audio_file {
            Some(path) if path.exists() => Some(path),
            Some(path) => {
                warn!(path = %path.display(), "Audio file not found, using fallback sound");
                None
            }
            None => None,
        };

        for strategy in &self.strategies {
            if strategy.needs_file() && file.is_none() {
                continue;
            }
            match self.backend.attempt(strategy, file) {
                Ok(()) => {
                    info!(via = strategy.name(), "Played notification");
                    return;
                }
                Err(e) => {
                    debug!(via = strategy.name(), error = %e, "Playback attempt failed");
                }
            }
        }
        warn!("Every notification method failed");
    }
}
