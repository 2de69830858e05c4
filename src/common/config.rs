//! Monitor configuration and its JSON persistence.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_SESSION: &str = "claude";
const DEFAULT_CHECK_INTERVAL_SECS: f64 = 1.0;

/// External audio player; the audio file is appended as the last argument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl PlayerCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Players tried in order when an audio file is configured
pub fn default_players() -> Vec<PlayerCommand> {
    let mut players = Vec::new();
    #[cfg(target_os = "macos")]
    players.push(PlayerCommand::new("afplay", &[]));
    players.extend([
        PlayerCommand::new("mpv", &["--no-video", "--really-quiet"]),
        PlayerCommand::new("vlc", &["--intf", "dummy", "--play-and-exit"]),
        PlayerCommand::new("ffplay", &["-nodisp", "-autoexit", "-loglevel", "quiet"]),
        PlayerCommand::new("mplayer", &["-really-quiet"]),
    ]);
    players
}

fn default_patterns() -> Vec<String> {
    vec![
        "│ >".to_string(),
        "No, and tell Claude what to do differently".to_string(),
    ]
}

/// Persisted monitor settings. Keys missing from the file keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// tmux session to watch
    pub tmux_session: String,
    /// Audio file played on notification; `None` falls back to a beep
    #[serde(deserialize_with = "empty_path_as_none")]
    pub mp3_file: Option<PathBuf>,
    /// Poll interval in seconds
    pub check_interval: f64,
    /// Literal markers, checked in order
    pub patterns: Vec<String>,
    pub players: Vec<PlayerCommand>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tmux_session: DEFAULT_SESSION.to_string(),
            mp3_file: None,
            check_interval: DEFAULT_CHECK_INTERVAL_SECS,
            patterns: default_patterns(),
            players: default_players(),
        }
    }
}

impl Config {
    /// Poll interval as a duration. Always positive.
    pub fn poll_interval(&self) -> Duration {
        if self.check_interval.is_finite() && self.check_interval > 0.0 {
            Duration::from_secs_f64(self.check_interval)
        } else {
            Duration::from_secs_f64(DEFAULT_CHECK_INTERVAL_SECS)
        }
    }

    /// Replace values that would break the loop and warn about inert ones
    fn sanitize(&mut self) {
        if !(self.check_interval.is_finite() && self.check_interval > 0.0) {
            warn!(
                check_interval = self.check_interval,
                "check_interval must be positive, using default"
            );
            self.check_interval = DEFAULT_CHECK_INTERVAL_SECS;
        }
        if self.patterns.is_empty() {
            warn!("No patterns configured; the monitor will never notify");
        }
        if self.patterns.iter().any(|p| p.is_empty()) {
            warn!("Empty patterns are ignored");
        }
    }
}

// Older config files store an unset audio file as "".
fn empty_path_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.trim().is_empty()).map(PathBuf::from))
}

/// Reads and writes `config.json`
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load defaults overlaid with the persisted file. Never fails.
    pub fn load(&self) -> Config {
        let mut config = match fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<Config>(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Failed to parse config, using defaults");
                    Config::default()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No config file, using defaults");
                Config::default()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read config, using defaults");
                Config::default()
            }
        };
        config.sanitize();
        config
    }

    /// Write the config via a temp file and rename so readers never see a partial file
    pub fn save(&self, config: &Config) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut content =
            serde_json::to_string_pretty(config).context("Failed to serialize config")?;
        content.push('\n');

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))
    }

    /// Validate and persist the notification audio file.
    /// `config` is left untouched on error.
    pub fn set_mp3(&self, config: &mut Config, file: &Path) -> Result<()> {
        if !file.is_file() {
            bail!("File not found: {}", file.display());
        }
        let file = fs::canonicalize(file)
            .with_context(|| format!("Failed to resolve {}", file.display()))?;

        let mut updated = config.clone();
        updated.mp3_file = Some(file);
        self.save(&updated)?;
        *config = updated;
        Ok(())
    }

    /// Persist the tmux session to watch
    pub fn set_session(&self, config: &mut Config, session: &str) -> Result<()> {
        if session.trim().is_empty() {
            bail!("Session name must not be empty");
        }
        let mut updated = config.clone();
        updated.tmux_session = session.to_string();
        self.save(&updated)?;
        *config = updated;
        Ok(())
    }
}
