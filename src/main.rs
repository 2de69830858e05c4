mod common;
mod daemon;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use common::config::{Config, ConfigStore};
use common::logging;
use common::paths::{StatePaths, STATE_DIR_ENV};
use common::tmux::TmuxProbe;
use daemon::monitor::{MonitorLoop, MonitorSettings};
use daemon::notifier::{NotificationDispatcher, Notifier};
use daemon::supervisor::{
    DaemonSupervisor, DetachedProcess, PidMarker, StartOutcome, StopOutcome,
};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "claude-tmux-monitor")]
#[command(about = "Plays a sound when Claude Code in a tmux session is waiting for input")]
struct Args {
    /// Directory holding config.json, monitor.pid and monitor.log
    #[arg(long, global = true, env = STATE_DIR_ENV)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the monitor as a background daemon
    Start,
    /// Stop the background daemon
    Stop,
    /// Show whether the daemon is running and what it watches
    Status,
    /// Play the notification once
    Test,
    /// Set the audio file played on notifications
    SetMp3 {
        /// Path to an existing audio file
        #[arg(long)]
        mp3: PathBuf,
    },
    /// Set the tmux session to monitor
    SetSession {
        /// tmux session name
        #[arg(long)]
        session: String,
    },
    /// Run the monitor loop in the foreground (used by `start`)
    #[command(hide = true)]
    Run,
}

fn supervisor(paths: &StatePaths) -> Result<DaemonSupervisor<DetachedProcess>> {
    Ok(DaemonSupervisor::new(
        PidMarker::new(paths.pid_file()),
        DetachedProcess::current(paths.root())?,
    ))
}

fn describe_audio(file: Option<&Path>) -> String {
    file.map(|f| f.display().to_string())
        .unwrap_or_else(|| "Not set (using beep)".to_string())
}

fn cmd_start(paths: &StatePaths) -> Result<()> {
    paths.ensure_dir()?;
    match supervisor(paths)?.start()? {
        StartOutcome::Started(handle) => {
            println!("{} monitor daemon (PID: {})", "Started".green(), handle.pid);
            println!("PID file: {}", handle.marker_path.display());
            println!("Log file: {}", paths.log_file().display());
        }
        StartOutcome::AlreadyRunning { pid } => {
            let pid = pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string());
            println!(
                "Monitor already running (PID {}, PID file exists: {})",
                pid,
                paths.pid_file().display()
            );
        }
    }
    Ok(())
}

fn cmd_stop(paths: &StatePaths) -> Result<()> {
    match supervisor(paths)?.stop() {
        StopOutcome::NotRunning => println!("Monitor not running"),
        StopOutcome::Stopped { pid } => {
            println!("{} monitor (PID: {})", "Stopped".green(), pid)
        }
        StopOutcome::SignalFailed { pid, reason } => {
            let pid = pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string());
            println!("{} stopping monitor (PID: {}): {}", "Error".red(), pid, reason);
            println!("Removed stale PID file");
        }
    }
    Ok(())
}

fn cmd_status(paths: &StatePaths, store: &ConfigStore, config: &Config) -> Result<()> {
    let status = supervisor(paths)?.status();
    if status.running {
        let pid = status
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "?".to_string());
        match status.since {
            Some(since) => println!(
                "{} (PID: {}, since {})",
                "Monitor running".green().bold(),
                pid,
                since.format("%Y-%m-%d %H:%M:%S")
            ),
            None => println!("{} (PID: {})", "Monitor running".green().bold(), pid),
        }
    } else {
        println!("{}", "Monitor not running".yellow());
    }
    println!("Tmux session: {}", config.tmux_session.bold());
    println!("MP3 file: {}", describe_audio(config.mp3_file.as_deref()));
    println!("Check interval: {:?}", config.poll_interval());
    println!("Patterns: {:?}", config.patterns);
    println!("Config file: {}", store.path().display());
    println!("Log file: {}", paths.log_file().display());
    Ok(())
}

fn cmd_test(config: &Config) {
    println!("Testing notification...");
    NotificationDispatcher::from_config(config).notify(config.mp3_file.as_deref());
}

fn cmd_run(paths: &StatePaths, config: &Config) -> Result<()> {
    let mut monitor = MonitorLoop::new(
        MonitorSettings::from_config(config),
        TmuxProbe::default(),
        NotificationDispatcher::from_config(config),
    );
    supervisor(paths)?.run_foreground(&mut monitor)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let paths = StatePaths::new(args.state_dir.unwrap_or_else(StatePaths::default_root));

    // The daemon keeps the file writer alive until exit
    let _log_guard = match args.command {
        Commands::Run => Some(logging::init_daemon(&paths.log_file())?),
        _ => {
            logging::init_cli();
            None
        }
    };

    let store = ConfigStore::new(paths.config_file());
    let mut config = store.load();

    match args.command {
        Commands::Start => cmd_start(&paths),
        Commands::Stop => cmd_stop(&paths),
        Commands::Status => cmd_status(&paths, &store, &config),
        Commands::Test => {
            cmd_test(&config);
            Ok(())
        }
        Commands::SetMp3 { mp3 } => {
            store.set_mp3(&mut config, &mp3)?;
            println!("MP3 file set to: {}", describe_audio(config.mp3_file.as_deref()));
            Ok(())
        }
        Commands::SetSession { session } => {
            store.set_session(&mut config, &session)?;
            println!("Tmux session set to: {}", config.tmux_session);
            Ok(())
        }
        Commands::Run => cmd_run(&paths, &config),
    }
}
