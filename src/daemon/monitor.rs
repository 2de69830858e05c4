//! Poll-detect-notify loop.
//!
//! Each tick checks that the tmux session exists, captures the tail of its
//! pane, looks for a marker and, outside the cooldown window, plays a
//! notification. Shutdown is cooperative: a stop request is observed between
//! ticks and during sleeps, so the worst-case latency is one external command
//! timeout.

use crate::common::config::Config;
use crate::common::tmux::SessionProbe;
use crate::daemon::matcher::find_match;
use crate::daemon::notifier::Notifier;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lines of pane history inspected per tick
pub const CAPTURE_LINES: usize = 100;
/// Minimum time between two notifications
pub const NOTIFICATION_COOLDOWN: Duration = Duration::from_secs(3);
/// Wait before re-checking a missing session
pub const SESSION_RETRY_INTERVAL: Duration = Duration::from_secs(5);

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Shared stop request, set from the signal handler thread
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Idle,
    Running,
    Stopping,
    Stopped,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    SessionMissing,
    NoMatch,
    /// Marker seen but still inside the cooldown window
    Suppressed(String),
    Notified(String),
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub session: String,
    pub audio_file: Option<PathBuf>,
    pub markers: Vec<String>,
    pub poll_interval: Duration,
    pub cooldown: Duration,
    pub retry_interval: Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            session: config.tmux_session.clone(),
            audio_file: config.mp3_file.clone(),
            markers: config.patterns.clone(),
            poll_interval: config.poll_interval(),
            cooldown: NOTIFICATION_COOLDOWN,
            retry_interval: SESSION_RETRY_INTERVAL,
        }
    }
}

pub struct MonitorLoop<P, N> {
    settings: MonitorSettings,
    probe: P,
    notifier: N,
    shutdown: ShutdownFlag,
    phase: LoopPhase,
    last_notification: Option<Instant>,
}

impl<P: SessionProbe, N: Notifier> MonitorLoop<P, N> {
    pub fn new(settings: MonitorSettings, probe: P, notifier: N) -> Self {
        Self {
            settings,
            probe,
            notifier,
            shutdown: ShutdownFlag::default(),
            phase: LoopPhase::Idle,
            last_notification: None,
        }
    }

    /// Handle for requesting shutdown from another thread
    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    #[cfg(test)]
    pub fn probe(&self) -> &P {
        &self.probe
    }

    #[cfg(test)]
    fn last_notification(&self) -> Option<Instant> {
        self.last_notification
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        match self.last_notification {
            Some(last) => now.saturating_duration_since(last) > self.settings.cooldown,
            None => true,
        }
    }

    /// One check-capture-match-notify pass at time `now`
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        if !self.probe.exists(&self.settings.session) {
            warn!(session = %self.settings.session, "tmux session not found");
            return TickOutcome::SessionMissing;
        }

        let output = self.probe.capture(&self.settings.session, CAPTURE_LINES);
        let Some(marker) = find_match(&output, &self.settings.markers).map(str::to_string) else {
            return TickOutcome::NoMatch;
        };

        if !self.cooldown_elapsed(now) {
            debug!(marker = %marker, "Pattern detected during cooldown");
            return TickOutcome::Suppressed(marker);
        }

        info!(marker = %marker, "Pattern detected");
        self.notifier.notify(self.settings.audio_file.as_deref());
        self.last_notification = Some(now);
        TickOutcome::Notified(marker)
    }

    /// Run until shutdown is requested. A loop runs at most once.
    pub fn run(&mut self) {
        if self.phase != LoopPhase::Idle {
            warn!(phase = ?self.phase, "Monitor loop cannot be restarted");
            return;
        }
        self.phase = LoopPhase::Running;

        info!(session = %self.settings.session, "Starting monitor");
        info!(patterns = ?self.settings.markers, "Monitoring patterns");
        match &self.settings.audio_file {
            Some(file) => info!(file = %file.display(), "Audio file"),
            None => info!("Audio file not set (using beep)"),
        }

        while !self.shutdown.is_requested() {
            let pause = match panic::catch_unwind(AssertUnwindSafe(|| self.tick(Instant::now()))) {
                Ok(TickOutcome::SessionMissing) => self.settings.retry_interval,
                Ok(_) => self.settings.poll_interval,
                Err(payload) => {
                    error!(reason = %panic_message(payload.as_ref()), "Monitor tick panicked, continuing");
                    self.settings.poll_interval
                }
            };
            self.pause(pause);
        }

        self.phase = LoopPhase::Stopping;
        info!("Monitor stopping");
        self.phase = LoopPhase::Stopped;
    }

    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.shutdown.is_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::path::Path;
    use std::rc::Rc;

    /// Scripted session: per-tick liveness and captured output
    #[derive(Default)]
    struct FakeProbe {
        alive: Rc<Cell<bool>>,
        outputs: RefCell<VecDeque<String>>,
        captures: Rc<Cell<usize>>,
    }

    impl FakeProbe {
        fn alive_with(outputs: &[&str]) -> Self {
            let probe = Self::default();
            probe.alive.set(true);
            *probe.outputs.borrow_mut() = outputs.iter().map(|s| s.to_string()).collect();
            probe
        }
    }

    impl SessionProbe for FakeProbe {
        fn exists(&self, _session: &str) -> bool {
            self.alive.get()
        }

        fn capture(&self, _session: &str, max_lines: usize) -> String {
            assert_eq!(max_lines, CAPTURE_LINES);
            self.captures.set(self.captures.get() + 1);
            let mut outputs = self.outputs.borrow_mut();
            if outputs.len() > 1 {
                outputs.pop_front().unwrap_or_default()
            } else {
                outputs.front().cloned().unwrap_or_default()
            }
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        calls: Rc<Cell<usize>>,
        last_file: Rc<RefCell<Option<PathBuf>>>,
    }

    impl Notifier for CountingNotifier {
        fn notify(&self, audio_file: Option<&Path>) {
            self.calls.set(self.calls.get() + 1);
            *self.last_file.borrow_mut() = audio_file.map(Path::to_path_buf);
        }
    }

    fn settings(markers: &[&str]) -> MonitorSettings {
        MonitorSettings {
            session: "claude".to_string(),
            audio_file: None,
            markers: markers.iter().map(|s| s.to_string()).collect(),
            poll_interval: Duration::from_millis(1),
            cooldown: NOTIFICATION_COOLDOWN,
            retry_interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config {
            check_interval: 0.25,
            mp3_file: Some(PathBuf::from("/s/ding.mp3")),
            ..Config::default()
        };
        let s = MonitorSettings::from_config(&config);
        assert_eq!(s.session, "claude");
        assert_eq!(s.poll_interval, Duration::from_millis(250));
        assert_eq!(s.cooldown, Duration::from_secs(3));
        assert_eq!(s.retry_interval, Duration::from_secs(5));
        assert_eq!(s.audio_file, Some(PathBuf::from("/s/ding.mp3")));
    }

    #[test]
    fn test_empty_markers_never_notify() {
        let notifier = CountingNotifier::default();
        let calls = notifier.calls.clone();
        let probe = FakeProbe::alive_with(&["│ > ready", "No, and tell Claude"]);
        let mut monitor = MonitorLoop::new(settings(&[]), probe, notifier);

        let start = Instant::now();
        for i in 0..10 {
            let outcome = monitor.tick(start + Duration::from_secs(10 * i));
            assert_eq!(outcome, TickOutcome::NoMatch);
        }
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_missing_session_skips_capture_and_notify() {
        let probe = FakeProbe::alive_with(&["ready"]);
        probe.alive.set(false);
        let captures = probe.captures.clone();
        let alive = probe.alive.clone();
        let notifier = CountingNotifier::default();
        let calls = notifier.calls.clone();
        let mut monitor = MonitorLoop::new(settings(&["ready"]), probe, notifier);

        let start = Instant::now();
        assert_eq!(monitor.tick(start), TickOutcome::SessionMissing);
        assert_eq!(captures.get(), 0);
        assert_eq!(calls.get(), 0);

        // Session appears later and the loop picks it up
        alive.set(true);
        assert_eq!(
            monitor.tick(start + Duration::from_secs(5)),
            TickOutcome::Notified("ready".to_string())
        );
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_cooldown_suppresses_then_allows() {
        let notifier = CountingNotifier::default();
        let calls = notifier.calls.clone();
        let probe = FakeProbe::alive_with(&["A"]);
        let mut monitor = MonitorLoop::new(settings(&["A"]), probe, notifier);

        let t0 = Instant::now();
        assert!(matches!(monitor.tick(t0), TickOutcome::Notified(_)));
        assert!(matches!(
            monitor.tick(t0 + Duration::from_secs(2)),
            TickOutcome::Suppressed(_)
        ));
        assert_eq!(calls.get(), 1);

        assert!(matches!(
            monitor.tick(t0 + Duration::from_millis(3500)),
            TickOutcome::Notified(_)
        ));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_cooldown_boundary_is_exclusive() {
        let notifier = CountingNotifier::default();
        let probe = FakeProbe::alive_with(&["A"]);
        let mut monitor = MonitorLoop::new(settings(&["A"]), probe, notifier);

        let t0 = Instant::now();
        monitor.tick(t0);
        assert!(matches!(
            monitor.tick(t0 + NOTIFICATION_COOLDOWN),
            TickOutcome::Suppressed(_)
        ));
    }

    #[test]
    fn test_ready_prompt_scenario() {
        let notifier = CountingNotifier::default();
        let calls = notifier.calls.clone();
        let probe = FakeProbe::alive_with(&["...ready..."]);
        let mut monitor = MonitorLoop::new(settings(&["ready"]), probe, notifier);

        let t1 = Instant::now();
        assert_eq!(monitor.tick(t1), TickOutcome::Notified("ready".to_string()));
        assert_eq!(monitor.last_notification(), Some(t1));

        let t2 = t1 + Duration::from_secs(1);
        assert_eq!(monitor.tick(t2), TickOutcome::Suppressed("ready".to_string()));
        assert_eq!(monitor.last_notification(), Some(t1));

        let t3 = t1 + Duration::from_secs(4);
        assert_eq!(monitor.tick(t3), TickOutcome::Notified("ready".to_string()));
        assert_eq!(monitor.last_notification(), Some(t3));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_first_marker_reported_and_audio_file_passed() {
        let notifier = CountingNotifier::default();
        let last_file = notifier.last_file.clone();
        let probe = FakeProbe::alive_with(&["B then A"]);
        let mut s = settings(&["A", "B"]);
        s.audio_file = Some(PathBuf::from("/s/ding.mp3"));
        let mut monitor = MonitorLoop::new(s, probe, notifier);

        assert_eq!(
            monitor.tick(Instant::now()),
            TickOutcome::Notified("A".to_string())
        );
        assert_eq!(*last_file.borrow(), Some(PathBuf::from("/s/ding.mp3")));
    }

    /// Requests shutdown once it has been asked `limit` times whether the session exists
    struct StopAfter {
        inner: FakeProbe,
        seen: Cell<usize>,
        limit: usize,
        flag: RefCell<Option<ShutdownFlag>>,
        panic_on_first: bool,
    }

    impl SessionProbe for StopAfter {
        fn exists(&self, session: &str) -> bool {
            let seen = self.seen.get() + 1;
            self.seen.set(seen);
            if seen >= self.limit {
                if let Some(flag) = self.flag.borrow().as_ref() {
                    flag.request();
                }
            }
            if self.panic_on_first && seen == 1 {
                panic!("capture exploded");
            }
            self.inner.exists(session)
        }

        fn capture(&self, session: &str, max_lines: usize) -> String {
            self.inner.capture(session, max_lines)
        }
    }

    #[test]
    fn test_run_stops_on_request() {
        let notifier = CountingNotifier::default();
        let calls = notifier.calls.clone();
        let probe = StopAfter {
            inner: FakeProbe::alive_with(&["ready"]),
            seen: Cell::new(0),
            limit: 3,
            flag: RefCell::new(None),
            panic_on_first: false,
        };
        let mut monitor = MonitorLoop::new(settings(&["ready"]), probe, notifier);
        *monitor.probe.flag.borrow_mut() = Some(monitor.shutdown_flag());

        assert_eq!(monitor.phase(), LoopPhase::Idle);
        monitor.run();

        assert_eq!(monitor.phase(), LoopPhase::Stopped);
        assert_eq!(monitor.probe.seen.get(), 3);
        // Ticks run back to back, well inside the cooldown
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_run_survives_missing_session_and_panics() {
        let notifier = CountingNotifier::default();
        let inner = FakeProbe::alive_with(&["ready"]);
        inner.alive.set(false);
        let probe = StopAfter {
            inner,
            seen: Cell::new(0),
            limit: 4,
            flag: RefCell::new(None),
            panic_on_first: true,
        };
        let mut monitor = MonitorLoop::new(settings(&["ready"]), probe, notifier);
        *monitor.probe.flag.borrow_mut() = Some(monitor.shutdown_flag());

        monitor.run();

        assert_eq!(monitor.phase(), LoopPhase::Stopped);
        assert_eq!(monitor.probe.seen.get(), 4);
        assert_eq!(monitor.probe.inner.captures.get(), 0);
    }

    #[test]
    fn test_panic_message_from_payload() {
        let literal = panic::catch_unwind(|| panic!("capture exploded")).unwrap_err();
        assert_eq!(panic_message(literal.as_ref()), "capture exploded");

        let formatted = panic::catch_unwind(|| panic!("tick {}", 7)).unwrap_err();
        assert_eq!(panic_message(formatted.as_ref()), "tick 7");

        let other = panic::catch_unwind(|| panic::panic_any(42u8)).unwrap_err();
        assert_eq!(panic_message(other.as_ref()), "unknown panic payload");
    }

    #[test]
    fn test_stop_before_run_exits_immediately() {
        let probe = FakeProbe::alive_with(&["ready"]);
        let captures = probe.captures.clone();
        let mut monitor = MonitorLoop::new(settings(&["ready"]), probe, CountingNotifier::default());
        monitor.shutdown_flag().request();

        monitor.run();

        assert_eq!(monitor.phase(), LoopPhase::Stopped);
        assert_eq!(captures.get(), 0);
    }

    #[test]
    fn test_stopped_loop_does_not_restart() {
        let probe = FakeProbe::alive_with(&["ready"]);
        let captures = probe.captures.clone();
        let mut monitor = MonitorLoop::new(settings(&["ready"]), probe, CountingNotifier::default());
        monitor.shutdown_flag().request();
        monitor.run();

        monitor.run();
        assert_eq!(monitor.phase(), LoopPhase::Stopped);
        assert_eq!(captures.get(), 0);
    }

    #[test]
    fn test_pause_returns_early_on_shutdown() {
        let mut s = settings(&[]);
        s.poll_interval = Duration::from_secs(30);
        let monitor = MonitorLoop::new(s, FakeProbe::default(), CountingNotifier::default());
        let flag = monitor.shutdown_flag();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            flag.request();
        });

        let started = Instant::now();
        monitor.pause(Duration::from_secs(30));
        stopper.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
