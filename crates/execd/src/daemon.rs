//! The daemon supervisor state machine.
//!
//! `Stopped -> Starting -> Running`, back to `Starting` through the
//! restart backoff on unexpected exit, and `Stopping -> Stopped` once
//! `stop` is requested.

use crate::process::{CommandSpawner, Process, Spawner};
use nix::sys::signal::Signal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep, timeout};
use tracing::{error, info, warn};

/// Minimum interval between successive start attempts. A permanently
/// broken binary path must not spin the CPU or flood the log.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(1);

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("daemon is not running")]
    NotRunning,

    #[error("daemon was already started")]
    AlreadyStarted,

    #[error("signal delivery failed: {0}")]
    Signal(#[source] std::io::Error),
}

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Supervises one external daemon as a long-lived child process.
pub struct Daemon {
    spawner: Arc<dyn Spawner>,
    current: Arc<Mutex<Option<Arc<dyn Process>>>>,
    state: Arc<Mutex<DaemonState>>,
    grace_period: Mutex<Duration>,
    stop_tx: watch::Sender<bool>,
    started: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Daemon {
    /// Supervise `program` with the given arguments.
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::from_spawner(Arc::new(CommandSpawner::new(program, args)))
    }

    /// Supervise processes produced by an arbitrary spawner.
    pub fn from_spawner(spawner: Arc<dyn Spawner>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            spawner,
            current: Arc::new(Mutex::new(None)),
            state: Arc::new(Mutex::new(DaemonState::Stopped)),
            grace_period: Mutex::new(DEFAULT_GRACE_PERIOD),
            stop_tx,
            started: AtomicBool::new(false),
        }
    }

    /// How long `stop` waits between the graceful request and SIGKILL.
    pub fn set_grace_period(&self, grace: Duration) {
        *lock(&self.grace_period) = grace;
    }

    pub fn state(&self) -> DaemonState {
        *lock(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == DaemonState::Running && lock(&self.current).is_some()
    }

    /// Start the supervision task: spawn the process and keep it alive,
    /// restarting on unexpected exit no more often than `RESTART_BACKOFF`.
    pub fn run_forever(&self) -> Result<(), ExecError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ExecError::AlreadyStarted);
        }

        let spawner = self.spawner.clone();
        let current = self.current.clone();
        let state = self.state.clone();
        let grace = *lock(&self.grace_period);
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let mut last_attempt: Option<Instant> = None;

            loop {
                if *stop_rx.borrow() {
                    break;
                }

                if let Some(at) = last_attempt {
                    let since = at.elapsed();
                    if since < RESTART_BACKOFF {
                        tokio::select! {
                            _ = sleep(RESTART_BACKOFF - since) => {}
                            _ = stop_rx.changed() => {}
                        }
                        // a stop arriving during the backoff window must
                        // win over the pending attempt; re-check at the top
                        continue;
                    }
                }
                last_attempt = Some(Instant::now());
                *lock(&state) = DaemonState::Starting;

                match spawner.spawn().await {
                    Ok(process) => {
                        let process: Arc<dyn Process> = Arc::from(process);
                        info!(pid = process.id(), "daemon started");
                        *lock(&current) = Some(process.clone());
                        *lock(&state) = DaemonState::Running;

                        tokio::select! {
                            code = process.wait() => {
                                lock(&current).take();
                                if *stop_rx.borrow() {
                                    break;
                                }
                                warn!(code, "daemon exited unexpectedly, restarting");
                            }
                            _ = stop_rx.changed() => {
                                // a stop racing this select may have missed
                                // the process; shut it down here
                                let leftover = lock(&current).take();
                                if let Some(p) = leftover {
                                    graceful_stop(p, grace).await;
                                }
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "failed to start daemon");
                    }
                }
            }

            *lock(&state) = DaemonState::Stopped;
        });

        Ok(())
    }

    /// Deliver a signal to the running process.
    ///
    /// Returns `ExecError::NotRunning` when there is no live child; for
    /// reload-style signals callers treat that as a no-op.
    pub fn signal(&self, sig: Signal) -> Result<(), ExecError> {
        let process = lock(&self.current).clone();
        match process {
            Some(p) => p.signal(sig).map_err(ExecError::Signal),
            None => Err(ExecError::NotRunning),
        }
    }

    /// Stop the daemon: cancel pending restarts, then terminate the
    /// process gracefully, escalating to SIGKILL after the grace period.
    ///
    /// Idempotent; safe on a never-started handle.
    pub async fn stop(&self) {
        *lock(&self.state) = DaemonState::Stopping;

        // cancel the restart loop before touching the process so a
        // crash racing this stop cannot resurrect the child
        let _ = self.stop_tx.send(true);

        let process = lock(&self.current).take();
        let grace = *lock(&self.grace_period);
        if let Some(p) = process {
            graceful_stop(p, grace).await;
        }

        *lock(&self.state) = DaemonState::Stopped;
    }
}

async fn graceful_stop(process: Arc<dyn Process>, grace: Duration) {
    if let Err(e) = process.signal(Signal::SIGTERM) {
        warn!(error = %e, "could not request graceful exit");
    }
    if timeout(grace, process.wait()).await.is_err() {
        warn!(pid = process.id(), "grace period expired, killing daemon");
        process.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    struct FailSpawner {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Spawner for FailSpawner {
        async fn spawn(&self) -> io::Result<Box<dyn Process>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::NotFound, "no such binary"))
        }
    }

    struct FakeProcess {
        exit_tx: watch::Sender<Option<i32>>,
        exit_rx: watch::Receiver<Option<i32>>,
        signals: Arc<Mutex<Vec<Signal>>>,
        exit_on_term: bool,
    }

    impl FakeProcess {
        fn new(exit_on_term: bool, signals: Arc<Mutex<Vec<Signal>>>) -> Self {
            let (exit_tx, exit_rx) = watch::channel(None);
            Self {
                exit_tx,
                exit_rx,
                signals,
                exit_on_term,
            }
        }
    }

    #[async_trait]
    impl Process for FakeProcess {
        fn id(&self) -> u32 {
            4242
        }

        async fn wait(&self) -> i32 {
            let mut rx = self.exit_rx.clone();
            loop {
                if let Some(code) = *rx.borrow_and_update() {
                    return code;
                }
                if rx.changed().await.is_err() {
                    return -1;
                }
            }
        }

        fn signal(&self, sig: Signal) -> io::Result<()> {
            lock(&self.signals).push(sig);
            if self.exit_on_term && sig == Signal::SIGTERM {
                let _ = self.exit_tx.send(Some(0));
            }
            Ok(())
        }

        async fn kill(&self) {
            lock(&self.signals).push(Signal::SIGKILL);
            let _ = self.exit_tx.send(Some(-9));
        }
    }

    struct FakeSpawner {
        attempts: Arc<AtomicUsize>,
        signals: Arc<Mutex<Vec<Signal>>>,
        exit_on_term: bool,
        crash_immediately: bool,
    }

    #[async_trait]
    impl Spawner for FakeSpawner {
        async fn spawn(&self) -> io::Result<Box<dyn Process>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let p = FakeProcess::new(self.exit_on_term, self.signals.clone());
            if self.crash_immediately {
                let _ = p.exit_tx.send(Some(1));
            }
            Ok(Box::new(p))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_loop_backoff_is_bounded() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let daemon = Daemon::from_spawner(Arc::new(FailSpawner {
            attempts: attempts.clone(),
        }));

        daemon.run_forever().unwrap();
        sleep(Duration::from_secs(5)).await;

        let n = attempts.load(Ordering::SeqCst);
        assert!(n >= 2, "supervisor should keep retrying, got {n}");
        assert!(n <= 7, "restart attempts not bounded by backoff, got {n}");
        assert!(!daemon.is_running());

        daemon.stop().await;
        assert!(!daemon.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_on_never_started() {
        let daemon = Daemon::from_spawner(Arc::new(FailSpawner {
            attempts: Arc::new(AtomicUsize::new(0)),
        }));

        daemon.stop().await;
        daemon.stop().await;
        daemon.stop().await;
        assert_eq!(daemon.state(), DaemonState::Stopped);
    }

    #[tokio::test]
    async fn test_signal_without_process_is_not_running() {
        let daemon = Daemon::from_spawner(Arc::new(FailSpawner {
            attempts: Arc::new(AtomicUsize::new(0)),
        }));

        match daemon.signal(Signal::SIGHUP) {
            Err(ExecError::NotRunning) => {}
            other => panic!("expected NotRunning, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_process_is_restarted() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let daemon = Daemon::from_spawner(Arc::new(FakeSpawner {
            attempts: attempts.clone(),
            signals: Arc::new(Mutex::new(Vec::new())),
            exit_on_term: true,
            crash_immediately: true,
        }));

        daemon.run_forever().unwrap();
        sleep(Duration::from_secs(3)).await;

        assert!(attempts.load(Ordering::SeqCst) >= 2);
        daemon.stop().await;
    }

    #[test]
    fn test_stop_future_is_send() {
        // the supervisor is driven from spawned tasks, so its futures
        // must not capture a mutex guard across an await point
        fn require_send<T: Send>(_: &T) {}

        let daemon = Daemon::from_spawner(Arc::new(FailSpawner {
            attempts: Arc::new(AtomicUsize::new(0)),
        }));
        let fut = daemon.stop();
        require_send(&fut);
        drop(fut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_in_backoff_window_prevents_respawn() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let daemon = Daemon::from_spawner(Arc::new(FailSpawner {
            attempts: attempts.clone(),
        }));

        daemon.run_forever().unwrap();
        // first attempt has failed; the supervisor is now sleeping out
        // the backoff
        sleep(Duration::from_millis(100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        daemon.stop().await;
        sleep(Duration::from_secs(10)).await;
        assert_eq!(
            attempts.load(Ordering::SeqCst),
            1,
            "stop during the backoff window must not allow another attempt"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_restarts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let daemon = Daemon::from_spawner(Arc::new(FailSpawner {
            attempts: attempts.clone(),
        }));

        daemon.run_forever().unwrap();
        sleep(Duration::from_secs(2)).await;
        daemon.stop().await;

        let after_stop = attempts.load(Ordering::SeqCst);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), after_stop);
        assert_eq!(daemon.state(), DaemonState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop_sends_sigterm() {
        let signals = Arc::new(Mutex::new(Vec::new()));
        let daemon = Daemon::from_spawner(Arc::new(FakeSpawner {
            attempts: Arc::new(AtomicUsize::new(0)),
            signals: signals.clone(),
            exit_on_term: true,
            crash_immediately: false,
        }));

        daemon.run_forever().unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(daemon.is_running());

        daemon.stop().await;
        assert!(!daemon.is_running());
        assert!(lock(&signals).contains(&Signal::SIGTERM));
        assert!(!lock(&signals).contains(&Signal::SIGKILL));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_escalates_to_kill_after_grace() {
        let signals = Arc::new(Mutex::new(Vec::new()));
        let daemon = Daemon::from_spawner(Arc::new(FakeSpawner {
            attempts: Arc::new(AtomicUsize::new(0)),
            signals: signals.clone(),
            exit_on_term: false,
            crash_immediately: false,
        }));
        daemon.set_grace_period(Duration::from_millis(100));

        daemon.run_forever().unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(daemon.is_running());

        daemon.stop().await;
        let seen = lock(&signals).clone();
        assert!(seen.contains(&Signal::SIGTERM));
        assert!(seen.contains(&Signal::SIGKILL));
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let daemon = Daemon::from_spawner(Arc::new(FailSpawner {
            attempts: Arc::new(AtomicUsize::new(0)),
        }));

        daemon.run_forever().unwrap();
        assert!(matches!(
            daemon.run_forever(),
            Err(ExecError::AlreadyStarted)
        ));
        daemon.stop().await;
    }
}
