/// Idle-output monitor for measurement runs.
///
/// Runs alongside the measurement subprocess. Every stdout or stderr line
/// rearms the window; if the window elapses with no activity the registered
/// cancellation action is invoked exactly once.
use crate::cancel::CancelAction;
use crate::observer::MeasurementObserver;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

pub const LOG_TAG: &str = "idle watchdog";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Idle,
    Armed,
    Fired,
    Disarmed,
}

/// How `register_blocking` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// The idle window elapsed and the action was invoked.
    Fired,
    /// `disarm()` was called before the window elapsed.
    Disarmed,
}

struct Inner {
    state: WatchdogState,
    last_activity: Instant,
}

pub struct IdleWatchdog {
    inner: Mutex<Inner>,
    disarm_tx: watch::Sender<bool>,
    log: Option<Arc<dyn MeasurementObserver>>,
}

impl IdleWatchdog {
    pub fn new() -> Self {
        let (disarm_tx, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner {
                state: WatchdogState::Idle,
                last_activity: Instant::now(),
            }),
            disarm_tx,
            log: None,
        }
    }

    /// Route action failures to the observer's log sink as well as `tracing`.
    pub fn with_log_sink(mut self, log: Arc<dyn MeasurementObserver>) -> Self {
        self.log = Some(log);
        self
    }

    /// Record "now" as the latest activity instant.
    pub fn update_activity(&self) {
        let mut inner = self.lock();
        inner.last_activity = Instant::now();
    }

    pub fn state(&self) -> WatchdogState {
        self.lock().state
    }

    /// Stop waiting. Sticky: a disarm issued before `register_blocking`
    /// makes the later call return immediately.
    pub fn disarm(&self) {
        {
            let mut inner = self.lock();
            if inner.state == WatchdogState::Fired {
                return;
            }
            inner.state = WatchdogState::Disarmed;
        }
        self.disarm_tx.send_replace(true);
    }

    /// Arm with `window` and wait until either the window elapses with no
    /// activity (the action is invoked) or the watchdog is disarmed.
    pub async fn register_blocking(&self, window: Duration, action: CancelAction) -> WatchdogOutcome {
        let mut disarmed = self.disarm_tx.subscribe();
        {
            let mut inner = self.lock();
            match inner.state {
                WatchdogState::Disarmed => return WatchdogOutcome::Disarmed,
                WatchdogState::Fired => return WatchdogOutcome::Fired,
                WatchdogState::Idle | WatchdogState::Armed => {}
            }
            inner.state = WatchdogState::Armed;
            inner.last_activity = Instant::now();
        }
        tracing::debug!(window_ms = window.as_millis() as u64, "idle watchdog armed");

        loop {
            let deadline = self.lock().last_activity + window;
            tokio::select! {
                _ = disarmed.wait_for(|d| *d) => {
                    tracing::debug!("idle watchdog disarmed");
                    return WatchdogOutcome::Disarmed;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    {
                        let mut inner = self.lock();
                        if inner.state == WatchdogState::Disarmed {
                            return WatchdogOutcome::Disarmed;
                        }
                        if inner.last_activity.elapsed() < window {
                            continue;
                        }
                        inner.state = WatchdogState::Fired;
                    }
                    tracing::warn!(
                        window_ms = window.as_millis() as u64,
                        "no output within idle window, cancelling"
                    );
                    self.fire(&action);
                    return WatchdogOutcome::Fired;
                }
            }
        }
    }

    fn fire(&self, action: &CancelAction) {
        if catch_unwind(AssertUnwindSafe(|| action())).is_err() {
            tracing::error!("idle watchdog action panicked");
            if let Some(log) = &self.log {
                log.on_log(LOG_TAG, "cancellation action failed", None);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for IdleWatchdog {
    fn default() -> Self {
        Self::new()
    }
}
