/// Per-run consumer of measurement output.
///
/// Turns stdout/stderr lines into samples, statistics and observer events,
/// and owns the one-shot "started" and "finished" edges of the run.
use crate::observer::MeasurementObserver;
use crate::parser::SpeedParser;
use crate::runner::RunnerCallbacks;
use crate::stats::RunningStats;
use crate::watchdog::IdleWatchdog;
use std::sync::{Arc, Mutex, PoisonError};

pub const STDOUT_TAG: &str = "measurement stdout";
pub const STDERR_TAG: &str = "measurement stderr";
pub const PARSER_TAG: &str = "speed parser";

type StartedEdge = Box<dyn FnOnce() + Send>;
type FinishedEdge = Box<dyn FnOnce(RunningStats) + Send>;

struct State {
    stats: RunningStats,
    started: Option<StartedEdge>,
}

pub struct OutputProcessor {
    parser: Arc<dyn SpeedParser>,
    observer: Arc<dyn MeasurementObserver>,
    watchdog: Arc<IdleWatchdog>,
    state: Mutex<State>,
    finished: Mutex<Option<FinishedEdge>>,
}

impl OutputProcessor {
    /// `on_started` fires after the first parsed sample; `on_finished`
    /// fires after the completion observer with the final stats.
    pub fn new(
        parser: Arc<dyn SpeedParser>,
        observer: Arc<dyn MeasurementObserver>,
        watchdog: Arc<IdleWatchdog>,
        on_started: impl FnOnce() + Send + 'static,
        on_finished: impl FnOnce(RunningStats) + Send + 'static,
    ) -> Self {
        Self {
            parser,
            observer,
            watchdog,
            state: Mutex::new(State {
                stats: RunningStats::new(),
                started: Some(Box::new(on_started)),
            }),
            finished: Mutex::new(Some(Box::new(on_finished))),
        }
    }

    pub fn on_stdout_line(&self, line: &str) {
        self.observer.on_log(STDOUT_TAG, line, None);
        self.watchdog.update_activity();

        let sample = match self.parser.parse_speed(line) {
            Ok(sample) => sample,
            Err(e) => {
                self.observer.on_log(
                    PARSER_TAG,
                    &format!("invalid stdout format: {line}"),
                    Some(&e),
                );
                return;
            }
        };

        let mut state = self.lock();
        state.stats.accept(sample);
        let snapshot = state.stats;
        self.observer.on_speed_update(&snapshot, sample);
        // Inside the lock so no later sample can be observed first.
        if let Some(started) = state.started.take() {
            started();
        }
    }

    pub fn on_stderr_line(&self, line: &str) {
        self.observer.on_log(STDERR_TAG, line, None);
        self.watchdog.update_activity();
    }

    pub fn on_finish(&self) {
        let snapshot = {
            let state = self.lock();
            self.observer.on_finish(&state.stats);
            state.stats
        };
        let finished = self
            .finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match finished {
            Some(finished) => finished(snapshot),
            None => tracing::warn!("measurement finished more than once"),
        }
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> RunningStats {
        self.lock().stats
    }

    /// Bind the three runner callbacks to this processor.
    pub fn callbacks(self: &Arc<Self>) -> RunnerCallbacks {
        let stdout = Arc::clone(self);
        let stderr = Arc::clone(self);
        let finish = Arc::clone(self);
        RunnerCallbacks {
            on_stdout_line: Arc::new(move |line| stdout.on_stdout_line(line)),
            on_stderr_line: Arc::new(move |line| stderr.on_stderr_line(line)),
            on_finish: Arc::new(move || finish.on_finish()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
