use crate::stats::RunningStats;
use std::error::Error;

/// Callbacks a measurement run reports to the surrounding pipeline.
///
/// `on_speed_update` is invoked while the processor holds its lock, so
/// implementations must return quickly and must not call back into the run.
pub trait MeasurementObserver: Send + Sync {
    /// Fired once, just before the first spawn attempt.
    fn on_start(&self) {}

    /// Fired once per accepted sample. `stats` already includes `latest`.
    fn on_speed_update(&self, _stats: &RunningStats, _latest: u64) {}

    /// Fired once per completed run with the final (possibly partial) stats.
    fn on_finish(&self, _stats: &RunningStats) {}

    /// Diagnostic sink.
    fn on_log(&self, _tag: &str, _message: &str, _error: Option<&(dyn Error + 'static)>) {}
}

/// Observer that forwards every callback to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl MeasurementObserver for TracingObserver {
    fn on_start(&self) {
        tracing::info!("measurement starting");
    }

    fn on_speed_update(&self, stats: &RunningStats, latest: u64) {
        tracing::info!(
            bits_per_second = latest,
            samples = stats.count(),
            mean = ?stats.mean(),
            "throughput sample"
        );
    }

    fn on_finish(&self, stats: &RunningStats) {
        tracing::info!(
            samples = stats.count(),
            min = ?stats.min(),
            max = ?stats.max(),
            mean = ?stats.mean(),
            "measurement finished"
        );
    }

    fn on_log(&self, tag: &str, message: &str, error: Option<&(dyn Error + 'static)>) {
        match error {
            Some(e) => tracing::warn!(tag, error = %e, "{message}"),
            None => tracing::debug!(tag, "{message}"),
        }
    }
}
