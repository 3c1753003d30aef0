//! Supervised iperf measurement driver.
//!
//! Launches an iperf client against a server endpoint, turns its output into
//! throughput samples and running statistics, and stops it on external
//! cancellation or when it goes quiet for longer than the idle window.

pub mod cancel;
pub mod config;
pub mod observer;
pub mod parser;
pub mod processor;
pub mod runner;
pub mod signals;
pub mod stats;
pub mod task;
pub mod watchdog;

pub use cancel::{CancelAction, CancellationToken};
pub use observer::{MeasurementObserver, TracingObserver};
pub use parser::{IperfOutputParser, ParseError, SpeedParser};
pub use runner::{IperfRunner, IperfRunnerFactory, MeasurementRunner, RunnerError, RunnerFactory};
pub use stats::RunningStats;
pub use task::{RunHandle, ServerEndpoint, StartMeasurementTask, TaskError, TaskSettings};
pub use watchdog::{IdleWatchdog, WatchdogOutcome, WatchdogState};
