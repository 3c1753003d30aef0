/// The "start measurement" pipeline task.
///
/// Wires an [`OutputProcessor`] and an [`IdleWatchdog`] to a measurement
/// runner, starts the subprocess against a server endpoint and supervises it
/// until it exits. The pipeline is told the task has started once the first
/// throughput sample has been parsed.
use crate::cancel::{CancelAction, CancellationToken};
use crate::config::MeasurementConfig;
use crate::observer::MeasurementObserver;
use crate::parser::SpeedParser;
use crate::processor::OutputProcessor;
use crate::runner::{RunnerError, RunnerFactory};
use crate::stats::RunningStats;
use crate::watchdog::IdleWatchdog;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const LOG_TAG: &str = "start measurement";

/// Address of the measurement server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub ip: String,
    pub port: u16,
}

/// A user argument that collides with the flags injected by the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgsError {
    pub flag: String,
}

impl std::fmt::Display for ArgsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "measurement args must not set the server or port, found `{}`",
            self.flag
        )
    }
}

impl std::error::Error for ArgsError {}

/// Errors that end a measurement task.
#[derive(Debug, Clone)]
pub enum TaskError {
    /// User arguments conflict with injected flags. Raised before any spawn.
    Config(ArgsError),
    /// The subprocess could not be started.
    FatalStartup {
        attempts: u32,
        source: Arc<RunnerError>,
    },
    /// The subprocess exited without producing a single sample.
    NoSamples,
    /// The task ended without delivering a result.
    Aborted,
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Config(e) => write!(f, "invalid measurement configuration: {}", e),
            TaskError::FatalStartup { attempts, source } => {
                write!(
                    f,
                    "could not start measurement after {} attempt(s): {}",
                    attempts, source
                )
            }
            TaskError::NoSamples => write!(f, "measurement finished without producing samples"),
            TaskError::Aborted => write!(f, "measurement task aborted"),
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TaskError::Config(e) => Some(e),
            TaskError::FatalStartup { source, .. } => Some(source.as_ref()),
            TaskError::NoSamples | TaskError::Aborted => None,
        }
    }
}

/// iperf short options that consume a value; in a bundle such as `-t5` the
/// rest of the token after one of these is the value, not more flags.
const VALUE_FLAGS: &str = "AbBCFiIklLMnOPSTtwX";

/// Reject user arguments that set the client target or port themselves.
///
/// Short options are read the way getopt reads them, so bundles like `-Rc`
/// or `-4p9999` are caught too.
pub fn validate_user_args(user_args: &str) -> Result<(), ArgsError> {
    for token in user_args.split_whitespace() {
        let conflicts = if let Some(long) = token.strip_prefix("--") {
            let name = long.split('=').next().unwrap_or_default();
            name == "client" || name == "port"
        } else if let Some(flags) = token.strip_prefix('-') {
            short_bundle_sets_target(flags)
        } else {
            false
        };
        if conflicts {
            return Err(ArgsError {
                flag: token.to_string(),
            });
        }
    }
    Ok(())
}

fn short_bundle_sets_target(flags: &str) -> bool {
    for ch in flags.chars() {
        if ch == 'c' || ch == 'p' {
            return true;
        }
        if VALUE_FLAGS.contains(ch) {
            return false;
        }
    }
    false
}

/// `-c <ip> -p <port> <user_args>`
pub fn compose_args(endpoint: &ServerEndpoint, user_args: &str) -> String {
    let base = format!("-c {} -p {}", endpoint.ip, endpoint.port);
    match user_args.trim() {
        "" => base,
        extra => format!("{base} {extra}"),
    }
}

/// One-shot sender for the started handle, shared by the processor's
/// started edge and the task's failure path.
type StartedSender = Arc<Mutex<Option<oneshot::Sender<Result<ServerEndpoint, TaskError>>>>>;

fn resolve(sender: &StartedSender, result: Result<ServerEndpoint, TaskError>) -> bool {
    let tx = sender.lock().unwrap_or_else(PoisonError::into_inner).take();
    match tx {
        Some(tx) => {
            let _ = tx.send(result);
            true
        }
        None => false,
    }
}

/// Resolves when the measurement has begun producing data, or failed.
#[derive(Debug)]
pub struct StartedHandle {
    rx: oneshot::Receiver<Result<ServerEndpoint, TaskError>>,
}

impl StartedHandle {
    pub async fn wait(self) -> Result<ServerEndpoint, TaskError> {
        self.rx.await.unwrap_or(Err(TaskError::Aborted))
    }
}

/// Handles returned by [`StartMeasurementTask::prepare`].
#[derive(Debug)]
pub struct RunHandle {
    pub started: StartedHandle,
    pub finished: JoinHandle<Result<RunningStats, TaskError>>,
}

/// Settings the task needs from configuration.
#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub writable_dir: PathBuf,
    pub user_args: String,
    pub idle_timeout: Duration,
    pub max_start_attempts: u32,
}

impl From<&MeasurementConfig> for TaskSettings {
    fn from(config: &MeasurementConfig) -> Self {
        Self {
            writable_dir: config.writable_dir.clone(),
            user_args: config.args.clone(),
            idle_timeout: Duration::from_millis(config.idle_timeout_millis),
            max_start_attempts: config.max_start_attempts,
        }
    }
}

pub struct StartMeasurementTask {
    settings: TaskSettings,
    parser: Arc<dyn SpeedParser>,
    observer: Arc<dyn MeasurementObserver>,
    runners: Arc<dyn RunnerFactory>,
}

impl StartMeasurementTask {
    pub fn new(
        settings: TaskSettings,
        parser: Arc<dyn SpeedParser>,
        observer: Arc<dyn MeasurementObserver>,
        runners: Arc<dyn RunnerFactory>,
    ) -> Self {
        Self {
            settings,
            parser,
            observer,
            runners,
        }
    }

    /// Spawn the task on the current tokio runtime.
    ///
    /// `started` resolves with `endpoint` after the first parsed sample, or
    /// with the error that ended the task. `finished` resolves with the final
    /// statistics once the subprocess has exited.
    pub fn prepare(self: &Arc<Self>, endpoint: ServerEndpoint, token: CancellationToken) -> RunHandle {
        let (tx, rx) = oneshot::channel();
        let sender: StartedSender = Arc::new(Mutex::new(Some(tx)));
        let task = Arc::clone(self);
        let finished = tokio::spawn(async move {
            let result = task.drive(endpoint, token, Arc::clone(&sender)).await;
            match &result {
                Ok(_) => resolve(&sender, Err(TaskError::NoSamples)),
                Err(e) => resolve(&sender, Err(e.clone())),
            };
            result
        });
        RunHandle {
            started: StartedHandle { rx },
            finished,
        }
    }

    /// Run one measurement to completion.
    async fn drive(
        &self,
        endpoint: ServerEndpoint,
        token: CancellationToken,
        started: StartedSender,
    ) -> Result<RunningStats, TaskError> {
        validate_user_args(&self.settings.user_args).map_err(TaskError::Config)?;
        let args = compose_args(&endpoint, &self.settings.user_args);

        let watchdog = Arc::new(IdleWatchdog::new().with_log_sink(Arc::clone(&self.observer)));
        let (finished_tx, finished_rx) = oneshot::channel();
        let processor = {
            let watchdog = Arc::clone(&watchdog);
            Arc::new(OutputProcessor::new(
                Arc::clone(&self.parser),
                Arc::clone(&self.observer),
                Arc::clone(&watchdog),
                move || {
                    tracing::info!(ip = %endpoint.ip, port = endpoint.port, "measurement started");
                    resolve(&started, Ok(endpoint));
                },
                move |stats| {
                    watchdog.disarm();
                    let _ = finished_tx.send(stats);
                },
            ))
        };
        let runner = self
            .runners
            .build(&self.settings.writable_dir, processor.callbacks());

        self.observer.on_start();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match runner.start(&args) {
                Ok(()) => break,
                Err(e @ RunnerError::Interrupted { .. }) if attempt < self.settings.max_start_attempts => {
                    tracing::warn!(attempt, error = %e, "measurement start interrupted, retrying");
                    self.observer
                        .on_log(LOG_TAG, "interrupted measurement start, retrying", Some(&e));
                }
                Err(e) => {
                    tracing::error!(attempt, error = %e, "could not start measurement");
                    return Err(TaskError::FatalStartup {
                        attempts: attempt,
                        source: Arc::new(e),
                    });
                }
            }
        }

        let action: CancelAction = {
            let runner = Arc::clone(&runner);
            let observer = Arc::clone(&self.observer);
            Arc::new(move || {
                if let Err(e) = runner.request_termination() {
                    observer.on_log(LOG_TAG, "could not stop measurement", Some(&e));
                }
            })
        };
        token.register(Arc::clone(&action));
        let outcome = watchdog
            .register_blocking(self.settings.idle_timeout, Arc::clone(&action))
            .await;
        tracing::debug!(?outcome, "idle watchdog released");

        // A failed kill leaves the subprocess running; keep asking once per
        // idle window until it reports completion.
        let mut finished_rx = finished_rx;
        loop {
            tokio::select! {
                stats = &mut finished_rx => return stats.map_err(|_| TaskError::Aborted),
                _ = tokio::time::sleep(self.settings.idle_timeout) => {
                    tracing::warn!("measurement still running after termination request, retrying");
                    self.observer.on_log(
                        LOG_TAG,
                        "measurement still running, requesting termination again",
                        None,
                    );
                    action();
                }
            }
        }
    }
}
