/// Measurement subprocess lifecycle: spawn the iperf client in a writable
/// working directory, stream stdout and stderr as lines, report exit.
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Handler for one line of subprocess output (line terminator stripped).
pub type LineHandler = Arc<dyn Fn(&str) + Send + Sync>;
/// Handler invoked once the subprocess has exited and its output drained.
pub type FinishHandler = Arc<dyn Fn() + Send + Sync>;

/// The three callbacks a runner feeds.
#[derive(Clone)]
pub struct RunnerCallbacks {
    pub on_stdout_line: LineHandler,
    pub on_stderr_line: LineHandler,
    pub on_finish: FinishHandler,
}

/// Errors that can occur while starting or stopping the subprocess.
#[derive(Debug)]
pub enum RunnerError {
    /// Failed to spawn the subprocess.
    Spawn {
        command: PathBuf,
        source: std::io::Error,
    },
    /// Spawn was interrupted before the process started; safe to retry.
    Interrupted { source: std::io::Error },
    /// `start` was called while a previous process is still running.
    AlreadyRunning { pid: u32 },
    /// The spawned child reported no usable pid.
    MissingPid,
    /// Failed to deliver the termination signal.
    Signal { pid: u32, source: Errno },
}

impl std::fmt::Display for RunnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerError::Spawn { command, source } => {
                write!(
                    f,
                    "failed to spawn measurement subprocess {}: {}",
                    command.display(),
                    source
                )
            }
            RunnerError::Interrupted { source } => {
                write!(f, "measurement subprocess start interrupted: {}", source)
            }
            RunnerError::AlreadyRunning { pid } => {
                write!(f, "measurement subprocess already running (pid {})", pid)
            }
            RunnerError::MissingPid => {
                write!(f, "measurement subprocess has no process id")
            }
            RunnerError::Signal { pid, source } => {
                write!(f, "failed to signal process group {}: {}", pid, source)
            }
        }
    }
}

impl std::error::Error for RunnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunnerError::Spawn { source, .. } => Some(source),
            RunnerError::Interrupted { source } => Some(source),
            RunnerError::AlreadyRunning { .. } | RunnerError::MissingPid => None,
            RunnerError::Signal { source, .. } => Some(source),
        }
    }
}

/// A started-on-demand measurement subprocess.
pub trait MeasurementRunner: Send + Sync {
    /// Launch the subprocess with a flat argument string. Returns once the
    /// process is spawned; output is streamed from background tasks.
    fn start(&self, args: &str) -> Result<(), RunnerError>;

    /// Ask the subprocess to exit promptly. Idempotent.
    fn request_termination(&self) -> Result<(), RunnerError>;
}

/// Builds a runner bound to a working directory and a set of callbacks.
pub trait RunnerFactory: Send + Sync {
    fn build(&self, writable_dir: &Path, callbacks: RunnerCallbacks) -> Arc<dyn MeasurementRunner>;
}

/// Split the flat argument string into argv tokens.
pub fn tokenize(args: &str) -> Vec<String> {
    args.split_whitespace().map(str::to_string).collect()
}

/// Process group id for a freshly spawned child. Group 0 would address the
/// driver's own group, so a missing or zero pid is an error.
fn process_group(id: Option<u32>) -> Result<u32, RunnerError> {
    match id {
        Some(pid) if pid > 0 => Ok(pid),
        _ => Err(RunnerError::MissingPid),
    }
}

/// Runner backed by a real iperf binary.
pub struct IperfRunner {
    command: PathBuf,
    writable_dir: PathBuf,
    callbacks: RunnerCallbacks,
    /// Process group of the running child, cleared once it exits.
    pgid: Arc<Mutex<Option<u32>>>,
}

pub struct IperfRunnerBuilder {
    command: PathBuf,
    writable_dir: PathBuf,
    on_stdout_line: LineHandler,
    on_stderr_line: LineHandler,
    on_finish: FinishHandler,
}

impl IperfRunner {
    pub fn builder(writable_dir: impl Into<PathBuf>) -> IperfRunnerBuilder {
        IperfRunnerBuilder {
            command: PathBuf::from("iperf3"),
            writable_dir: writable_dir.into(),
            on_stdout_line: Arc::new(|_| {}),
            on_stderr_line: Arc::new(|_| {}),
            on_finish: Arc::new(|| {}),
        }
    }

    /// Pid (and process group id) of the running child, if any.
    pub fn pid(&self) -> Option<u32> {
        *self.pgid.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl IperfRunnerBuilder {
    pub fn command(mut self, command: impl Into<PathBuf>) -> Self {
        self.command = command.into();
        self
    }

    pub fn stdout_lines_handler(mut self, handler: LineHandler) -> Self {
        self.on_stdout_line = handler;
        self
    }

    pub fn stderr_lines_handler(mut self, handler: LineHandler) -> Self {
        self.on_stderr_line = handler;
        self
    }

    pub fn on_finish_callback(mut self, handler: FinishHandler) -> Self {
        self.on_finish = handler;
        self
    }

    pub fn callbacks(self, callbacks: RunnerCallbacks) -> Self {
        self.stdout_lines_handler(callbacks.on_stdout_line)
            .stderr_lines_handler(callbacks.on_stderr_line)
            .on_finish_callback(callbacks.on_finish)
    }

    pub fn build(self) -> IperfRunner {
        IperfRunner {
            command: self.command,
            writable_dir: self.writable_dir,
            callbacks: RunnerCallbacks {
                on_stdout_line: self.on_stdout_line,
                on_stderr_line: self.on_stderr_line,
                on_finish: self.on_finish,
            },
            pgid: Arc::new(Mutex::new(None)),
        }
    }
}

impl MeasurementRunner for IperfRunner {
    /// Must be called from within a tokio runtime.
    fn start(&self, args: &str) -> Result<(), RunnerError> {
        let mut pgid = self.pgid.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pid) = *pgid {
            return Err(RunnerError::AlreadyRunning { pid });
        }

        let argv = tokenize(args);
        tracing::info!(
            command = %self.command.display(),
            args = ?argv,
            dir = %self.writable_dir.display(),
            "spawning measurement subprocess"
        );

        let mut child = Command::new(&self.command)
            .args(&argv)
            .current_dir(&self.writable_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // New process group for clean kill
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::Interrupted => RunnerError::Interrupted { source: e },
                _ => RunnerError::Spawn {
                    command: self.command.clone(),
                    source: e,
                },
            })?;

        let pid = process_group(child.id())?;
        *pgid = Some(pid);
        drop(pgid);
        tracing::info!(pid, "measurement subprocess started");

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, self.callbacks.on_stdout_line.clone())));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, self.callbacks.on_stderr_line.clone())));

        let on_finish = self.callbacks.on_finish.clone();
        let pgid = Arc::clone(&self.pgid);
        tokio::spawn(async move {
            // Drain both streams before reporting completion.
            for reader in [stdout, stderr].into_iter().flatten() {
                if let Err(e) = reader.await {
                    tracing::warn!(error = %e, "output reader task failed");
                }
            }
            match child.wait().await {
                Ok(status) => tracing::info!(
                    pid,
                    exit_code = ?status.code(),
                    "measurement subprocess exited"
                ),
                Err(e) => tracing::warn!(pid, error = %e, "failed to wait for measurement subprocess"),
            }
            *pgid.lock().unwrap_or_else(PoisonError::into_inner) = None;
            on_finish();
        });

        Ok(())
    }

    fn request_termination(&self) -> Result<(), RunnerError> {
        let Some(pid) = self.pid() else {
            tracing::debug!("no measurement subprocess to terminate");
            return Ok(());
        };
        tracing::info!(pid, "killing measurement process group");
        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(RunnerError::Signal { pid, source }),
        }
    }
}

/// Read `reader` line by line, handing each line to `handler`.
///
/// Bytes that are not valid UTF-8 are replaced rather than ending the stream.
async fn forward_lines<R>(reader: R, handler: LineHandler)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                handler(line.trim_end_matches(['\n', '\r']));
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read measurement output");
                break;
            }
        }
    }
}

/// Factory producing [`IperfRunner`]s for a fixed binary.
#[derive(Debug, Clone)]
pub struct IperfRunnerFactory {
    command: PathBuf,
}

impl IperfRunnerFactory {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl RunnerFactory for IperfRunnerFactory {
    fn build(&self, writable_dir: &Path, callbacks: RunnerCallbacks) -> Arc<dyn MeasurementRunner> {
        Arc::new(
            IperfRunner::builder(writable_dir)
                .command(&self.command)
                .callbacks(callbacks)
                .build(),
        )
    }
}
