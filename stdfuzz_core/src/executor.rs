use crate::input::Input;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How often a child is polled while a deadline is armed.
const DEADLINE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long output capture may lag behind a killed target before it is abandoned.
const CAPTURE_GRACE: Duration = Duration::from_millis(200);

type CapturedOutput = io::Result<Vec<u8>>;

/// How a single target execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "value")]
pub enum ExecutionStatus {
    Exited(i32),
    /// Terminated by a signal before it could report an exit code (unix only).
    Signaled(i32),
    /// The deadline expired and the child was killed.
    TimedOut,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Exited(code) => write!(f, "Exit code: {code}"),
            ExecutionStatus::Signaled(signal) => write!(f, "Terminated by signal {signal}"),
            ExecutionStatus::TimedOut => f.write_str("Timed out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    /// Merged stdout and stderr, decoded lossily.
    pub output: String,
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            ExecutionStatus::Exited(code) => Some(code),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to set up output pipe: {0}")]
    Pipe(#[source] io::Error),
    #[error("Failed to spawn command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write to child stdin: {0}")]
    StdinWrite(#[source] io::Error),
    #[error("Error waiting for child: {0}")]
    Wait(#[source] io::Error),
    #[error("Failed to kill timed-out process: {0}")]
    Kill(#[source] io::Error),
    #[error("Failed to capture child output: {0}")]
    Capture(#[source] io::Error),
    #[error("Output capture thread panicked")]
    CaptureThreadPanicked,
}

/// The interpreter the target command string is handed to.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Shell {
    /// `cmd.exe /c` on Windows, `sh -c` everywhere else.
    #[default]
    Auto,
    Sh,
    Cmd,
}

impl Shell {
    fn resolve(self) -> Shell {
        match self {
            Shell::Auto if cfg!(windows) => Shell::Cmd,
            Shell::Auto => Shell::Sh,
            other => other,
        }
    }

    /// Program and arguments that run `command` through this shell.
    pub fn invocation(self, command: &str) -> (OsString, Vec<OsString>) {
        match self.resolve() {
            Shell::Cmd => ("cmd.exe".into(), vec!["/c".into(), command.into()]),
            _ => ("sh".into(), vec!["-c".into(), command.into()]),
        }
    }
}

/// Runs the target once per input.
pub trait Executor<I: Input> {
    fn execute(&mut self, input: &I) -> Result<ExecutionResult, ExecutorError>;
}

#[derive(Debug, Clone)]
pub struct CommandExecutorConfig {
    /// Passed verbatim as the shell's single command argument.
    pub command: String,
    pub shell: Shell,
    pub working_dir: Option<PathBuf>,
    /// `None` waits for the child indefinitely.
    pub timeout: Option<Duration>,
}

impl CommandExecutorConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            shell: Shell::Auto,
            working_dir: None,
            timeout: None,
        }
    }
}

/// Drives an external target through the platform shell, one child per input.
pub struct CommandExecutor {
    config: CommandExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CommandExecutorConfig {
        &self.config
    }

    /// Spawns the child with stdout and stderr sharing `writer`.
    ///
    /// The `Command` owns the parent's copies of the write end and is dropped
    /// on return, so the capture side sees EOF as soon as the child exits.
    fn spawn(&self, writer: io::PipeWriter) -> Result<Child, ExecutorError> {
        let stderr_writer = writer.try_clone().map_err(ExecutorError::Pipe)?;
        let (program, args) = self.config.shell.invocation(&self.config.command);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(writer)
            .stderr(stderr_writer);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // The shell leads a fresh group so a deadline kill reaches everything it started.
            cmd.process_group(0);
        }

        cmd.spawn().map_err(|source| ExecutorError::Spawn {
            command: self.config.command.clone(),
            source,
        })
    }

    /// Writes the whole input and closes stdin.
    ///
    /// A target that exits without reading closes its end first; that is the
    /// target's business, so a broken pipe is only logged.
    fn feed_stdin(child: &mut Child, input: &[u8]) -> Result<(), ExecutorError> {
        let Some(mut stdin) = child.stdin.take() else {
            return Err(ExecutorError::StdinWrite(io::Error::other(
                "child stdin was not available after piping",
            )));
        };
        match stdin.write_all(input).and_then(|()| stdin.flush()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("Target closed stdin before reading all {} bytes", input.len());
                Ok(())
            }
            Err(e) => Err(ExecutorError::StdinWrite(e)),
        }
    }

    /// Waits for the child, killing it once `timeout` has elapsed.
    ///
    /// Returns `None` when the child had to be killed.
    fn wait_with_deadline(
        child: &mut Child,
        timeout: Duration,
    ) -> Result<Option<ExitStatus>, ExecutorError> {
        let start_time = Instant::now();
        loop {
            if let Some(status) = child.try_wait().map_err(ExecutorError::Wait)? {
                return Ok(Some(status));
            }
            if start_time.elapsed() >= timeout {
                warn!("Target exceeded {timeout:?}, killing it");
                kill_process_tree(child).map_err(ExecutorError::Kill)?;
                child.wait().map_err(ExecutorError::Wait)?;
                return Ok(None);
            }
            thread::sleep(DEADLINE_POLL_INTERVAL);
        }
    }

    /// Best-effort teardown on error paths; the original error is what gets reported.
    fn abandon(child: &mut Child) {
        if let Err(e) = kill_process_tree(child) {
            debug!("Kill after failure: {e}");
        }
        if let Err(e) = child.wait() {
            debug!("Reap after failure: {e}");
        }
    }
}

/// Kills the target together with every process it spawned.
#[cfg(unix)]
fn kill_process_tree(child: &mut Child) -> io::Result<()> {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: killpg only sends a signal; the group is the one created for this child.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    match io::Error::last_os_error() {
        e if e.raw_os_error() == Some(libc::ESRCH) => Ok(()),
        e => Err(e),
    }
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) -> io::Result<()> {
    child.kill()
}

/// Reads everything the target writes to the shared output pipe on a helper thread.
fn spawn_capture(mut reader: io::PipeReader) -> Receiver<CapturedOutput> {
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let mut captured = Vec::new();
        let read = reader.read_to_end(&mut captured).map(|_| captured);
        if sender.send(read).is_err() {
            debug!("Output of an abandoned target discarded");
        }
    });
    receiver
}

/// Collects the captured output; with a `grace` period, gives up on a pipe still held open.
fn collect_output(
    receiver: &Receiver<CapturedOutput>,
    grace: Option<Duration>,
) -> Result<Vec<u8>, ExecutorError> {
    let captured = match grace {
        None => receiver
            .recv()
            .map_err(|_| ExecutorError::CaptureThreadPanicked)?,
        Some(grace) => match receiver.recv_timeout(grace) {
            Ok(captured) => captured,
            Err(RecvTimeoutError::Timeout) => {
                warn!("Output pipe still open {grace:?} after kill, dropping output");
                return Ok(Vec::new());
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(ExecutorError::CaptureThreadPanicked);
            }
        },
    };
    captured.map_err(ExecutorError::Capture)
}

fn status_from_exit(status: ExitStatus) -> ExecutionStatus {
    if let Some(code) = status.code() {
        return ExecutionStatus::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExecutionStatus::Signaled(signal);
        }
    }
    ExecutionStatus::Exited(-1)
}

impl<I: Input> Executor<I> for CommandExecutor {
    fn execute(&mut self, input: &I) -> Result<ExecutionResult, ExecutorError> {
        let start_time = Instant::now();
        let (reader, writer) = io::pipe().map_err(ExecutorError::Pipe)?;
        let mut child = self.spawn(writer)?;
        let capture = spawn_capture(reader);

        let waited = Self::feed_stdin(&mut child, input.as_bytes()).and_then(|()| {
            match self.config.timeout {
                Some(timeout) => Self::wait_with_deadline(&mut child, timeout),
                None => child.wait().map(Some).map_err(ExecutorError::Wait),
            }
        });
        let exit_status = match waited {
            Ok(exit_status) => exit_status,
            Err(e) => {
                Self::abandon(&mut child);
                if let Err(capture_err) = collect_output(&capture, Some(CAPTURE_GRACE)) {
                    debug!("Capture after failure: {capture_err}");
                }
                return Err(e);
            }
        };

        let grace = exit_status.is_none().then_some(CAPTURE_GRACE);
        let captured = collect_output(&capture, grace)?;

        let status = exit_status.map_or(ExecutionStatus::TimedOut, status_from_exit);
        Ok(ExecutionResult {
            status,
            output: String::from_utf8_lossy(&captured).into_owned(),
            elapsed: start_time.elapsed(),
        })
    }
}
