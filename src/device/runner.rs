//! Process execution for the external `rmapi` and remote-shell commands.
//!
//! Every device interaction goes through [`CommandRunner`]. The runner never
//! interprets exit codes: a non-zero exit is data for the caller, and only a
//! failure to spawn (or to wait on) the process is an error. Waits are
//! bounded by the invocation's timeout, including draining its output; an
//! expired child is killed and reported as [`RunError::TimedOut`].

use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Interval between `try_wait` polls while a child is running.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Errors raised while running an external command.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {} seconds", .timeout.as_secs_f64())]
    TimedOut { program: String, timeout: Duration },

    #[error("failed waiting on {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// A single external command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Program name as shown in logs and errors.
    pub fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Arguments rendered lossily, for logging and test assertions.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

/// Exit status and captured stdout of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Seam between the device logic and process spawning.
pub trait CommandRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, RunError>;
}

impl<T: CommandRunner + ?Sized> CommandRunner for &T {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, RunError> {
        (**self).run(invocation)
    }
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, RunError> {
        let program = invocation.program_name();

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &invocation.cwd {
            cmd.current_dir(dir);
        }

        tracing::debug!(
            program = %program,
            args = ?invocation.args_lossy(),
            cwd = ?invocation.cwd,
            "spawning command"
        );

        let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
            program: program.clone(),
            source,
        })?;

        // Drain both pipes off-thread so a chatty child never blocks on a full pipe.
        let stdout_rx = child.stdout.take().map(drain_pipe);
        let stderr_rx = child.stderr.take().map(drain_pipe);

        let start = Instant::now();
        let deadline = start + invocation.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if start.elapsed() >= invocation.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    tracing::warn!(
                        program = %program,
                        timeout_secs = invocation.timeout.as_secs_f64(),
                        "command timed out, killed"
                    );
                    return Err(RunError::TimedOut {
                        program,
                        timeout: invocation.timeout,
                    });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(source) => {
                    let _ = child.kill();
                    return Err(RunError::Wait { program, source });
                }
            }
        };

        // A background process that inherited the pipes can hold them open
        // after the child exits; the same deadline bounds the drain.
        let (Some(stdout), Some(stderr)) = (
            collect_pipe(stdout_rx, deadline),
            collect_pipe(stderr_rx, deadline),
        ) else {
            tracing::warn!(
                program = %program,
                timeout_secs = invocation.timeout.as_secs_f64(),
                "command exited but its output stayed open past the timeout"
            );
            return Err(RunError::TimedOut {
                program,
                timeout: invocation.timeout,
            });
        };

        for (stream, error) in [("stdout", &stdout.error), ("stderr", &stderr.error)] {
            if let Some(e) = error {
                tracing::warn!(program = %program, stream, error = %e, "failed reading command output");
            }
        }
        let stdout = stdout.bytes;
        let stderr = stderr.bytes;

        if !stderr.is_empty() {
            tracing::debug!(
                program = %program,
                stderr = %String::from_utf8_lossy(&stderr).trim(),
                "command stderr"
            );
        }

        Ok(CommandOutput {
            exit_code: status.code(),
            stdout,
        })
    }
}

/// Everything read from one pipe, plus the read error that cut it short.
#[derive(Debug, Default)]
struct PipeOutput {
    bytes: Vec<u8>,
    error: Option<std::io::Error>,
}

/// Read `pipe` to the end on its own thread.
fn drain_pipe<P: Read + Send + 'static>(mut pipe: P) -> Receiver<PipeOutput> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut output = PipeOutput::default();
        if let Err(e) = pipe.read_to_end(&mut output.bytes) {
            output.error = Some(e);
        }
        // The receiver is gone when the run already gave up on this pipe.
        let _ = tx.send(output);
    });
    rx
}

/// Wait for a drained pipe until `deadline`. `None` means it was still open.
fn collect_pipe(rx: Option<Receiver<PipeOutput>>, deadline: Instant) -> Option<PipeOutput> {
    let Some(rx) = rx else {
        return Some(PipeOutput::default());
    };
    let remaining = deadline
        .saturating_duration_since(Instant::now())
        .max(POLL_INTERVAL);
    match rx.recv_timeout(remaining) {
        Ok(output) => Some(output),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => Some(PipeOutput::default()),
    }
}
