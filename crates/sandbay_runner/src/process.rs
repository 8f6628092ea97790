//! Async external process execution.
//!
//! Every container runtime invocation goes through [`ProcessRunner`]. A
//! non-zero exit is a normal [`ProcessOutput`], never an error; a process
//! that cannot be spawned at all reports [`SPAWN_FAILED`] with the spawn
//! error in `stderr`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Exit code reported when the process could not be spawned.
pub const SPAWN_FAILED: i64 = -1;

/// Exit code reported when the process was terminated by a signal.
pub const TERMINATED: i64 = 137;

/// Output line from a running process.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub timestamp: chrono::DateTime<Utc>,
    pub stream: LogStream,
    pub message: String,
}

/// Log stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Log handler callback type.
pub type LogHandler = Arc<dyn Fn(LogLine) + Send + Sync>;

/// Caller side of a stop request for a streaming process.
#[derive(Debug)]
pub struct StopHandle(watch::Sender<bool>);

impl StopHandle {
    /// Ask every process holding a matching signal to be killed.
    pub fn stop(&self) {
        let _ = self.0.send(true);
    }
}

/// Process side of a stop request.
#[derive(Debug, Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    /// Whether a stop has already been requested.
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve `true` once a stop is requested, or `false` if the handle
    /// was dropped without requesting one.
    pub async fn stopped(&mut self) -> bool {
        self.0.wait_for(|stopped| *stopped).await.is_ok()
    }
}

/// Create a connected stop handle and signal.
pub fn stop_pair() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle(tx), StopSignal(rx))
}

/// Description of a process to run.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub stdin: Option<Vec<u8>>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stdin(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    /// Format the command line for logging.
    pub fn display(&self) -> String {
        let mut cmd = self.program.clone();
        for arg in &self.args {
            if arg.contains(' ') || arg.contains('=') || arg.contains('\n') {
                cmd.push_str(&format!(" '{}'", arg.replace('\n', "\\n")));
            } else {
                cmd.push_str(&format!(" {}", arg));
            }
        }
        cmd
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Whether the process never started.
    pub fn spawn_failed(&self) -> bool {
        self.exit_code == SPAWN_FAILED
    }

    /// Best available diagnostic text: stderr, falling back to stdout.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }

    fn spawn_error(err: std::io::Error) -> Self {
        Self {
            exit_code: SPAWN_FAILED,
            stdout: String::new(),
            stderr: err.to_string(),
            duration_ms: 0,
        }
    }
}

fn exit_code(status: std::io::Result<std::process::ExitStatus>) -> i64 {
    match status {
        Ok(status) => status.code().map(i64::from).unwrap_or(TERMINATED),
        Err(e) => {
            warn!("Failed to wait for process: {}", e);
            SPAWN_FAILED
        }
    }
}

/// Runs external commands asynchronously.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run a process to completion, buffering all output.
    pub async fn run(&self, spec: &ProcessSpec) -> ProcessOutput {
        debug!("Executing: {}", spec.display());
        let started = Instant::now();

        let mut child = match spec.command().spawn() {
            Ok(child) => child,
            Err(e) => {
                debug!("Failed to spawn {}: {}", spec.program, e);
                return ProcessOutput::spawn_error(e);
            }
        };
        feed_stdin(&mut child, spec.stdin.clone());

        match child.wait_with_output().await {
            Ok(output) => ProcessOutput {
                exit_code: exit_code(Ok(output.status)),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                duration_ms: started.elapsed().as_millis() as u64,
            },
            Err(e) => ProcessOutput::spawn_error(e),
        }
    }

    /// Run a process, delivering each output line to `handler` as it arrives.
    ///
    /// Output is still accumulated in the returned [`ProcessOutput`]. When
    /// `stop` fires the process is killed and reports [`TERMINATED`].
    pub async fn run_streaming(
        &self,
        spec: &ProcessSpec,
        handler: LogHandler,
        stop: Option<StopSignal>,
    ) -> ProcessOutput {
        debug!("Streaming: {}", spec.display());
        let started = Instant::now();

        let mut child = match spec.command().spawn() {
            Ok(child) => child,
            Err(e) => return ProcessOutput::spawn_error(e),
        };
        feed_stdin(&mut child, spec.stdin.clone());

        let stdout_task = tokio::spawn(pump(child.stdout.take(), LogStream::Stdout, handler.clone()));
        let stderr_task = tokio::spawn(pump(child.stderr.take(), LogStream::Stderr, handler));

        let status = match stop {
            Some(mut signal) => {
                tokio::select! {
                    status = child.wait() => status,
                    true = signal.stopped() => {
                        warn!("Stop requested, killing {}", spec.program);
                        let _ = child.kill().await;
                        child.wait().await
                    }
                }
            }
            None => child.wait().await,
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        ProcessOutput {
            exit_code: exit_code(status),
            stdout,
            stderr,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

fn feed_stdin(child: &mut tokio::process::Child, payload: Option<Vec<u8>>) {
    if let (Some(mut stdin), Some(payload)) = (child.stdin.take(), payload) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&payload).await {
                warn!("Failed to write process stdin: {}", e);
            }
            let _ = stdin.shutdown().await;
        });
    }
}

async fn pump<R>(reader: Option<R>, stream: LogStream, handler: LogHandler) -> String
where
    R: AsyncRead + Unpin,
{
    let mut output = String::new();
    let Some(reader) = reader else {
        return output;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        output.push_str(&line);
        output.push('\n');
        handler(LogLine {
            timestamp: Utc::now(),
            stream,
            message: line,
        });
    }
    output
}
