//! Command execution channel.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use sandbay_runner::{ExecRequest, LogHandler, LogLine, LogStream, StopSignal, TERMINATED};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::SessionManager;
use crate::error::{EngineError, EngineResult};
use crate::events::SessionEvent;
use crate::shell::{filter_probe_line, is_mutating, resolve_cd, LogicalShell, Step};

/// A command issued against a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub session_id: String,
    pub command: String,
    /// Directory to start from instead of the session's current one
    #[serde(default)]
    pub cwd: Option<String>,
}

impl CommandRequest {
    pub fn new(session_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            command: command.into(),
            cwd: None,
        }
    }

    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

/// Result of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    pub session_id: String,
    /// Exit code of the last step that ran
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    /// Logical working directory after the command
    pub cwd: String,
    /// The session was recreated before the command ran
    pub recovered: bool,
    /// The command may have changed the project's files
    pub files_changed: bool,
    pub duration_ms: u64,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl SessionManager {
    /// Run a command line and capture its output.
    pub async fn execute(&self, request: &CommandRequest) -> EngineResult<CommandOutcome> {
        self.run_command(request, None, None).await
    }

    /// Run a command line, delivering output lines to `handler` as they
    /// arrive. Firing `stop` kills the running step and skips the rest.
    pub async fn execute_streaming(
        &self,
        request: &CommandRequest,
        handler: LogHandler,
        stop: Option<StopSignal>,
    ) -> EngineResult<CommandOutcome> {
        self.run_command(request, Some(handler), stop).await
    }

    async fn run_command(
        &self,
        request: &CommandRequest,
        handler: Option<LogHandler>,
        stop: Option<StopSignal>,
    ) -> EngineResult<CommandOutcome> {
        let session_id = request.session_id.as_str();
        let _guard = self.sessions.lock(session_id).await;
        let started = Instant::now();

        let (session, recovered) = self.ensure_live(session_id).await?;
        let container = session
            .container
            .clone()
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        let start = match &request.cwd {
            Some(dir) => resolve_cd(&session.cwd, Some(dir)),
            None => session.cwd.clone(),
        };
        let mut shell = LogicalShell::new(start);
        let mut outcome = CommandOutcome {
            session_id: session_id.to_string(),
            recovered,
            ..Default::default()
        };
        let mut mutated = false;

        for step in shell.plan(&request.command) {
            if stop.as_ref().map(|s| s.is_stopped()).unwrap_or(false) {
                outcome.exit_code = TERMINATED;
                break;
            }

            match step {
                Step::Cd(target) => {
                    shell.cd(target.as_deref());
                    outcome.exit_code = 0;
                }
                Step::Run(command) => {
                    let exec = ExecRequest::shell(&container, shell.script(&command))
                        .workdir(shell.cwd());
                    debug!("Session {} exec in {}: {}", session_id, shell.cwd(), command);

                    let result = match &handler {
                        Some(handler) => {
                            self.runtime
                                .exec_streaming(&exec, probe_filter(handler.clone()), stop.clone())
                                .await?
                        }
                        None => self.runtime.exec(&exec).await?,
                    };

                    push_output(&mut outcome.stdout, &shell.observe(&result.stdout));
                    push_output(&mut outcome.stderr, &result.stderr);
                    outcome.exit_code = result.exit_code;
                    mutated |= is_mutating(&command);

                    if !result.success() {
                        break;
                    }
                }
            }
        }

        outcome.cwd = shell.cwd().to_string();
        outcome.duration_ms = started.elapsed().as_millis() as u64;
        self.sessions
            .update(session_id, |s| s.cwd = outcome.cwd.clone());
        self.persist().await;

        if mutated {
            outcome.files_changed = true;
            if let Err(e) = self.sync_back(&session).await {
                warn!("Sync of session {} back to store failed: {}", session_id, e);
            }
            self.events.emit(SessionEvent::FileTreeChanged {
                session_id: session_id.to_string(),
                project: session.project_name.clone(),
            });
        }

        self.events.emit(SessionEvent::CommandCompleted {
            session_id: session_id.to_string(),
            exit_code: outcome.exit_code,
            cwd: outcome.cwd.clone(),
        });
        Ok(outcome)
    }
}

fn push_output(buffer: &mut String, chunk: &str) {
    if chunk.is_empty() {
        return;
    }
    if !buffer.is_empty() && !buffer.ends_with('\n') {
        buffer.push('\n');
    }
    buffer.push_str(chunk);
}

/// Hide the working-directory probe from streamed stdout.
///
/// The probe is preceded by a blank separator line, so blank lines are held
/// back until the next line shows they were real output.
fn probe_filter(inner: LogHandler) -> LogHandler {
    let held: Arc<Mutex<Option<LogLine>>> = Arc::new(Mutex::new(None));
    Arc::new(move |line: LogLine| {
        if line.stream != LogStream::Stdout {
            inner(line);
            return;
        }

        let previous = held.lock().take();
        let visible = filter_probe_line(&line.message).map(str::to_string);
        match visible {
            None => {}
            Some(text) if text.is_empty() && line.message.is_empty() => {
                if let Some(previous) = previous {
                    inner(previous);
                }
                *held.lock() = Some(line);
            }
            Some(text) => {
                if let Some(previous) = previous {
                    inner(previous);
                }
                inner(LogLine {
                    message: text,
                    ..line
                });
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::PWD_SENTINEL;
    use chrono::Utc;

    fn line(message: &str) -> LogLine {
        LogLine {
            timestamp: Utc::now(),
            stream: LogStream::Stdout,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_probe_filter_hides_probe_and_separator() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = probe_filter(Arc::new(move |l: LogLine| sink.lock().push(l.message)));

        handler(line("a"));
        handler(line(""));
        handler(line("b"));
        handler(line(""));
        handler(line(&format!("{}/workspace", PWD_SENTINEL)));

        assert_eq!(*seen.lock(), vec!["a", "", "b"]);
    }

    #[test]
    fn test_push_output_joins_lines() {
        let mut buffer = String::new();
        push_output(&mut buffer, "one");
        push_output(&mut buffer, "");
        push_output(&mut buffer, "two\n");
        assert_eq!(buffer, "one\ntwo\n");
    }

    #[test]
    fn test_request_builder() {
        let request = CommandRequest::new("t1", "ls").cwd("src");
        assert_eq!(request.cwd.as_deref(), Some("src"));
    }
}
