//! Process Bridge: runs `droid exec` and folds its stream into an answer.
//!
//! A producer task reads stdout into a channel one line at a time; the
//! consumer folds a `Stream<Item = String>` so tests can feed it directly.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

use super::events::{extract_final_text, parse_line, ToolEvent};
use super::registry::ProcessRegistry;
use super::{RunOutcome, RunRequest, StatusTarget, ToolRunner};
use crate::error::{Error, Result};
use crate::session::AutonomyLevel;

/// Number of tool calls shown in the live status.
const STATUS_WINDOW: usize = 5;

/// Output lines retained for last-resort answer recovery.
const RETAINED_LINES: usize = 2000;

/// Time a cancelled process gets to exit after SIGTERM.
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Prefixed to the first message of a new session.
pub const SESSION_PREAMBLE: &str = "You are being driven remotely from a Telegram chat. \
The operator only sees your final message, so end with a short summary of what you did \
and which files you changed.\n\n";

pub struct DroidBridge {
    cli_path: String,
    registry: Arc<ProcessRegistry>,
}

impl DroidBridge {
    pub fn new(cli_path: impl Into<String>, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            cli_path: cli_path.into(),
            registry,
        }
    }

    pub fn cli_path(&self) -> &str {
        &self.cli_path
    }
}

fn selected_model_arg(model: Option<&str>) -> Option<String> {
    model
        .map(str::trim)
        .filter(|m| !m.is_empty() && *m != "default")
        .map(ToString::to_string)
}

fn autonomy_args(level: AutonomyLevel) -> &'static [&'static str] {
    match level {
        AutonomyLevel::Off => &[],
        AutonomyLevel::Low => &["--auto", "low"],
        AutonomyLevel::Medium => &["--auto", "medium"],
        AutonomyLevel::High => &["--auto", "high"],
        AutonomyLevel::Unsafe => &["--auto", "high", "--skip-permissions-unsafe"],
    }
}

/// Arguments after the executable: `exec [--auto L] [-m M] --output-format
/// stream-json [-s ID] TASK`.
pub fn build_args(request: &RunRequest) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    args.extend(autonomy_args(request.autonomy).iter().map(|s| s.to_string()));
    if let Some(model) = selected_model_arg(request.model.as_deref()) {
        args.push("-m".to_string());
        args.push(model);
    }
    args.push("--output-format".to_string());
    args.push("stream-json".to_string());
    match &request.continuation_id {
        Some(id) => {
            args.push("-s".to_string());
            args.push(id.clone());
            args.push(request.task.clone());
        }
        None => args.push(format!("{}{}", SESSION_PREAMBLE, request.task)),
    }
    args
}

/// Running state folded from the event stream.
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    answer: String,
    session_id: Option<String>,
    errored: bool,
    tools: VecDeque<String>,
    last_status: Option<String>,
    /// Lines that produced no event.
    unconsumed: Vec<String>,
    retained: VecDeque<String>,
}

impl StreamState {
    /// Fold one line; returns the status text to push when it changed.
    pub(crate) fn apply(&mut self, line: String, header: Option<&str>) -> Option<String> {
        tracing::debug!("droid: {}", line.chars().take(150).collect::<String>());

        let mut push = None;
        match parse_line(&line) {
            Some(event @ ToolEvent::ToolCall { .. }) => {
                self.tools.push_back(event.status_line().unwrap_or_default());
                while self.tools.len() > STATUS_WINDOW {
                    self.tools.pop_front();
                }
                if let Some(header) = header {
                    let tools: Vec<&str> = self.tools.iter().map(String::as_str).collect();
                    let rendered = format!("{}\n\n{}", header, tools.join("\n"));
                    if self.last_status.as_deref() != Some(rendered.as_str()) {
                        self.last_status = Some(rendered.clone());
                        push = Some(rendered);
                    }
                }
            }
            Some(ToolEvent::Completion { text, session_id }) => {
                if !text.is_empty() {
                    self.answer = text;
                    self.errored = false;
                }
                if session_id.is_some() {
                    self.session_id = session_id;
                }
            }
            Some(ToolEvent::TextChunk { text }) => self.answer.push_str(&text),
            Some(ToolEvent::Error { message }) => {
                self.answer = format!("Error: {}", message);
                self.errored = true;
            }
            None => self.unconsumed.push(line.clone()),
        }

        self.retained.push_back(line);
        if self.retained.len() > RETAINED_LINES {
            self.retained.pop_front();
        }
        push
    }

    /// Resolve the answer once stdout has closed.
    ///
    /// Without a captured answer: the first extractable `finalText` among
    /// lines that produced no event, then stderr, then the last extractable
    /// `finalText` anywhere in the retained output.
    pub(crate) fn finish(mut self, stderr: &str) -> RunOutcome {
        if self.answer.trim().is_empty() {
            if let Some(text) = self.unconsumed.iter().find_map(|l| extract_final_text(l)).filter(|t| !t.is_empty()) {
                self.answer = text;
            } else if !stderr.trim().is_empty() {
                self.answer = stderr.trim().to_string();
                self.errored = true;
            } else if let Some(text) = self
                .retained
                .iter()
                .rev()
                .find_map(|l| extract_final_text(l))
                .filter(|t| !t.is_empty())
            {
                self.answer = text;
            }
        }

        RunOutcome {
            final_text: self.answer.trim().to_string(),
            session_id: self.session_id,
            errored: self.errored,
        }
    }
}

/// Fold every line of `lines` into `state`, pushing status updates to
/// `status` as they change. Push failures are logged and otherwise ignored.
pub(crate) async fn drain_lines<S>(lines: S, state: &mut StreamState, status: Option<&StatusTarget>)
where
    S: Stream<Item = String>,
{
    tokio::pin!(lines);
    let header = status.map(|s| s.header.as_str());
    while let Some(line) = lines.next().await {
        let Some(text) = state.apply(line, header) else {
            continue;
        };
        if let Some(status) = status {
            if let Err(e) = status.sink.edit_message(status.message, &text).await {
                tracing::debug!("Status update skipped: {}", e);
            }
        }
    }
}

/// Producer: forward each non-empty line of `reader`, decoded lossily.
async fn pump_lines<R>(reader: R, tx: mpsc::Sender<String>)
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
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Reading droid output failed: {}", e);
                break;
            }
        }
    }
}

async fn read_all<R>(reader: Option<R>) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        tracing::warn!("Reading droid stderr failed: {}", e);
    }
    String::from_utf8_lossy(&buf).to_string()
}

/// SIGTERM, a short grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child has not been reaped yet, so the pid is still ours.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
            return;
        }
        tracing::warn!("droid (pid {}) ignored SIGTERM, killing", pid);
    }
    if let Err(e) = child.kill().await {
        tracing::warn!("Failed to kill droid: {}", e);
    }
}

#[async_trait]
impl ToolRunner for DroidBridge {
    async fn run(&self, request: RunRequest) -> Result<RunOutcome> {
        let args = build_args(&request);
        tracing::info!(
            "Running droid in {} ({}, autonomy {})",
            request.cwd.display(),
            request
                .continuation_id
                .as_deref()
                .map(|id| format!("continuing {}", id))
                .unwrap_or_else(|| "new session".to_string()),
            request.autonomy
        );

        let mut child = Command::new(&self.cli_path)
            .args(&args)
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Tool(format!("failed to start {}: {}", self.cli_path, e)))?;

        let registration = self.registry.register(
            request.key,
            child.id(),
            request.status.as_ref().map(|s| s.message),
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Tool("stdout was not captured".to_string()))?;
        let stderr_task = tokio::spawn(read_all(child.stderr.take()));

        let (tx, rx) = mpsc::channel(64);
        let producer = tokio::spawn(pump_lines(stdout, tx));

        let mut state = StreamState::default();
        let cancelled = {
            let drain = drain_lines(ReceiverStream::new(rx), &mut state, request.status.as_ref());
            tokio::pin!(drain);
            let cancelled = tokio::select! {
                _ = &mut drain => false,
                _ = registration.cancelled() => true,
            };
            if cancelled {
                terminate(&mut child).await;
                // stdout closes once the process is gone; keep what it wrote.
                (&mut drain).await;
            }
            cancelled
        };

        let _ = producer.await;
        let stderr = stderr_task.await.unwrap_or_default();
        if !stderr.trim().is_empty() {
            tracing::warn!("droid stderr: {}", stderr.chars().take(500).collect::<String>());
        }
        match child.wait().await {
            Ok(status) => tracing::debug!("droid exited with {}", status),
            Err(e) => tracing::warn!("Waiting for droid failed: {}", e),
        }
        drop(registration);

        let mut outcome = state.finish(&stderr);
        if cancelled {
            tracing::info!("droid run cancelled");
            if outcome.final_text.is_empty() {
                outcome.final_text = "Stopped.".to_string();
            }
        }
        Ok(outcome)
    }

    async fn version(&self) -> Option<String> {
        let output = tokio::time::timeout(
            Duration::from_secs(10),
            Command::new(&self.cli_path)
                .arg("--version")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .ok()?
        .ok()?;
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if version.is_empty() {
            None
        } else {
            Some(version)
        }
    }
}
