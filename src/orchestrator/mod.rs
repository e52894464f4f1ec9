//! Orchestrator: inbound message -> session resolve -> droid run -> commit ->
//! reply.
//!
//! One instance owns every piece of process-wide state (session directory,
//! process registry, task queue, pending permission prompts) and is shared by
//! reference with the transport's handlers.

pub mod commands;
pub mod tasks;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::{display_path, Settings};
use crate::droid::{ProcessRegistry, RunKey, RunOutcome, RunRequest, StatusTarget, ToolRunner};
use crate::error::{Error, Result};
use crate::git;
use crate::queue::TaskQueue;
use crate::session::{
    AutonomyLevel, SessionDefaults, SessionDescriptor, SessionDirectory, SnapshotStore, UserId,
};
use crate::sink::{post_formatted, Button, ChatSink, MessageRef, PostOptions};

pub use commands::{parse_command, Command, BOT_COMMANDS};

const NO_RESPONSE: &str = "No response from Droid";
const TRUNCATED_SUFFIX: &str = "\n\n[Response truncated]";
const UNAUTHORIZED_REPLY: &str = "⛔ Unauthorized. Contact the bot administrator.";

/// A text message from the chat transport.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub chat_id: i64,
    pub message_id: i32,
    pub user_id: UserId,
    pub text: String,
    /// Id of the message this one replies to, in the same chat.
    pub reply_to: Option<i32>,
}

impl Inbound {
    fn reply_target(&self) -> Option<MessageRef> {
        self.reply_to.map(|id| MessageRef::new(self.chat_id, id))
    }
}

/// An inline button press.
#[derive(Debug, Clone)]
pub struct ButtonPress {
    pub chat_id: i64,
    /// The message carrying the button.
    pub message_id: i32,
    pub user_id: UserId,
    pub data: String,
}

/// A run parked until the operator allows elevated permissions.
#[derive(Debug, Clone)]
struct PendingPermission {
    task: String,
    descriptor: SessionDescriptor,
    user_id: UserId,
    chat_id: i64,
    original_message: i32,
}

/// Everything one exchange needs.
struct Exchange {
    key: RunKey,
    user: UserId,
    chat_id: i64,
    reply_to: Option<i32>,
    task: String,
    descriptor: SessionDescriptor,
    autonomy: AutonomyLevel,
    status: MessageRef,
    /// Extra messages linked to the resulting session (e.g. a `/new` header).
    extra_links: Vec<MessageRef>,
    /// Make the resulting session the user's active one.
    update_active: bool,
    allow_escalation: bool,
}

enum ExchangeResult {
    Replied { reply: MessageRef, outcome: RunOutcome },
    PermissionRequested,
    Failed(String),
}

pub struct Orchestrator {
    settings: Settings,
    directory: Mutex<SessionDirectory>,
    store: SnapshotStore,
    registry: Arc<ProcessRegistry>,
    queue: Arc<TaskQueue>,
    runner: Arc<dyn ToolRunner>,
    sink: Arc<dyn ChatSink>,
    streaming: AtomicBool,
    permissions: Mutex<HashMap<String, PendingPermission>>,
    timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        store: SnapshotStore,
        registry: Arc<ProcessRegistry>,
        runner: Arc<dyn ToolRunner>,
        sink: Arc<dyn ChatSink>,
    ) -> Self {
        let defaults = SessionDefaults {
            cwd: settings.default_cwd(),
            autonomy: settings.droid.default_autonomy,
            model: settings.droid.default_model.clone(),
        };
        let directory = SessionDirectory::from_snapshot(store.load(), defaults);
        let queue = Arc::new(TaskQueue::new(
            Duration::from_secs(settings.queue.delay_secs),
            registry.clone(),
        ));
        let streaming = AtomicBool::new(settings.droid.streaming);
        let timeout = Duration::from_secs(settings.droid.request_timeout_secs);

        Self {
            settings,
            directory: Mutex::new(directory),
            store,
            registry,
            queue,
            runner,
            sink,
            streaming,
            permissions: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// Entry point for every inbound text message.
    pub async fn handle_message(self: &Arc<Self>, msg: Inbound) -> Result<()> {
        let command = parse_command(&msg.text);

        if !self.settings.is_authorized(msg.user_id) {
            tracing::warn!("Unauthorized access attempt from user {}", msg.user_id);
            if matches!(command, Some(Command::Start)) {
                self.reply(&msg, UNAUTHORIZED_REPLY).await?;
            }
            return Ok(());
        }

        tracing::info!(
            "Received message from {}: {}",
            msg.user_id,
            msg.text.chars().take(100).collect::<String>()
        );
        match command {
            Some(command) => self.handle_command(command, &msg).await,
            None => self.handle_task(&msg).await,
        }
    }

    /// A plain message: continue (or start) a session with it.
    async fn handle_task(self: &Arc<Self>, msg: &Inbound) -> Result<()> {
        let resolved = self
            .directory
            .lock()
            .await
            .resolve(msg.user_id, msg.reply_target());
        let continuing = resolved.is_continuation();
        let descriptor = resolved.descriptor;

        let mut status_text = format!(
            "{} in {}",
            if self.is_streaming() { "Working" } else { "Thinking" },
            display_path(&descriptor.cwd)
        );
        if continuing && descriptor.session_id.is_some() {
            status_text.push_str(&format!(" (session {})", descriptor.short_id()));
        }
        let status = self
            .sink
            .post_message(msg.chat_id, &status_text, PostOptions::plain().reply_to(msg.message_id))
            .await?;

        let autonomy = descriptor.autonomy;
        self.exchange(Exchange {
            key: RunKey::Direct(msg.user_id),
            user: msg.user_id,
            chat_id: msg.chat_id,
            reply_to: Some(msg.message_id),
            task: msg.text.clone(),
            descriptor,
            autonomy,
            status,
            extra_links: Vec::new(),
            update_active: true,
            allow_escalation: true,
        })
        .await;
        Ok(())
    }

    /// Run droid for one exchange and deliver the answer.
    ///
    /// Failures to run at all (timeout, spawn error) replace the status
    /// message with the error and leave the directory untouched.
    async fn exchange(&self, ex: Exchange) -> ExchangeResult {
        let cwd = ex.descriptor.cwd.clone();

        if ex.descriptor.git_sync_pull {
            if let Err(e) = git::pull(&cwd).await {
                tracing::warn!("Git pull before run failed: {}", e);
                self.notify(ex.chat_id, &format!("⚠️ {}", e), ex.reply_to).await;
            }
        }

        let continuation_id = ex.descriptor.continuation_id().map(str::to_string);
        let status_target = self.is_streaming().then(|| StatusTarget {
            sink: self.sink.clone(),
            message: ex.status,
            header: if continuation_id.is_some() {
                "Working... (continuing)".to_string()
            } else {
                "Working...".to_string()
            },
        });
        let request = RunRequest {
            key: ex.key,
            task: ex.task.clone(),
            continuation_id,
            cwd: cwd.clone(),
            autonomy: ex.autonomy,
            model: ex.descriptor.model.clone(),
            status: status_target,
        };

        let outcome = match tokio::time::timeout(self.timeout, self.runner.run(request)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return self.fail_exchange(ex.status, e).await,
            Err(_) => {
                return self
                    .fail_exchange(ex.status, Error::Timeout(self.timeout.as_secs()))
                    .await
            }
        };

        if ex.allow_escalation && needs_permission(&outcome.final_text) {
            self.delete_quietly(ex.status).await;
            let mut descriptor = ex.descriptor.clone();
            if outcome.session_id.is_some() {
                descriptor.session_id = outcome.session_id.clone();
            }
            return match self
                .request_permission(PendingPermission {
                    task: ex.task.clone(),
                    descriptor,
                    user_id: ex.user,
                    chat_id: ex.chat_id,
                    original_message: ex.reply_to.unwrap_or(ex.status.message_id),
                })
                .await
            {
                Ok(()) => ExchangeResult::PermissionRequested,
                Err(e) => ExchangeResult::Failed(e.to_string()),
            };
        }

        // The placeholder is exempt from the reply limit.
        let answer = if outcome.final_text.trim().is_empty() {
            NO_RESPONSE.to_string()
        } else {
            truncate_reply(&outcome.final_text, self.settings.max_reply_chars)
        };
        self.delete_quietly(ex.status).await;
        let reply = match post_formatted(self.sink.as_ref(), ex.chat_id, &answer, ex.reply_to).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("Failed to deliver reply: {}", e);
                return ExchangeResult::Failed(e.to_string());
            }
        };

        {
            let mut directory = self.directory.lock().await;
            let seed = Some(ex.task.as_str());
            let (linked, _) = directory.record(reply, outcome.session_id.clone(), &cwd, &ex.descriptor, seed);
            for extra in &ex.extra_links {
                directory.link_message(*extra, linked.clone());
            }
            if ex.update_active {
                directory.set_active(ex.user, linked, Some(reply));
            }
        }
        self.persist().await;
        tracing::info!("Response sent ({} chars)", answer.len());

        if ex.descriptor.git_sync_push {
            match git::commit_and_push(&cwd, &ex.task).await {
                Ok(summary) => self.notify(ex.chat_id, &format!("📤 {}", summary), Some(reply.message_id)).await,
                Err(e) => {
                    tracing::warn!("Git sync after run failed: {}", e);
                    self.notify(ex.chat_id, &format!("⚠️ {}", e), Some(reply.message_id)).await;
                }
            }
        }

        ExchangeResult::Replied { reply, outcome }
    }

    async fn fail_exchange(&self, status: MessageRef, error: Error) -> ExchangeResult {
        tracing::error!("Droid run failed: {}", error);
        let text = match &error {
            Error::Timeout(_) => error.to_string(),
            _ => format!("Error: {}", error),
        };
        if let Err(e) = self.sink.edit_message(status, &text).await {
            tracing::warn!("Failed to report run failure: {}", e);
        }
        ExchangeResult::Failed(text)
    }

    async fn request_permission(&self, pending: PendingPermission) -> Result<()> {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let chat_id = pending.chat_id;
        let reply_to = pending.original_message;
        self.permissions.lock().await.insert(id.clone(), pending);

        let buttons = vec![vec![
            Button::new("✓ Allow", format!("perm_allow_{}", id)),
            Button::new("✗ Deny", format!("perm_deny_{}", id)),
        ]];
        self.sink
            .post_message(
                chat_id,
                "⚠️ Droid needs elevated permissions to proceed.\n\nThis action requires the --skip-permissions-unsafe flag.",
                PostOptions::plain().reply_to(reply_to).with_buttons(buttons),
            )
            .await?;
        tracing::info!("Permission request {} posted", id);
        Ok(())
    }

    /// Entry point for inline button presses.
    pub async fn handle_button(self: &Arc<Self>, press: ButtonPress) -> Result<()> {
        if !self.settings.is_authorized(press.user_id) {
            tracing::warn!("Unauthorized button press from user {}", press.user_id);
            return Ok(());
        }
        let prompt = MessageRef::new(press.chat_id, press.message_id);

        let (allow, id) = if let Some(id) = press.data.strip_prefix("perm_allow_") {
            (true, id)
        } else if let Some(id) = press.data.strip_prefix("perm_deny_") {
            (false, id)
        } else {
            tracing::debug!("Ignoring unknown button data: {}", press.data);
            return Ok(());
        };

        let Some(pending) = self.permissions.lock().await.remove(id) else {
            self.sink.edit_message(prompt, "Permission request expired.").await?;
            return Ok(());
        };

        if !allow {
            self.sink.edit_message(prompt, "Action denied.").await?;
            return Ok(());
        }

        self.sink
            .edit_message(prompt, "✓ Allowed. Running with elevated permissions...")
            .await?;
        let status = self
            .sink
            .post_message(pending.chat_id, "Working (unsafe mode)...", PostOptions::plain())
            .await?;

        self.exchange(Exchange {
            key: RunKey::Direct(pending.user_id),
            user: pending.user_id,
            chat_id: pending.chat_id,
            reply_to: Some(pending.original_message),
            task: pending.task,
            descriptor: pending.descriptor,
            autonomy: AutonomyLevel::Unsafe,
            status,
            extra_links: Vec::new(),
            update_active: true,
            allow_escalation: false,
        })
        .await;
        Ok(())
    }

    /// Write the directory snapshot; failures are logged and state keeps
    /// serving from memory.
    async fn persist(&self) {
        let snapshot = self.directory.lock().await.snapshot();
        if let Err(e) = self.store.save(&snapshot) {
            tracing::error!("Failed to save sessions: {}", e);
        }
    }

    async fn reply(&self, msg: &Inbound, text: &str) -> Result<MessageRef> {
        self.sink
            .post_message(msg.chat_id, text, PostOptions::plain().reply_to(msg.message_id))
            .await
    }

    async fn reply_html(&self, msg: &Inbound, html: &str) -> Result<MessageRef> {
        self.sink
            .post_message(msg.chat_id, html, PostOptions::html().reply_to(msg.message_id))
            .await
    }

    /// Informational message; delivery failures are only logged.
    async fn notify(&self, chat_id: i64, text: &str, reply_to: Option<i32>) {
        let mut options = PostOptions::plain();
        options.reply_to = reply_to;
        if let Err(e) = self.sink.post_message(chat_id, text, options).await {
            tracing::warn!("Failed to post notice: {}", e);
        }
    }

    async fn delete_quietly(&self, message: MessageRef) {
        if let Err(e) = self.sink.delete_message(message).await {
            tracing::debug!("Could not delete status message: {}", e);
        }
    }

    async fn active_cwd(&self, user: UserId) -> PathBuf {
        let directory = self.directory.lock().await;
        directory
            .active(user)
            .map(|a| a.session.cwd.clone())
            .unwrap_or_else(|| directory.defaults().cwd.clone())
    }
}

/// Whether an answer asks for `--skip-permissions-unsafe`.
pub fn needs_permission(answer: &str) -> bool {
    let lower = answer.to_lowercase();
    lower.contains("insufficient permission") || lower.contains("skip-permissions-unsafe")
}

/// Cut an answer to `limit` characters with a marker.
pub fn truncate_reply(answer: &str, limit: usize) -> String {
    if answer.chars().count() > limit {
        format!("{}{}", answer.chars().take(limit).collect::<String>(), TRUNCATED_SUFFIX)
    } else {
        answer.to_string()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::session::SnapshotStore;
    use crate::sink::testing::SinkEvent;
    use crate::sink::TextFormat;
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn replies(h: &Harness) -> Vec<(MessageRef, String)> {
        h.sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Posted {
                    message,
                    text,
                    format: TextFormat::Html,
                    ..
                } => Some((message, text)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn first_message_starts_a_session_and_reply_continues_it() {
        let h = Harness::new();
        h.runner.push("**done**", Some("sess-1"));
        h.runner.push("second", Some("sess-1"));

        h.send(1, "fix the build", None).await;
        let (reply, text) = replies(&h)[0].clone();
        assert_eq!(text, "<b>done</b>");

        h.send(2, "and the tests", Some(reply.message_id)).await;

        let requests = h.runner.requests();
        assert_eq!(requests[0].continuation_id, None);
        assert_eq!(requests[0].key, RunKey::Direct(OPERATOR));
        assert_eq!(requests[1].continuation_id.as_deref(), Some("sess-1"));

        let snapshot = SnapshotStore::new(h.snapshot_file()).load();
        assert_eq!(snapshot.session_history.len(), 1);
        assert_eq!(snapshot.session_history[0].first_message.as_deref(), Some("fix the build"));
        assert_eq!(snapshot.sessions.len(), 2);
    }

    #[tokio::test]
    async fn reply_to_an_older_thread_wins_over_active_session() {
        let h = Harness::new();
        h.runner.push("a", Some("thread-a"));
        h.runner.push("b", Some("thread-b"));
        h.runner.push("a again", Some("thread-a"));

        h.send(1, "first", None).await;
        let reply_a = replies(&h)[0].0;
        h.orchestrator
            .handle_message(Inbound {
                text: "/new".to_string(),
                ..h.message(2, "", None)
            })
            .await
            .unwrap();
        h.send(3, "second thread", None).await;
        h.send(4, "back to a", Some(reply_a.message_id)).await;

        let requests = h.runner.requests();
        assert_eq!(requests[1].continuation_id, None);
        assert_eq!(requests[2].continuation_id.as_deref(), Some("thread-a"));
    }

    #[tokio::test]
    async fn status_message_is_replaced_by_the_answer() {
        let h = Harness::new();
        h.runner.push("ok", Some("s"));
        h.send(1, "hi", None).await;

        let events = h.sink.events();
        let SinkEvent::Posted { message: status, text, .. } = &events[0] else {
            panic!("status first");
        };
        assert!(text.starts_with("Working in "));
        assert!(events.contains(&SinkEvent::Deleted { message: *status }));
        assert!(h.runner.requests()[0].status.is_some());
    }

    #[tokio::test]
    async fn continuation_status_names_the_session() {
        let h = Harness::new();
        h.runner.push("first", Some("abcdef1234567890"));
        h.runner.push("second", Some("abcdef1234567890"));

        h.send(1, "start", None).await;
        assert!(!h.sink.posted_texts()[0].contains("(session"));
        let reply = replies(&h)[0].0;
        h.send(2, "go on", Some(reply.message_id)).await;

        assert!(h
            .sink
            .posted_texts()
            .iter()
            .any(|t| t.starts_with("Working in ") && t.ends_with("(session abcdef12)")));
    }

    #[tokio::test]
    async fn streaming_off_sends_no_status_target() {
        let h = Harness::with_settings(|s| s.droid.streaming = false);
        h.runner.push("ok", None);
        h.send(1, "hi", None).await;
        assert!(h.runner.requests()[0].status.is_none());
        assert!(h.sink.posted_texts()[0].starts_with("Thinking in "));
    }

    #[tokio::test]
    async fn empty_answer_and_truncation() {
        let h = Harness::with_settings(|s| s.max_reply_chars = 10);
        h.runner.push("", None);
        h.runner.push(&"y".repeat(25), None);

        h.send(1, "one", None).await;
        h.send(2, "two", None).await;

        let texts: Vec<String> = replies(&h).into_iter().map(|(_, t)| t).collect();
        assert_eq!(texts[0], NO_RESPONSE);
        assert_eq!(texts[1], format!("{}{}", "y".repeat(10), TRUNCATED_SUFFIX));
    }

    #[tokio::test]
    async fn runner_failure_leaves_state_untouched() {
        let h = Harness::new();
        h.runner.push_result(Err(Error::Tool("failed to start droid".to_string())));
        h.send(1, "hi", None).await;

        assert!(h
            .sink
            .edited_texts()
            .iter()
            .any(|t| t == "Error: Droid error: failed to start droid"));
        assert!(replies(&h).is_empty());
        assert!(!h.snapshot_file().exists());
    }

    #[tokio::test]
    async fn timeout_is_reported_without_commit() {
        let h = Harness::with_settings(|s| s.droid.request_timeout_secs = 0);
        *h.runner.delay.lock().unwrap() = Duration::from_millis(200);
        h.runner.push("late", Some("s"));
        h.send(1, "slow", None).await;

        assert_eq!(h.sink.edited_texts(), vec!["Request timed out (0s limit)".to_string()]);
        assert!(!h.snapshot_file().exists());
    }

    #[tokio::test]
    async fn unauthorized_users_are_dropped_or_refused() {
        let h = Harness::new();
        let stranger = |text: &str| Inbound {
            chat_id: CHAT,
            message_id: 1,
            user_id: 999,
            text: text.to_string(),
            reply_to: None,
        };

        h.orchestrator.handle_message(stranger("do things")).await.unwrap();
        assert!(h.sink.events().is_empty());
        assert!(h.runner.requests().is_empty());

        h.orchestrator.handle_message(stranger("/start")).await.unwrap();
        assert_eq!(h.sink.posted_texts(), vec![UNAUTHORIZED_REPLY.to_string()]);
    }

    #[tokio::test]
    async fn permission_prompt_then_allow_reruns_unsafe() {
        let h = Harness::new();
        h.runner.push("Error: insufficient permission to run rm", Some("sess-p"));
        h.runner.push("removed", Some("sess-p"));

        h.send(1, "clean tmp", None).await;
        let prompt = h
            .sink
            .events()
            .into_iter()
            .find_map(|e| match e {
                SinkEvent::Posted { message, buttons, .. } if !buttons.is_empty() => Some((message, buttons)),
                _ => None,
            })
            .expect("permission prompt");
        let allow = prompt.1[0][0].data.clone();
        assert!(allow.starts_with("perm_allow_"));

        h.orchestrator
            .handle_button(ButtonPress {
                chat_id: CHAT,
                message_id: prompt.0.message_id,
                user_id: OPERATOR,
                data: allow.clone(),
            })
            .await
            .unwrap();

        let requests = h.runner.requests();
        assert_eq!(requests[1].autonomy, AutonomyLevel::Unsafe);
        assert_eq!(requests[1].continuation_id.as_deref(), Some("sess-p"));
        assert_eq!(replies(&h).last().unwrap().1, "removed");

        // A second press on the same prompt is stale.
        h.orchestrator
            .handle_button(ButtonPress {
                chat_id: CHAT,
                message_id: prompt.0.message_id,
                user_id: OPERATOR,
                data: allow,
            })
            .await
            .unwrap();
        assert_eq!(h.sink.edited_texts().last().unwrap(), "Permission request expired.");
    }

    #[tokio::test]
    async fn deny_edits_the_prompt() {
        let h = Harness::new();
        h.runner.push("needs --skip-permissions-unsafe", None);
        h.send(1, "do it", None).await;
        let (prompt, deny) = h
            .sink
            .events()
            .into_iter()
            .find_map(|e| match e {
                SinkEvent::Posted { message, buttons, .. } if !buttons.is_empty() => {
                    Some((message, buttons[0][1].data.clone()))
                }
                _ => None,
            })
            .unwrap();

        h.orchestrator
            .handle_button(ButtonPress {
                chat_id: CHAT,
                message_id: prompt.message_id,
                user_id: OPERATOR,
                data: deny,
            })
            .await
            .unwrap();
        assert_eq!(h.sink.edited_texts().last().unwrap(), "Action denied.");
        assert_eq!(h.runner.requests().len(), 1);
    }

    #[tokio::test]
    async fn html_rejection_falls_back_to_plain_reply() {
        let h = Harness::new();
        h.sink.reject_html.store(true, AtomicOrdering::SeqCst);
        h.runner.push("**ok**", Some("s"));
        h.send(1, "hi", None).await;

        assert_eq!(h.sink.posted_texts().last().unwrap(), "**ok**");
        let snapshot = SnapshotStore::new(h.snapshot_file()).load();
        assert_eq!(snapshot.sessions.len(), 1);
    }

    #[test]
    fn permission_detection_and_truncation() {
        assert!(needs_permission("Insufficient Permission for Execute"));
        assert!(needs_permission("rerun with --skip-permissions-unsafe"));
        assert!(!needs_permission("all good"));
        assert_eq!(truncate_reply("short", 10), "short");
    }
}
