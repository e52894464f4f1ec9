//! Chat commands.

use std::sync::Arc;

use crate::config::{display_path, resolve_directory};
use crate::droid::{RunKey, StopOutcome};
use crate::error::{Error, Result};
use crate::git;
use crate::markdown::escape_html;
use crate::session::{synthesize_session_id, AutonomyLevel, GitSync, SessionDescriptor};

use super::{Exchange, ExchangeResult, Inbound, Orchestrator};

/// Commands registered with the chat client's command menu.
pub const BOT_COMMANDS: &[(&str, &str)] = &[
    ("new", "New session (optional directory or prompt)"),
    ("session", "List or switch sessions"),
    ("cwd", "Show working directory"),
    ("stream", "Toggle live tool updates"),
    ("status", "Bot and Droid status"),
    ("git", "Quick git commands"),
    ("stop", "Stop the running request"),
    ("auto", "Show or set autonomy level"),
    ("model", "Show or set model"),
    ("sync", "Show or set git sync"),
    ("project", "List or open projects"),
    ("queue", "Task queue"),
    ("help", "Show help"),
];

const GIT_OUTPUT_LIMIT: usize = 3500;
const SESSION_LIST_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    New(String),
    Cwd,
    Stream,
    Status,
    Session(String),
    Git(String),
    Stop,
    Auto(String),
    Model(String),
    Sync(String),
    Project(String),
    Queue(String),
    Unknown(String),
}

/// Parse `/name[@bot] args`; `None` for plain text.
pub fn parse_command(text: &str) -> Option<Command> {
    let text = text.trim();
    let rest = text.strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim().to_string()),
        None => (rest, String::new()),
    };
    let name = head.split('@').next().unwrap_or(head).to_lowercase();

    Some(match name.as_str() {
        "start" => Command::Start,
        "help" => Command::Help,
        "new" => Command::New(args),
        "cwd" => Command::Cwd,
        "stream" => Command::Stream,
        "status" => Command::Status,
        "session" | "sessions" => Command::Session(args),
        "git" => Command::Git(args),
        "stop" => Command::Stop,
        "auto" => Command::Auto(args),
        "model" => Command::Model(args),
        "sync" => Command::Sync(args),
        "project" | "projects" => Command::Project(args),
        "queue" => Command::Queue(args),
        _ => Command::Unknown(name),
    })
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "ON"
    } else {
        "OFF"
    }
}

impl Orchestrator {
    pub(super) async fn handle_command(self: &Arc<Self>, command: Command, msg: &Inbound) -> Result<()> {
        tracing::debug!("Command {:?} from {}", command, msg.user_id);
        match command {
            Command::Start => self.cmd_start(msg).await,
            Command::Help => self.cmd_help(msg).await,
            Command::New(args) => self.cmd_new(msg, &args).await,
            Command::Cwd => self.cmd_cwd(msg).await,
            Command::Stream => self.cmd_stream(msg).await,
            Command::Status => self.cmd_status(msg).await,
            Command::Session(args) => self.cmd_session(msg, &args).await,
            Command::Git(args) => self.cmd_git(msg, &args).await,
            Command::Stop => self.cmd_stop(msg).await,
            Command::Auto(args) => self.cmd_auto(msg, &args).await,
            Command::Model(args) => self.cmd_model(msg, &args).await,
            Command::Sync(args) => self.cmd_sync(msg, &args).await,
            Command::Project(args) => self.cmd_project(msg, &args).await,
            Command::Queue(args) => self.cmd_queue(msg, &args).await,
            Command::Unknown(name) => {
                self.reply(msg, &format!("Unknown command: /{}. Send /help for available commands.", name))
                    .await?;
                Ok(())
            }
        }
    }

    async fn cmd_start(&self, msg: &Inbound) -> Result<()> {
        let text = format!(
            "🤖 Droid Telegram Bot ready!\n\n\
             Commands:\n\
             /new <path> - Start new session in directory\n\
             /cwd - Show working directory\n\
             /stream - Toggle live updates (currently: {})\n\
             /session - List/switch sessions\n\
             /status - Check bot status\n\
             /help - Show detailed help\n\n\
             💡 Reply to any message to continue that session",
            on_off(self.is_streaming())
        );
        self.reply(msg, &text).await?;
        Ok(())
    }

    async fn cmd_help(&self, msg: &Inbound) -> Result<()> {
        let timeout_min = self.settings.droid.request_timeout_secs / 60;
        let text = format!(
            "🤖 <b>Droid Telegram Bot Help</b>\n\n\
             This bot connects to Factory's Droid CLI.\n\n\
             <b>📝 Usage:</b>\n\
             • Send any message to interact with Droid\n\
             • Reply to a message to continue that session\n\
             • Use /new to start fresh in a directory\n\n\
             <b>⚙️ Commands:</b>\n\
             /new [path|prompt] - New session\n\
             /session [id] - List/switch sessions\n\
             /cwd - Show current working directory\n\
             /stream - Toggle live tool updates ({})\n\
             /status - Bot and Droid status\n\
             /git [cmd] - Quick git commands\n\
             /stop - Stop the running request\n\
             /auto [level] - Autonomy: off, low, medium, high, unsafe\n\
             /model [name|default] - Model for this session\n\
             /sync [off|pull|push|both] - Git sync around each request\n\
             /project [name] - List or open a project\n\
             /queue add|list|run|pause|resume|skip|clear - Task queue\n\n\
             <b>💡 Tips:</b>\n\
             • Live updates show which tools Droid uses\n\
             • Sessions persist across restarts\n\
             • Timeout is {} minutes per request",
            on_off(self.is_streaming()),
            timeout_min.max(1)
        );
        self.reply_html(msg, &text).await?;
        Ok(())
    }

    /// `/new [path | prompt]`.
    async fn cmd_new(self: &Arc<Self>, msg: &Inbound, arg: &str) -> Result<()> {
        let default_cwd = self.settings.default_cwd();
        let (cwd, prompt) = if arg.is_empty() {
            (default_cwd, None)
        } else {
            match resolve_directory(arg, &default_cwd) {
                Ok(dir) => (dir, None),
                Err(e) if arg.contains('/') || arg.contains('~') => {
                    self.reply(msg, &format!("❌ {}", e)).await?;
                    return Ok(());
                }
                Err(_) => (default_cwd, Some(arg.to_string())),
            }
        };

        // A local id up front, so settings chosen before the first reply stick.
        let session_id = synthesize_session_id("chat");
        let descriptor = {
            let directory = self.directory.lock().await;
            let mut d = directory.fresh_descriptor();
            d.cwd = cwd.clone();
            d.session_id = Some(session_id.clone());
            d
        };
        let short_cwd = display_path(&cwd);
        let temp_ref = crate::session::short_session_id(&session_id);
        let git_line = git::status(&cwd).await.line();
        let header = self
            .reply(msg, &format!("📂 {}\n🆔 Session: {}\n{}", short_cwd, temp_ref, git_line))
            .await?;

        let Some(prompt) = prompt else {
            let instruction = self
                .reply(msg, &format!("🆕 New session started in {}\n\nReply to continue.", short_cwd))
                .await?;
            {
                let mut directory = self.directory.lock().await;
                directory.link_message(header, descriptor.clone());
                directory.link_message(instruction, descriptor.clone());
                directory.set_active(msg.user_id, descriptor, Some(instruction));
            }
            self.persist().await;
            tracing::info!("New session prepared in {}", cwd.display());
            return Ok(());
        };

        let status = self
            .reply(msg, if self.is_streaming() { "Working..." } else { "Thinking..." })
            .await?;
        let autonomy = descriptor.autonomy;
        let result = self
            .exchange(Exchange {
                key: RunKey::Direct(msg.user_id),
                user: msg.user_id,
                chat_id: msg.chat_id,
                reply_to: Some(msg.message_id),
                task: prompt,
                descriptor,
                autonomy,
                status,
                extra_links: vec![header],
                update_active: true,
                allow_escalation: true,
            })
            .await;

        if let ExchangeResult::Replied { outcome, .. } = result {
            if let Some(id) = outcome.session_id {
                let text = format!("📂 {}\n🆔 Session: {}", short_cwd, crate::session::short_session_id(&id));
                if let Err(e) = self.sink.edit_message(header, &text).await {
                    tracing::debug!("Could not update session header: {}", e);
                }
                tracing::info!("New session started: {} in {}", id, cwd.display());
            }
        }
        Ok(())
    }

    async fn cmd_cwd(&self, msg: &Inbound) -> Result<()> {
        let cwd = self.active_cwd(msg.user_id).await;
        let git_line = git::status(&cwd).await.line();
        self.reply(
            msg,
            &format!(
                "📂 Current directory: {}\n{}\n\nUse /new <path> to change directory",
                display_path(&cwd),
                git_line
            ),
        )
        .await?;
        Ok(())
    }

    async fn cmd_stream(&self, msg: &Inbound) -> Result<()> {
        let enabled = !self.streaming.fetch_xor(true, std::sync::atomic::Ordering::SeqCst);
        tracing::info!("Live tool updates {}", on_off(enabled));
        self.reply(msg, &format!("Live tool updates: {}", on_off(enabled))).await?;
        Ok(())
    }

    async fn cmd_status(&self, msg: &Inbound) -> Result<()> {
        let version = self.runner.version().await.unwrap_or_else(|| "unknown".to_string());
        let (links, active) = {
            let directory = self.directory.lock().await;
            let active = directory.active(msg.user_id).map(|a| {
                let sid = a
                    .session
                    .session_id
                    .as_deref()
                    .map(crate::session::short_session_id)
                    .unwrap_or_else(|| "pending".to_string());
                format!(
                    "\n\nYour active session: {} in {} (autonomy {})",
                    sid,
                    display_path(&a.session.cwd),
                    directory.resolve(msg.user_id, None).descriptor.autonomy
                )
            });
            (directory.link_count(), active.unwrap_or_default())
        };
        let tasks = self.queue.list().await;
        let pending = tasks.iter().filter(|t| !t.status.is_finished()).count();
        let text = format!(
            "✅ Bot Status: Running\n\
             🤖 Droid: {}\n\
             ⚡ Live updates: {}\n\
             📊 Linked messages: {}\n\
             📋 Queue: {} ({} open){}",
            version,
            on_off(self.is_streaming()),
            links,
            self.queue.state().await,
            pending,
            active
        );
        self.reply(msg, &text).await?;
        Ok(())
    }

    /// `/session` lists recent sessions; `/session <prefix>` switches.
    async fn cmd_session(&self, msg: &Inbound, arg: &str) -> Result<()> {
        if let Some(prefix) = arg.split_whitespace().next() {
            let switched = self.directory.lock().await.switch_to(msg.user_id, prefix);
            match switched {
                Some(entry) => {
                    self.persist().await;
                    self.reply_html(
                        msg,
                        &format!(
                            "✓ Switched to session <code>{}</code>\n📂 {}",
                            escape_html(&crate::session::short_session_id(&entry.session_id)),
                            escape_html(&display_path(&entry.cwd))
                        ),
                    )
                    .await?;
                }
                None => {
                    self.reply(msg, &format!("Session not found: {}", prefix)).await?;
                }
            }
            return Ok(());
        }

        let (history, active_id) = {
            let directory = self.directory.lock().await;
            let history: Vec<_> = directory
                .history()
                .iter()
                .rev()
                .take(SESSION_LIST_LIMIT)
                .cloned()
                .collect();
            let active_id = directory
                .active(msg.user_id)
                .and_then(|_| directory.resolve(msg.user_id, None).descriptor.session_id);
            (history, active_id)
        };

        if history.is_empty() {
            self.reply(msg, "No sessions yet. Use /new to start one.").await?;
            return Ok(());
        }

        let mut lines = vec!["<b>Recent Sessions</b>\n".to_string()];
        for entry in &history {
            let current = if active_id.as_deref() == Some(entry.session_id.as_str()) {
                " ✓"
            } else {
                ""
            };
            let seed: String = entry
                .first_message
                .as_deref()
                .unwrap_or("N/A")
                .chars()
                .take(30)
                .collect();
            lines.push(format!(
                "<code>{}</code> {}{}\n  <i>{}</i>\n",
                escape_html(&crate::session::short_session_id(&entry.session_id)),
                escape_html(&display_path(&entry.cwd)),
                current,
                escape_html(&seed)
            ));
        }
        lines.push("\nUse <code>/session [id]</code> to switch".to_string());
        self.reply_html(msg, &lines.join("\n")).await?;
        Ok(())
    }

    async fn cmd_git(&self, msg: &Inbound, args: &str) -> Result<()> {
        let cwd = self.active_cwd(msg.user_id).await;
        let short_cwd = display_path(&cwd);

        let argv: Vec<String> = args.split_whitespace().map(str::to_string).collect();
        let Some(first) = argv.first() else {
            let git_line = git::status(&cwd).await.line();
            self.reply(
                msg,
                &format!(
                    "📂 {}\n{}\n\nUsage: /git <command>\nExamples: /git status, /git pull, /git log --oneline -5",
                    short_cwd, git_line
                ),
            )
            .await?;
            return Ok(());
        };

        let status = self.reply(msg, &format!("Running git {}...", first)).await?;
        let text = match git::run_git(argv.as_slice(), &cwd, git::COMMAND_TIMEOUT).await {
            Ok(output) => format!(
                "📂 {}\n<pre>$ git {}\n{}</pre>",
                escape_html(&short_cwd),
                escape_html(args),
                escape_html(&git::truncate_output(&output.text(), GIT_OUTPUT_LIMIT))
            ),
            Err(e) => escape_html(&e.to_string()),
        };

        self.sink.delete_message(status).await.ok();
        self.reply_html(msg, &text).await?;
        Ok(())
    }

    async fn cmd_stop(&self, msg: &Inbound) -> Result<()> {
        let key = RunKey::Direct(msg.user_id);
        let status = self.registry.status_message(key);
        let text = match self.registry.stop(key) {
            StopOutcome::Stopped => {
                if let Some(status) = status {
                    if let Err(e) = self.sink.edit_message(status, "⏹ Stopping...").await {
                        tracing::debug!("Could not update status message: {}", e);
                    }
                }
                "⏹ Stopping the running request..."
            }
            StopOutcome::NothingToStop => "Nothing to stop.",
        };
        self.reply(msg, text).await?;
        Ok(())
    }

    /// Effective settings of the active session. Creates nothing.
    async fn current_settings(&self, msg: &Inbound) -> SessionDescriptor {
        self.directory.lock().await.resolve(msg.user_id, None).descriptor
    }

    /// The id a settings change applies to, synthesizing one if needed.
    async fn settings_target(&self, msg: &Inbound) -> String {
        let mut directory = self.directory.lock().await;
        let id = directory.ensure_session_id(msg.user_id);
        directory.resolve(msg.user_id, None).descriptor.session_id.unwrap_or(id)
    }

    async fn cmd_auto(&self, msg: &Inbound, arg: &str) -> Result<()> {
        if arg.is_empty() {
            let descriptor = self.current_settings(msg).await;
            let options: Vec<&str> = AutonomyLevel::ALL.iter().map(|l| l.as_str()).collect();
            self.reply(
                msg,
                &format!("Autonomy: {}\nOptions: {}", descriptor.autonomy, options.join(", ")),
            )
            .await?;
            return Ok(());
        }

        match arg.parse::<AutonomyLevel>() {
            Ok(level) => {
                let id = self.settings_target(msg).await;
                self.directory.lock().await.set_autonomy(&id, level);
                self.persist().await;
                self.reply(
                    msg,
                    &format!("Autonomy for session {}: {}", crate::session::short_session_id(&id), level),
                )
                .await?;
            }
            Err(e) => {
                self.reply(msg, &e).await?;
            }
        }
        Ok(())
    }

    async fn cmd_model(&self, msg: &Inbound, arg: &str) -> Result<()> {
        if arg.is_empty() {
            let descriptor = self.current_settings(msg).await;
            let model = descriptor.model.as_deref().unwrap_or("default");
            self.reply(msg, &format!("Model: {}\nUse /model <name> or /model default", model))
                .await?;
            return Ok(());
        }

        let model = match arg {
            "default" => None,
            name => Some(name.to_string()),
        };
        let id = self.settings_target(msg).await;
        self.directory.lock().await.set_model(&id, model.clone());
        self.persist().await;
        self.reply(
            msg,
            &format!(
                "Model for session {}: {}",
                crate::session::short_session_id(&id),
                model.as_deref().unwrap_or("default")
            ),
        )
        .await?;
        Ok(())
    }

    async fn cmd_sync(&self, msg: &Inbound, arg: &str) -> Result<()> {
        if arg.is_empty() {
            let descriptor = self.current_settings(msg).await;
            self.reply(
                msg,
                &format!("Git sync: {}\nOptions: off, pull, push, both", descriptor.git_sync()),
            )
            .await?;
            return Ok(());
        }

        match arg.parse::<GitSync>() {
            Ok(sync) => {
                let id = self.settings_target(msg).await;
                self.directory.lock().await.set_git_sync(&id, sync);
                self.persist().await;
                self.reply(
                    msg,
                    &format!("Git sync for session {}: {}", crate::session::short_session_id(&id), sync),
                )
                .await?;
            }
            Err(e) => {
                self.reply(msg, &e).await?;
            }
        }
        Ok(())
    }

    /// `/project` lists projects; `/project <name>` opens a session there.
    async fn cmd_project(&self, msg: &Inbound, arg: &str) -> Result<()> {
        let Some(name) = arg.split_whitespace().next() else {
            if self.settings.projects.is_empty() {
                self.reply(msg, "No projects configured.").await?;
                return Ok(());
            }
            let mut lines = vec!["<b>Projects</b>\n".to_string()];
            for (name, project) in &self.settings.projects {
                lines.push(format!(
                    "<code>{}</code> → {}",
                    escape_html(name),
                    escape_html(&display_path(&project.path))
                ));
            }
            lines.push("\nUse <code>/project [name]</code> to open one".to_string());
            self.reply_html(msg, &lines.join("\n")).await?;
            return Ok(());
        };

        let Some(project) = self.settings.projects.get(name) else {
            self.reply(msg, &format!("Unknown project: {}", name)).await?;
            return Ok(());
        };
        if !project.path.is_dir() {
            let e = Error::DirectoryNotFound(project.path.display().to_string());
            self.reply(msg, &format!("❌ {}", e)).await?;
            return Ok(());
        }

        let session_id = synthesize_session_id("project");
        let descriptor = {
            let mut directory = self.directory.lock().await;
            let mut d = directory.fresh_descriptor();
            d.cwd = project.path.clone();
            d.session_id = Some(session_id.clone());
            if let Some(level) = project.autonomy {
                d.autonomy = level;
                directory.set_autonomy(&session_id, level);
            }
            if let Some(model) = &project.model {
                d.model = Some(model.clone());
                directory.set_model(&session_id, Some(model.clone()));
            }
            if project.git_sync {
                d.set_git_sync(GitSync::both());
                directory.set_git_sync(&session_id, GitSync::both());
            }
            d
        };

        let git_line = git::status(&project.path).await.line();
        let header = self
            .reply(
                msg,
                &format!(
                    "📁 Project {}\n📂 {}\n🆔 Session: {}\n{}\n\nReply to continue.",
                    name,
                    display_path(&project.path),
                    crate::session::short_session_id(&session_id),
                    git_line
                ),
            )
            .await?;
        {
            let mut directory = self.directory.lock().await;
            directory.link_message(header, descriptor.clone());
            directory.set_active(msg.user_id, descriptor, Some(header));
        }
        self.persist().await;
        tracing::info!("Project session {} opened for {}", session_id, name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::config::ProjectConfig;
    use crate::session::{is_local_session_id, SnapshotStore};
    use crate::sink::MessageRef;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/start"), Some(Command::Start));
        assert_eq!(parse_command("/new@droid_bot ~/code"), Some(Command::New("~/code".into())));
        assert_eq!(
            parse_command("/queue add api fix the tests"),
            Some(Command::Queue("add api fix the tests".into()))
        );
        assert_eq!(parse_command("/Status"), Some(Command::Status));
        assert_eq!(parse_command("/frobnicate"), Some(Command::Unknown("frobnicate".into())));
    }

    #[tokio::test]
    async fn new_with_missing_path_is_rejected() {
        let h = Harness::new();
        h.send(1, "/new /definitely/not/here", None).await;
        assert_eq!(
            h.sink.posted_texts(),
            vec!["❌ Directory not found: /definitely/not/here".to_string()]
        );
        assert!(!h.snapshot_file().exists());
    }

    #[tokio::test]
    async fn new_with_directory_links_header_and_instruction() {
        let h = Harness::new();
        let sub = h.dir.path().join("proj");
        std::fs::create_dir(&sub).unwrap();
        h.send(1, "/new proj", None).await;

        let snapshot = SnapshotStore::new(h.snapshot_file()).load();
        assert_eq!(snapshot.sessions.len(), 2);
        let active = &snapshot.active_session_per_user[&OPERATOR].session;
        assert_eq!(active.cwd, sub);
        let local = active.session_id.clone().unwrap();
        assert!(is_local_session_id(&local));
        assert!(snapshot
            .sessions
            .values()
            .all(|d| d.cwd == sub && d.session_id.as_deref() == Some(local.as_str())));

        // Replying to the header starts droid in that directory.
        h.runner.push("hi", Some("s-new"));
        let header = h.sink.last_posted().unwrap().message_id - 1;
        h.send(2, "look around", Some(header)).await;
        let request = &h.runner.requests()[0];
        assert_eq!(request.cwd, sub);
        assert_eq!(request.continuation_id, None);
    }

    #[tokio::test]
    async fn autonomy_set_after_new_applies_to_replies() {
        let h = Harness::new();
        h.send(1, "/new", None).await;
        let instruction = h.sink.last_posted().unwrap();
        h.send(2, "/auto low", None).await;

        h.runner.push("ok", Some("canonical"));
        h.send(3, "carry on", Some(instruction.message_id)).await;
        let request = &h.runner.requests()[0];
        assert_eq!(request.autonomy, AutonomyLevel::Low);
        assert_eq!(request.continuation_id, None);

        let snapshot = SnapshotStore::new(h.snapshot_file()).load();
        assert_eq!(snapshot.session_autonomy.get("canonical"), Some(&AutonomyLevel::Low));
    }

    #[tokio::test]
    async fn new_with_prompt_runs_and_updates_header() {
        let h = Harness::new();
        h.runner.push("started", Some("abcdef123456"));
        h.send(1, "/new write a readme", None).await;

        assert_eq!(h.runner.requests()[0].task, "write a readme");
        assert!(h.sink.edited_texts().iter().any(|t| t.ends_with("🆔 Session: abcdef12")));

        let snapshot = SnapshotStore::new(h.snapshot_file()).load();
        // Header and reply both continue the new session.
        assert_eq!(snapshot.sessions.len(), 2);
        assert!(snapshot
            .sessions
            .values()
            .all(|d| d.session_id.as_deref() == Some("abcdef123456")));
    }

    #[tokio::test]
    async fn autonomy_on_a_fresh_user_synthesizes_a_session() {
        let h = Harness::new();
        h.send(1, "/auto low", None).await;
        h.send(2, "/auto low", None).await;

        let snapshot = SnapshotStore::new(h.snapshot_file()).load();
        assert_eq!(snapshot.session_autonomy.len(), 1);
        let (id, level) = snapshot.session_autonomy.iter().next().unwrap();
        assert!(id.starts_with("local-chat-"));
        assert_eq!(*level, AutonomyLevel::Low);

        // The synthesized id is not sent to droid, but the setting applies.
        h.runner.push("ok", Some("canonical"));
        h.send(3, "go", None).await;
        let request = &h.runner.requests()[0];
        assert_eq!(request.continuation_id, None);
        assert_eq!(request.autonomy, AutonomyLevel::Low);

        // After droid assigns an id the setting follows it.
        let snapshot = SnapshotStore::new(h.snapshot_file()).load();
        assert_eq!(snapshot.session_autonomy.get("canonical"), Some(&AutonomyLevel::Low));
        assert!(!snapshot.session_autonomy.contains_key(id));
    }

    #[tokio::test]
    async fn showing_settings_creates_no_session() {
        let h = Harness::new();
        h.send(1, "/auto", None).await;
        h.send(2, "/model", None).await;
        h.send(3, "/sync", None).await;

        let texts = h.sink.posted_texts();
        assert!(texts[0].starts_with("Autonomy: high"));
        assert!(texts[1].starts_with("Model: default"));
        assert!(texts[2].starts_with("Git sync: "));
        assert!(h.orchestrator.directory.lock().await.active(OPERATOR).is_none());
        assert!(!h.snapshot_file().exists());
    }

    #[tokio::test]
    async fn invalid_autonomy_is_rejected() {
        let h = Harness::new();
        h.send(1, "/auto yolo", None).await;
        assert_eq!(h.sink.posted_texts(), vec!["Unknown autonomy level: yolo".to_string()]);
    }

    #[tokio::test]
    async fn model_and_sync_settings() {
        let h = Harness::new();
        h.send(1, "/model gpt-5", None).await;
        h.send(2, "/sync pull", None).await;

        h.runner.push("ok", None);
        h.send(3, "go", None).await;
        let request = &h.runner.requests()[0];
        assert_eq!(request.model.as_deref(), Some("gpt-5"));

        h.send(4, "/model default", None).await;
        let snapshot = SnapshotStore::new(h.snapshot_file()).load();
        assert!(snapshot.session_models.is_empty());
        assert_eq!(snapshot.session_git_sync.values().next().map(|s| s.pull), Some(true));
    }

    #[tokio::test]
    async fn stop_with_nothing_running() {
        let h = Harness::new();
        h.send(1, "/stop", None).await;
        assert_eq!(h.sink.posted_texts(), vec!["Nothing to stop.".to_string()]);
    }

    #[tokio::test]
    async fn stop_marks_the_status_message() {
        let h = Harness::new();
        let status = MessageRef::new(CHAT, 555);
        let _run = h
            .orchestrator
            .registry()
            .register(RunKey::Direct(OPERATOR), None, Some(status));

        h.send(1, "/stop", None).await;
        assert_eq!(h.sink.edited_texts(), vec!["⏹ Stopping...".to_string()]);
        assert_eq!(h.sink.posted_texts(), vec!["⏹ Stopping the running request...".to_string()]);

        h.send(2, "/stop", None).await;
        assert_eq!(h.sink.posted_texts()[1], "Nothing to stop.");
    }

    #[tokio::test]
    async fn stream_toggles() {
        let h = Harness::new();
        h.send(1, "/stream", None).await;
        h.send(2, "/stream", None).await;
        assert_eq!(
            h.sink.posted_texts(),
            vec!["Live tool updates: OFF".to_string(), "Live tool updates: ON".to_string()]
        );
    }

    #[tokio::test]
    async fn session_listing_and_switching() {
        let h = Harness::new();
        h.send(1, "/session", None).await;
        assert_eq!(h.sink.posted_texts()[0], "No sessions yet. Use /new to start one.");

        h.runner.push("a", Some("aaaa1111"));
        h.send(2, "first", None).await;
        h.send(3, "/new", None).await;
        h.runner.push("b", Some("bbbb2222"));
        h.send(4, "second", None).await;

        h.send(5, "/session", None).await;
        let listing = h.sink.posted_texts().last().unwrap().clone();
        assert!(listing.contains("<code>bbbb2222</code>"));
        assert!(listing.find("bbbb2222") < listing.find("aaaa1111"));
        assert!(listing.contains("✓"));

        h.send(6, "/session aaaa", None).await;
        h.runner.push("a2", Some("aaaa1111"));
        h.send(7, "continue a", None).await;
        assert_eq!(h.runner.requests()[2].continuation_id.as_deref(), Some("aaaa1111"));
    }

    #[tokio::test]
    async fn project_session_uses_project_settings() {
        let projects = tempfile::TempDir::new().unwrap();
        let project_dir = projects.path().join("api");
        std::fs::create_dir(&project_dir).unwrap();
        let h = Harness::with_settings(|s| {
            s.projects.insert(
                "api".to_string(),
                ProjectConfig {
                    path: project_dir.clone(),
                    autonomy: Some(AutonomyLevel::Medium),
                    model: Some("opus".to_string()),
                    git_sync: false,
                },
            );
        });

        h.send(1, "/project api", None).await;
        h.runner.push("ok", Some("real"));
        h.send(2, "add an endpoint", None).await;

        let request = &h.runner.requests()[0];
        assert_eq!(request.cwd, project_dir);
        assert_eq!(request.autonomy, AutonomyLevel::Medium);
        assert_eq!(request.model.as_deref(), Some("opus"));
        assert_eq!(request.continuation_id, None);

        h.send(3, "/project nope", None).await;
        assert_eq!(h.sink.posted_texts().last().unwrap(), "Unknown project: nope");
    }

    #[tokio::test]
    async fn unknown_command_points_at_help() {
        let h = Harness::new();
        h.send(1, "/frob", None).await;
        assert!(h.sink.posted_texts()[0].starts_with("Unknown command: /frob"));
    }
}
