//! Queued project tasks: the `/queue` front-end and the executor the task
//! queue drives.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::display_path;
use crate::droid::RunKey;
use crate::error::{Error, Result};
use crate::markdown::escape_html;
use crate::queue::{NewTask, RunStart, TaskDescriptor, TaskExecutor, TaskStatus};
use crate::session::{synthesize_session_id, GitSync, SessionDescriptor};
use crate::sink::PostOptions;

use super::{Exchange, ExchangeResult, Inbound, Orchestrator};

const QUEUE_USAGE: &str = "Usage: /queue add <project> <task> | list | run | pause | resume | skip | clear";

impl Orchestrator {
    fn executor(self: &Arc<Self>) -> Arc<dyn TaskExecutor> {
        self.clone()
    }

    pub(super) async fn cmd_queue(self: &Arc<Self>, msg: &Inbound, args: &str) -> Result<()> {
        let (sub, rest) = match args.split_once(char::is_whitespace) {
            Some((sub, rest)) => (sub, rest.trim()),
            None => (args, ""),
        };

        let text = match sub.to_lowercase().as_str() {
            "add" => self.queue_add(msg, rest).await,
            "" | "list" => return self.queue_list(msg).await,
            "run" => match self.queue.run(self.executor()).await {
                RunStart::Started => "▶️ Queue started.".to_string(),
                RunStart::Resumed => "▶️ Queue resumed.".to_string(),
                RunStart::AlreadyRunning => "Queue is already running.".to_string(),
                RunStart::NothingPending => "No pending tasks.".to_string(),
            },
            "resume" => match self.queue.resume(self.executor()).await {
                RunStart::Started | RunStart::Resumed => "▶️ Queue resumed.".to_string(),
                RunStart::AlreadyRunning => "Queue is already running.".to_string(),
                RunStart::NothingPending => "No pending tasks.".to_string(),
            },
            "pause" => {
                if self.queue.pause().await {
                    "⏸ Queue will pause after the current task.".to_string()
                } else {
                    "Queue is not running.".to_string()
                }
            }
            "skip" => match self.queue.skip().await {
                Some(task) => format!("⏭ Skipped task #{}", task.id),
                None => "No task is running.".to_string(),
            },
            "clear" => format!("🗑 Cleared {} tasks.", self.queue.clear().await),
            _ => QUEUE_USAGE.to_string(),
        };
        self.reply(msg, &text).await?;
        Ok(())
    }

    async fn queue_add(&self, msg: &Inbound, rest: &str) -> String {
        let Some((project_name, description)) = rest.split_once(char::is_whitespace) else {
            return QUEUE_USAGE.to_string();
        };
        let description = description.trim();
        let Some(project) = self.settings.projects.get(project_name) else {
            return format!("Unknown project: {}", project_name);
        };

        let task = self
            .queue
            .enqueue(NewTask {
                project: project_name.to_string(),
                description: description.to_string(),
                autonomy: project.autonomy.unwrap_or(self.settings.droid.default_autonomy),
                model: project
                    .model
                    .clone()
                    .or_else(|| self.settings.droid.default_model.clone()),
                sync_enabled: project.git_sync,
                chat_id: msg.chat_id,
                user_id: msg.user_id,
            })
            .await;
        format!("📋 Queued task #{} for {}: {}", task.id, task.project, task.description)
    }

    async fn queue_list(&self, msg: &Inbound) -> Result<()> {
        let tasks = self.queue.list().await;
        if tasks.is_empty() {
            self.reply(msg, "Queue is empty.").await?;
            return Ok(());
        }

        let mut lines = vec![format!("<b>Task Queue</b> ({})\n", self.queue.state().await)];
        for task in &tasks {
            lines.push(format!(
                "{} #{} <code>{}</code> {}",
                task.status.icon(),
                task.id,
                escape_html(&task.project),
                escape_html(&task.description)
            ));
        }
        self.reply_html(msg, &lines.join("\n")).await?;
        Ok(())
    }

    /// Descriptor for a queued task: the project's directory under a fresh
    /// task-scoped id, with the task's settings attached to that id.
    async fn task_descriptor(&self, task: &TaskDescriptor) -> Result<SessionDescriptor> {
        let project = self
            .settings
            .projects
            .get(&task.project)
            .ok_or_else(|| Error::Other(format!("Unknown project: {}", task.project)))?;
        if !project.path.is_dir() {
            return Err(Error::DirectoryNotFound(project.path.display().to_string()));
        }

        let session_id = synthesize_session_id("task");
        let mut descriptor = SessionDescriptor::fresh(project.path.clone(), task.autonomy, task.model.clone());
        descriptor.session_id = Some(session_id.clone());
        if task.sync_enabled {
            descriptor.set_git_sync(GitSync::both());
        }

        let mut directory = self.directory.lock().await;
        directory.set_autonomy(&session_id, task.autonomy);
        directory.set_model(&session_id, task.model.clone());
        if task.sync_enabled {
            directory.set_git_sync(&session_id, GitSync::both());
        }
        Ok(descriptor)
    }
}

#[async_trait]
impl TaskExecutor for Orchestrator {
    async fn execute(&self, task: &TaskDescriptor) -> Result<()> {
        self.notify(
            task.chat_id,
            &format!("▶️ Task #{} started: {}", task.id, task.description),
            None,
        )
        .await;

        let descriptor = self.task_descriptor(task).await?;
        let status = self
            .sink
            .post_message(
                task.chat_id,
                &format!("Working on task #{} in {}", task.id, display_path(&descriptor.cwd)),
                PostOptions::plain(),
            )
            .await?;

        let result = self
            .exchange(Exchange {
                key: RunKey::Queue,
                user: task.user_id,
                chat_id: task.chat_id,
                reply_to: None,
                task: task.description.clone(),
                autonomy: task.autonomy,
                descriptor,
                status,
                extra_links: Vec::new(),
                update_active: false,
                allow_escalation: false,
            })
            .await;

        match result {
            ExchangeResult::Replied { outcome, .. } if outcome.errored => {
                Err(Error::Tool("droid reported an error".to_string()))
            }
            ExchangeResult::Replied { .. } => Ok(()),
            ExchangeResult::PermissionRequested => Err(Error::Other("permission required".to_string())),
            ExchangeResult::Failed(reason) => Err(Error::Other(reason)),
        }
    }

    async fn report(&self, task: &TaskDescriptor) {
        let text = match task.status {
            TaskStatus::Completed => format!("✅ Task #{} completed: {}", task.id, task.description),
            _ => format!("❌ Task #{} failed: {}", task.id, task.description),
        };
        self.notify(task.chat_id, &text, None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::config::ProjectConfig;
    use crate::queue::QueueState;
    use crate::session::{AutonomyLevel, SnapshotStore};
    use crate::sink::testing::SinkEvent;
    use crate::sink::TextFormat;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    fn with_project() -> (Harness, TempDir, PathBuf) {
        let projects = TempDir::new().unwrap();
        let api = projects.path().join("api");
        std::fs::create_dir(&api).unwrap();
        let path = api.clone();
        let h = Harness::with_settings(move |s| {
            s.projects.insert(
                "api".to_string(),
                ProjectConfig {
                    path,
                    autonomy: Some(AutonomyLevel::Low),
                    model: None,
                    git_sync: false,
                },
            );
        });
        (h, projects, api)
    }

    async fn wait_until_stopped(h: &Harness) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.orchestrator.queue().state().await != QueueState::Stopped {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queue did not finish");
    }

    fn html_replies(h: &Harness) -> Vec<(i32, String)> {
        h.sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Posted {
                    message,
                    text,
                    format: TextFormat::Html,
                    ..
                } => Some((message.message_id, text)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn queued_tasks_run_in_order_and_notify() {
        let (h, _projects, api) = with_project();
        h.runner.push("first done", Some("q-1"));
        h.runner.push("second done", Some("q-2"));

        h.send(1, "/queue add api write docs", None).await;
        h.send(2, "/queue add api bump deps", None).await;
        h.send(3, "/queue run", None).await;
        wait_until_stopped(&h).await;

        let requests = h.runner.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].task, "write docs");
        assert_eq!(requests[1].task, "bump deps");
        for request in &requests {
            assert_eq!(request.key, RunKey::Queue);
            assert_eq!(request.cwd, api);
            assert_eq!(request.autonomy, AutonomyLevel::Low);
            assert_eq!(request.continuation_id, None);
        }

        let texts = h.sink.posted_texts();
        assert!(texts.contains(&"📋 Queued task #1 for api: write docs".to_string()));
        assert!(texts.contains(&"▶️ Task #1 started: write docs".to_string()));
        assert!(texts.contains(&"✅ Task #2 completed: bump deps".to_string()));

        let list = h.orchestrator.queue().list().await;
        assert!(list.iter().all(|t| t.status == TaskStatus::Completed));
    }

    #[tokio::test]
    async fn task_replies_continue_without_touching_the_active_session() {
        let (h, _projects, _api) = with_project();
        h.runner.push("mine", Some("direct"));
        h.send(1, "hello", None).await;

        h.runner.push("queued answer", Some("q-1"));
        h.send(2, "/queue add api write docs", None).await;
        h.send(3, "/queue run", None).await;
        wait_until_stopped(&h).await;

        h.runner.push("still mine", Some("direct"));
        h.send(4, "and again", None).await;
        h.runner.push("follow up", Some("q-1"));
        let (task_reply, _) = html_replies(&h)
            .into_iter()
            .find(|(_, text)| text == "queued answer")
            .unwrap();
        h.send(5, "more docs", Some(task_reply)).await;

        let requests = h.runner.requests();
        assert_eq!(requests[2].continuation_id.as_deref(), Some("direct"));
        assert_eq!(requests[3].continuation_id.as_deref(), Some("q-1"));

        let snapshot = SnapshotStore::new(h.snapshot_file()).load();
        assert_eq!(snapshot.session_autonomy.get("q-1"), Some(&AutonomyLevel::Low));
        assert!(snapshot.session_history.iter().any(|e| e.session_id == "q-1"));
    }

    #[tokio::test]
    async fn failed_run_marks_the_task_failed() {
        let (h, _projects, _api) = with_project();
        h.runner.push_result(Err(Error::Tool("boom".to_string())));
        h.send(1, "/queue add api break things", None).await;
        h.send(2, "/queue run", None).await;
        wait_until_stopped(&h).await;

        assert!(h
            .sink
            .posted_texts()
            .contains(&"❌ Task #1 failed: break things".to_string()));
        assert_eq!(h.orchestrator.queue().list().await[0].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn queue_commands_report_state() {
        let (h, _projects, _api) = with_project();
        h.send(1, "/queue", None).await;
        h.send(2, "/queue add nope fix", None).await;
        h.send(3, "/queue run", None).await;
        h.send(4, "/queue skip", None).await;
        h.send(5, "/queue pause", None).await;
        h.send(6, "/queue add api one", None).await;
        h.send(7, "/queue list", None).await;
        h.send(8, "/queue clear", None).await;

        let texts = h.sink.posted_texts();
        assert_eq!(texts[0], "Queue is empty.");
        assert_eq!(texts[1], "Unknown project: nope");
        assert_eq!(texts[2], "No pending tasks.");
        assert_eq!(texts[3], "No task is running.");
        assert_eq!(texts[4], "Queue is not running.");
        assert!(texts[6].contains("⏳ #1 <code>api</code> one"));
        assert!(texts[6].contains("(stopped)"));
        assert_eq!(texts[7], "🗑 Cleared 1 tasks.");
        assert!(h.runner.requests().is_empty());
    }
}
