//! Task Queue Scheduler.
//!
//! An ordered list of project tasks run one at a time through a
//! `TaskExecutor`. Pausing takes effect between items; skipping fails the
//! running item and stops its process; clearing drops everything, and a loop
//! still waiting on an in-flight item exits once it returns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::droid::{ProcessRegistry, RunKey, StopOutcome};
use crate::error::Result;
use crate::session::{AutonomyLevel, UserId};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn icon(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "⏳",
            TaskStatus::Running => "▶️",
            TaskStatus::Completed => "✅",
            TaskStatus::Failed => "❌",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    Stopped,
    Running,
    Paused,
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueueState::Stopped => "stopped",
            QueueState::Running => "running",
            QueueState::Paused => "paused",
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskDescriptor {
    pub id: u32,
    pub project: String,
    pub description: String,
    pub autonomy: AutonomyLevel,
    pub model: Option<String>,
    pub sync_enabled: bool,
    pub status: TaskStatus,
    /// Chat the task was queued from; notifications go there.
    pub chat_id: i64,
    pub user_id: UserId,
}

/// Fields of a task to enqueue.
#[derive(Clone, Debug)]
pub struct NewTask {
    pub project: String,
    pub description: String,
    pub autonomy: AutonomyLevel,
    pub model: Option<String>,
    pub sync_enabled: bool,
    pub chat_id: i64,
    pub user_id: UserId,
}

/// What `run` did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStart {
    Started,
    Resumed,
    AlreadyRunning,
    NothingPending,
}

/// Runs queued tasks; implemented by the orchestrator.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run one task. `Err` marks it failed.
    async fn execute(&self, task: &TaskDescriptor) -> Result<()>;

    /// Report a finished task (status already final).
    async fn report(&self, task: &TaskDescriptor);
}

struct Inner {
    tasks: Vec<TaskDescriptor>,
    state: QueueState,
    loop_active: bool,
    /// Bumped by `clear`; a loop from an older generation exits.
    generation: u64,
    next_id: u32,
}

pub struct TaskQueue {
    inner: Mutex<Inner>,
    delay: Duration,
    registry: Arc<ProcessRegistry>,
}

impl TaskQueue {
    pub fn new(delay: Duration, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: Vec::new(),
                state: QueueState::Stopped,
                loop_active: false,
                generation: 0,
                next_id: 1,
            }),
            delay,
            registry,
        }
    }

    /// Append a task; returns the stored descriptor.
    pub async fn enqueue(&self, task: NewTask) -> TaskDescriptor {
        let mut inner = self.inner.lock().await;
        let descriptor = TaskDescriptor {
            id: inner.next_id,
            project: task.project,
            description: task.description,
            autonomy: task.autonomy,
            model: task.model,
            sync_enabled: task.sync_enabled,
            status: TaskStatus::Pending,
            chat_id: task.chat_id,
            user_id: task.user_id,
        };
        inner.next_id += 1;
        inner.tasks.push(descriptor.clone());
        tracing::info!("Queued task #{} for {}", descriptor.id, descriptor.project);
        descriptor
    }

    pub async fn list(&self) -> Vec<TaskDescriptor> {
        self.inner.lock().await.tasks.clone()
    }

    pub async fn state(&self) -> QueueState {
        self.inner.lock().await.state
    }

    /// Start processing pending tasks in the background.
    pub async fn run(self: &Arc<Self>, executor: Arc<dyn TaskExecutor>) -> RunStart {
        let generation = {
            let mut inner = self.inner.lock().await;
            if inner.loop_active {
                if inner.state == QueueState::Paused {
                    inner.state = QueueState::Running;
                    return RunStart::Resumed;
                }
                return RunStart::AlreadyRunning;
            }
            if !inner.tasks.iter().any(|t| t.status == TaskStatus::Pending) {
                inner.state = QueueState::Stopped;
                return RunStart::NothingPending;
            }
            inner.state = QueueState::Running;
            inner.loop_active = true;
            inner.generation
        };

        tracing::info!("Task queue started");
        tokio::spawn(Arc::clone(self).run_loop(executor, generation));
        RunStart::Started
    }

    async fn run_loop(self: Arc<Self>, executor: Arc<dyn TaskExecutor>, generation: u64) {
        loop {
            let task = {
                let mut inner = self.inner.lock().await;
                if inner.generation != generation {
                    tracing::debug!("Task queue loop from a cleared generation exits");
                    return;
                }
                if inner.state == QueueState::Paused {
                    inner.loop_active = false;
                    tracing::info!("Task queue paused");
                    return;
                }
                match inner.tasks.iter_mut().find(|t| t.status == TaskStatus::Pending) {
                    Some(task) => {
                        task.status = TaskStatus::Running;
                        task.clone()
                    }
                    None => {
                        inner.state = QueueState::Stopped;
                        inner.loop_active = false;
                        tracing::info!("Task queue finished");
                        return;
                    }
                }
            };

            tracing::info!("Task #{} started: {}", task.id, task.description);
            let succeeded = match executor.execute(&task).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Task #{} failed: {}", task.id, e);
                    false
                }
            };

            let finished = self.finish(task, succeeded).await;
            executor.report(&finished).await;

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
    }

    /// Move a running task to its final status unless `skip` already did.
    async fn finish(&self, mut task: TaskDescriptor, succeeded: bool) -> TaskDescriptor {
        let status = if succeeded {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        let mut inner = self.inner.lock().await;
        match inner.tasks.iter_mut().find(|t| t.id == task.id) {
            Some(stored) => {
                if stored.status == TaskStatus::Running {
                    stored.status = status;
                }
                stored.clone()
            }
            None => {
                task.status = status;
                task
            }
        }
    }

    /// Stop picking new items after the current one. Returns false when the
    /// queue was not running.
    pub async fn pause(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state == QueueState::Running {
            inner.state = QueueState::Paused;
            true
        } else {
            false
        }
    }

    pub async fn resume(self: &Arc<Self>, executor: Arc<dyn TaskExecutor>) -> RunStart {
        self.run(executor).await
    }

    /// Fail the running task and stop its process.
    pub async fn skip(&self) -> Option<TaskDescriptor> {
        let skipped = {
            let mut inner = self.inner.lock().await;
            let task = inner.tasks.iter_mut().find(|t| t.status == TaskStatus::Running)?;
            task.status = TaskStatus::Failed;
            task.clone()
        };
        if self.registry.stop(RunKey::Queue) == StopOutcome::NothingToStop {
            tracing::debug!("Skipped task #{} had no registered process", skipped.id);
        }
        tracing::info!("Skipped task #{}", skipped.id);
        Some(skipped)
    }

    /// Drop every task and reset to stopped. An in-flight task keeps running
    /// until it returns; its result is not recorded.
    pub async fn clear(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let count = inner.tasks.len();
        inner.tasks.clear();
        inner.state = QueueState::Stopped;
        inner.loop_active = false;
        inner.generation += 1;
        tracing::info!("Cleared {} queued tasks", count);
        count
    }
}
