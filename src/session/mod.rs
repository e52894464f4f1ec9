//! Session continuity: which droid session an inbound message continues.
//!
//! - `directory`: in-memory maps (message links, per-user active session,
//!   history, per-session settings) and the resolve/commit logic
//! - `store`: the JSON snapshot the directory is persisted to

pub mod directory;
pub mod store;

pub use directory::{ResolveSource, Resolved, SessionDefaults, SessionDirectory};
pub use store::{Snapshot, SnapshotStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::sink::MessageRef;

/// Telegram user id.
pub type UserId = u64;

/// Prefix of session ids synthesized locally before droid assigned one.
pub const LOCAL_SESSION_PREFIX: &str = "local-";

/// Maximum number of history entries kept.
pub const HISTORY_LIMIT: usize = 100;

/// How freely droid may run side-effecting actions.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyLevel {
    Off,
    Low,
    Medium,
    #[default]
    High,
    Unsafe,
}

impl AutonomyLevel {
    pub const ALL: [AutonomyLevel; 5] = [
        AutonomyLevel::Off,
        AutonomyLevel::Low,
        AutonomyLevel::Medium,
        AutonomyLevel::High,
        AutonomyLevel::Unsafe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AutonomyLevel::Off => "off",
            AutonomyLevel::Low => "low",
            AutonomyLevel::Medium => "medium",
            AutonomyLevel::High => "high",
            AutonomyLevel::Unsafe => "unsafe",
        }
    }
}

impl fmt::Display for AutonomyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AutonomyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" => Ok(AutonomyLevel::Off),
            "low" => Ok(AutonomyLevel::Low),
            "medium" | "med" => Ok(AutonomyLevel::Medium),
            "high" => Ok(AutonomyLevel::High),
            "unsafe" => Ok(AutonomyLevel::Unsafe),
            other => Err(format!("Unknown autonomy level: {}", other)),
        }
    }
}

/// Git synchronisation around an exchange.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct GitSync {
    #[serde(default)]
    pub pull: bool,
    #[serde(default)]
    pub push: bool,
}

impl GitSync {
    pub fn both() -> Self {
        Self { pull: true, push: true }
    }

    pub fn is_enabled(&self) -> bool {
        self.pull || self.push
    }
}

impl fmt::Display for GitSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.pull, self.push) {
            (false, false) => f.write_str("off"),
            (true, false) => f.write_str("pull"),
            (false, true) => f.write_str("push"),
            (true, true) => f.write_str("pull+push"),
        }
    }
}

impl FromStr for GitSync {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" | "none" => Ok(GitSync::default()),
            "pull" => Ok(GitSync { pull: true, push: false }),
            "push" => Ok(GitSync { pull: false, push: true }),
            "both" | "on" | "pull+push" => Ok(GitSync::both()),
            other => Err(format!("Unknown sync mode: {}", other)),
        }
    }
}

/// Everything needed to continue (or start) a droid conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SessionDescriptor {
    pub session_id: Option<String>,
    pub cwd: PathBuf,
    #[serde(default)]
    pub autonomy: AutonomyLevel,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub git_sync_pull: bool,
    #[serde(default)]
    pub git_sync_push: bool,
}

impl SessionDescriptor {
    /// A descriptor with no session id yet.
    pub fn fresh(cwd: PathBuf, autonomy: AutonomyLevel, model: Option<String>) -> Self {
        Self {
            session_id: None,
            cwd,
            autonomy,
            model,
            git_sync_pull: false,
            git_sync_push: false,
        }
    }

    /// Session id to pass to droid with `-s`; local placeholders are never sent.
    pub fn continuation_id(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .filter(|id| !is_local_session_id(id))
    }

    pub fn git_sync(&self) -> GitSync {
        GitSync {
            pull: self.git_sync_pull,
            push: self.git_sync_push,
        }
    }

    pub fn set_git_sync(&mut self, sync: GitSync) {
        self.git_sync_pull = sync.pull;
        self.git_sync_push = sync.push;
    }

    /// Short id for display ("new" when there is none).
    pub fn short_id(&self) -> String {
        self.session_id
            .as_deref()
            .map(short_session_id)
            .unwrap_or_else(|| "new".to_string())
    }
}

/// The per-user fallback used when an inbound message is not a reply.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UserActiveSession {
    #[serde(flatten)]
    pub session: SessionDescriptor,
    #[serde(default)]
    pub last_message: Option<MessageRef>,
}

/// Informational record of a session, shown by `/session`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SessionHistoryEntry {
    pub session_id: String,
    pub cwd: PathBuf,
    #[serde(alias = "started")]
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub first_message: Option<String>,
}

/// Synthesize a placeholder session id, e.g. `local-task-3f2a9c1e`.
pub fn synthesize_session_id(scope: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}-{}", LOCAL_SESSION_PREFIX, scope, &suffix[..8])
}

pub fn is_local_session_id(id: &str) -> bool {
    id.starts_with(LOCAL_SESSION_PREFIX)
}

/// First eight characters of an id (the random suffix for local ids).
pub fn short_session_id(id: &str) -> String {
    let id = if is_local_session_id(id) {
        id.rsplit('-').next().unwrap_or(id)
    } else {
        id
    };
    id.chars().take(8).collect()
}

/// Cut a seed message to 50 characters, adding an ellipsis when cut.
pub fn summarize_seed(text: &str) -> String {
    const LIMIT: usize = 50;
    if text.chars().count() > LIMIT {
        let head: String = text.chars().take(LIMIT).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}
