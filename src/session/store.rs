//! Snapshot persistence for the Session Directory.
//!
//! One JSON document, rewritten whole after every mutation. A missing file is
//! an empty state; a corrupt file is logged and treated as empty.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::sink::MessageRef;

use super::{AutonomyLevel, GitSync, SessionDescriptor, SessionHistoryEntry, UserActiveSession, UserId, HISTORY_LIMIT};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    #[serde(default)]
    pub sessions: BTreeMap<MessageRef, SessionDescriptor>,
    #[serde(default)]
    pub active_session_per_user: BTreeMap<UserId, UserActiveSession>,
    #[serde(default)]
    pub session_history: Vec<SessionHistoryEntry>,
    #[serde(default)]
    pub session_autonomy: BTreeMap<String, AutonomyLevel>,
    #[serde(default)]
    pub session_git_sync: BTreeMap<String, GitSync>,
    #[serde(default)]
    pub session_models: BTreeMap<String, String>,
    #[serde(default)]
    pub session_aliases: BTreeMap<String, String>,
}

pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot, never failing: absent or unreadable files yield an
    /// empty snapshot.
    pub fn load(&self) -> Snapshot {
        match self.try_load() {
            Ok(Some(snapshot)) => {
                tracing::info!(
                    "Loaded {} session links, {} history entries from {}",
                    snapshot.sessions.len(),
                    snapshot.session_history.len(),
                    self.path.display()
                );
                snapshot
            }
            Ok(None) => Snapshot::default(),
            Err(e) => {
                tracing::error!("Failed to load sessions from {}: {}", self.path.display(), e);
                Snapshot::default()
            }
        }
    }

    fn try_load(&self) -> Result<Option<Snapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let snapshot = serde_json::from_str(&content)?;
        Ok(Some(snapshot))
    }

    /// Overwrite the snapshot file. History is capped to the most recent
    /// entries on the way out.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let mut snapshot = snapshot.clone();
        if snapshot.session_history.len() > HISTORY_LIMIT {
            let excess = snapshot.session_history.len() - HISTORY_LIMIT;
            snapshot.session_history.drain(..excess);
        }

        let content = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| Error::Persistence(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Persistence(e.to_string()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(|e| Error::Persistence(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| Error::Persistence(e.to_string()))?;

        tracing::debug!("Saved sessions to {}", self.path.display());
        Ok(())
    }
}
