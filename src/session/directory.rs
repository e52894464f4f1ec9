//! Session Directory.
//!
//! Links sent messages to session descriptors so that replying to any of them
//! continues that conversation, keeps a per-user fallback for messages that are
//! not replies, and stores per-session settings keyed by session id.

use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::sink::MessageRef;

use super::store::Snapshot;
use super::{
    is_local_session_id, summarize_seed, synthesize_session_id, AutonomyLevel, GitSync,
    SessionDescriptor, SessionHistoryEntry, UserActiveSession, UserId, HISTORY_LIMIT,
};

/// Values a fresh descriptor starts from.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub cwd: PathBuf,
    pub autonomy: AutonomyLevel,
    pub model: Option<String>,
}

/// Where a resolved descriptor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveSource {
    /// The inbound message replied to a linked message.
    Link,
    /// The user's active session.
    Active,
    /// Nothing matched; a fresh descriptor.
    Fresh,
}

/// Result of `SessionDirectory::resolve`.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub descriptor: SessionDescriptor,
    pub source: ResolveSource,
}

impl Resolved {
    pub fn is_continuation(&self) -> bool {
        self.source != ResolveSource::Fresh
    }
}

pub struct SessionDirectory {
    defaults: SessionDefaults,
    links: HashMap<MessageRef, SessionDescriptor>,
    active: HashMap<UserId, UserActiveSession>,
    history: Vec<SessionHistoryEntry>,
    autonomy: HashMap<String, AutonomyLevel>,
    git_sync: HashMap<String, GitSync>,
    models: HashMap<String, String>,
    /// Local placeholder id -> canonical id droid assigned later.
    aliases: HashMap<String, String>,
}

impl SessionDirectory {
    pub fn new(defaults: SessionDefaults) -> Self {
        Self {
            defaults,
            links: HashMap::new(),
            active: HashMap::new(),
            history: Vec::new(),
            autonomy: HashMap::new(),
            git_sync: HashMap::new(),
            models: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Rebuild a directory from a persisted snapshot.
    pub fn from_snapshot(snapshot: Snapshot, defaults: SessionDefaults) -> Self {
        let mut history = snapshot.session_history;
        trim_history(&mut history);
        Self {
            defaults,
            links: snapshot.sessions.into_iter().collect(),
            active: snapshot.active_session_per_user.into_iter().collect(),
            history,
            autonomy: snapshot.session_autonomy.into_iter().collect(),
            git_sync: snapshot.session_git_sync.into_iter().collect(),
            models: snapshot.session_models.into_iter().collect(),
            aliases: snapshot.session_aliases.into_iter().collect(),
        }
    }

    /// Capture the persisted state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            sessions: self.links.iter().map(|(k, v)| (*k, v.clone())).collect(),
            active_session_per_user: self.active.iter().map(|(k, v)| (*k, v.clone())).collect(),
            session_history: self.history.clone(),
            session_autonomy: self.autonomy.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            session_git_sync: self.git_sync.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            session_models: self.models.clone().into_iter().collect(),
            session_aliases: self.aliases.clone().into_iter().collect(),
        }
    }

    pub fn defaults(&self) -> &SessionDefaults {
        &self.defaults
    }

    /// A descriptor with no session id in the default directory.
    pub fn fresh_descriptor(&self) -> SessionDescriptor {
        SessionDescriptor::fresh(
            self.defaults.cwd.clone(),
            self.defaults.autonomy,
            self.defaults.model.clone(),
        )
    }

    /// Decide which session an inbound message continues.
    ///
    /// A known link at `reply_to` always wins, then the user's active session,
    /// then a fresh descriptor.
    pub fn resolve(&self, user: UserId, reply_to: Option<MessageRef>) -> Resolved {
        if let Some(descriptor) = reply_to.and_then(|r| self.links.get(&r)) {
            return Resolved {
                descriptor: self.effective(descriptor),
                source: ResolveSource::Link,
            };
        }
        if let Some(active) = self.active.get(&user) {
            return Resolved {
                descriptor: self.effective(&active.session),
                source: ResolveSource::Active,
            };
        }
        Resolved {
            descriptor: self.fresh_descriptor(),
            source: ResolveSource::Fresh,
        }
    }

    /// Follow migrations and overlay the per-session settings.
    fn effective(&self, descriptor: &SessionDescriptor) -> SessionDescriptor {
        let mut d = descriptor.clone();
        if let Some(id) = d.session_id.clone() {
            let id = self.canonical_id(&id);
            if let Some(level) = self.autonomy.get(&id) {
                d.autonomy = *level;
            }
            if let Some(model) = self.models.get(&id) {
                d.model = Some(model.clone());
            }
            if let Some(sync) = self.git_sync.get(&id) {
                d.set_git_sync(*sync);
            }
            d.session_id = Some(id);
        }
        d
    }

    fn canonical_id(&self, id: &str) -> String {
        self.aliases.get(id).cloned().unwrap_or_else(|| id.to_string())
    }

    /// Record the outcome of an exchange.
    ///
    /// Links `message` to the resulting session, makes it the user's active
    /// session and appends a history entry the first time the id is seen.
    /// Returns whether a history entry was added.
    pub fn commit(
        &mut self,
        user: UserId,
        message: MessageRef,
        resulting_session_id: Option<String>,
        cwd: &Path,
        prior: &SessionDescriptor,
        seed: Option<&str>,
    ) -> bool {
        let (descriptor, added) = self.record(message, resulting_session_id, cwd, prior, seed);
        self.active.insert(
            user,
            UserActiveSession {
                session: descriptor,
                last_message: Some(message),
            },
        );
        added
    }

    /// `commit` without touching any user's active session. Returns the
    /// linked descriptor and whether a history entry was added.
    pub fn record(
        &mut self,
        message: MessageRef,
        resulting_session_id: Option<String>,
        cwd: &Path,
        prior: &SessionDescriptor,
        seed: Option<&str>,
    ) -> (SessionDescriptor, bool) {
        if let (Some(old), Some(new)) = (prior.session_id.as_deref(), resulting_session_id.as_deref()) {
            if old != new && is_local_session_id(old) {
                self.migrate(old, new);
            }
        }

        let mut descriptor = prior.clone();
        descriptor.session_id = resulting_session_id.or_else(|| prior.session_id.clone());
        descriptor.cwd = cwd.to_path_buf();
        self.links.insert(message, descriptor.clone());

        let added = match &descriptor.session_id {
            Some(id) => self.record_history(id, cwd, seed),
            None => false,
        };
        (descriptor, added)
    }

    fn record_history(&mut self, session_id: &str, cwd: &Path, seed: Option<&str>) -> bool {
        if self.history.iter().any(|e| e.session_id == session_id) {
            return false;
        }
        self.history.push(SessionHistoryEntry {
            session_id: session_id.to_string(),
            cwd: cwd.to_path_buf(),
            started_at: Utc::now(),
            first_message: seed.map(summarize_seed),
        });
        trim_history(&mut self.history);
        true
    }

    /// Move settings stored under a synthesized id to the canonical id.
    fn migrate(&mut self, old: &str, new: &str) {
        if let Some(level) = self.autonomy.remove(old) {
            self.autonomy.insert(new.to_string(), level);
        }
        if let Some(model) = self.models.remove(old) {
            self.models.insert(new.to_string(), model);
        }
        if let Some(sync) = self.git_sync.remove(old) {
            self.git_sync.insert(new.to_string(), sync);
        }
        if let Some(entry) = self.history.iter_mut().find(|e| e.session_id == old) {
            entry.session_id = new.to_string();
        }
        self.aliases.insert(old.to_string(), new.to_string());
        tracing::debug!("Migrated session settings {} -> {}", old, new);
    }

    /// Link a message to a descriptor without touching the active session.
    pub fn link_message(&mut self, message: MessageRef, descriptor: SessionDescriptor) {
        self.links.insert(message, descriptor);
    }

    /// Make `descriptor` the user's active session.
    pub fn set_active(&mut self, user: UserId, descriptor: SessionDescriptor, last_message: Option<MessageRef>) {
        self.active.insert(
            user,
            UserActiveSession {
                session: descriptor,
                last_message,
            },
        );
    }

    pub fn active(&self, user: UserId) -> Option<&UserActiveSession> {
        self.active.get(&user)
    }

    /// The id settings attach to for the user's active session, synthesizing
    /// one when the session has not talked to droid yet.
    pub fn ensure_session_id(&mut self, user: UserId) -> String {
        let fresh = self.fresh_descriptor();
        let active = self.active.entry(user).or_insert_with(|| UserActiveSession {
            session: fresh,
            last_message: None,
        });
        match &active.session.session_id {
            Some(id) => id.clone(),
            None => {
                let id = synthesize_session_id("chat");
                active.session.session_id = Some(id.clone());
                id
            }
        }
    }

    pub fn set_autonomy(&mut self, session_id: &str, level: AutonomyLevel) {
        self.autonomy.insert(session_id.to_string(), level);
    }

    /// Set or clear (`None`) the model override.
    pub fn set_model(&mut self, session_id: &str, model: Option<String>) {
        match model {
            Some(m) => {
                self.models.insert(session_id.to_string(), m);
            }
            None => {
                self.models.remove(session_id);
            }
        }
    }

    pub fn set_git_sync(&mut self, session_id: &str, sync: GitSync) {
        self.git_sync.insert(session_id.to_string(), sync);
    }

    /// Make the first history entry whose id starts with `prefix` the user's
    /// active session.
    pub fn switch_to(&mut self, user: UserId, prefix: &str) -> Option<SessionHistoryEntry> {
        let entry = self
            .history
            .iter()
            .find(|e| e.session_id.starts_with(prefix))
            .cloned()?;
        let mut descriptor = self.fresh_descriptor();
        descriptor.session_id = Some(entry.session_id.clone());
        descriptor.cwd = entry.cwd.clone();
        let descriptor = self.effective(&descriptor);
        self.set_active(user, descriptor, None);
        Some(entry)
    }

    pub fn history(&self) -> &[SessionHistoryEntry] {
        &self.history
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}

fn trim_history(history: &mut Vec<SessionHistoryEntry>) {
    if history.len() > HISTORY_LIMIT {
        let excess = history.len() - HISTORY_LIMIT;
        history.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: UserId = 42;

    fn directory() -> SessionDirectory {
        SessionDirectory::new(SessionDefaults {
            cwd: PathBuf::from("/home/op"),
            autonomy: AutonomyLevel::High,
            model: None,
        })
    }

    fn msg(id: i32) -> MessageRef {
        MessageRef::new(1, id)
    }

    #[test]
    fn fresh_when_nothing_matches() {
        let dir = directory();
        let resolved = dir.resolve(USER, None);
        assert_eq!(resolved.source, ResolveSource::Fresh);
        assert_eq!(resolved.descriptor.session_id, None);
        assert_eq!(resolved.descriptor.cwd, PathBuf::from("/home/op"));
    }

    #[test]
    fn first_exchange_adds_exactly_one_history_entry() {
        let mut dir = directory();
        let prior = dir.resolve(USER, None).descriptor;

        let added = dir.commit(USER, msg(10), Some("sess-1".into()), Path::new("/home/op"), &prior, Some("hello"));
        assert!(added);
        assert_eq!(dir.history().len(), 1);
        assert_eq!(dir.history()[0].first_message.as_deref(), Some("hello"));

        let prior = dir.resolve(USER, Some(msg(10))).descriptor;
        let added = dir.commit(USER, msg(11), Some("sess-1".into()), Path::new("/home/op"), &prior, Some("again"));
        assert!(!added);
        assert_eq!(dir.history().len(), 1);
    }

    #[test]
    fn reply_link_beats_active_session() {
        let mut dir = directory();
        let fresh = dir.fresh_descriptor();
        dir.commit(USER, msg(1), Some("thread-a".into()), Path::new("/a"), &fresh, None);
        dir.commit(USER, msg(2), Some("thread-b".into()), Path::new("/b"), &fresh, None);

        // Active session is now thread-b, but replying to msg 1 continues thread-a.
        let resolved = dir.resolve(USER, Some(msg(1)));
        assert_eq!(resolved.source, ResolveSource::Link);
        assert_eq!(resolved.descriptor.session_id.as_deref(), Some("thread-a"));
        assert_eq!(resolved.descriptor.cwd, PathBuf::from("/a"));

        let fallback = dir.resolve(USER, None);
        assert_eq!(fallback.source, ResolveSource::Active);
        assert_eq!(fallback.descriptor.session_id.as_deref(), Some("thread-b"));
    }

    #[test]
    fn unknown_reply_falls_back_to_active() {
        let mut dir = directory();
        let fresh = dir.fresh_descriptor();
        dir.commit(USER, msg(1), Some("s".into()), Path::new("/a"), &fresh, None);
        let resolved = dir.resolve(USER, Some(msg(999)));
        assert_eq!(resolved.source, ResolveSource::Active);
    }

    #[test]
    fn settings_are_idempotent_and_follow_the_session() {
        let mut dir = directory();
        let fresh = dir.fresh_descriptor();
        dir.commit(USER, msg(1), Some("s1".into()), Path::new("/a"), &fresh, None);

        dir.set_autonomy("s1", AutonomyLevel::Low);
        dir.set_model("s1", Some("opus".into()));
        dir.set_git_sync("s1", GitSync::both());
        let once = dir.snapshot();

        dir.set_autonomy("s1", AutonomyLevel::Low);
        dir.set_model("s1", Some("opus".into()));
        dir.set_git_sync("s1", GitSync::both());
        assert_eq!(dir.snapshot(), once);

        let d = dir.resolve(USER, Some(msg(1))).descriptor;
        assert_eq!(d.autonomy, AutonomyLevel::Low);
        assert_eq!(d.model.as_deref(), Some("opus"));
        assert!(d.git_sync_pull && d.git_sync_push);
    }

    #[test]
    fn synthesized_settings_migrate_to_canonical_id() {
        let mut dir = directory();
        let local = dir.ensure_session_id(USER);
        assert!(is_local_session_id(&local));
        dir.set_autonomy(&local, AutonomyLevel::Medium);
        let header = dir.resolve(USER, None).descriptor;
        dir.link_message(msg(5), header);

        let prior = dir.resolve(USER, None).descriptor;
        assert_eq!(prior.autonomy, AutonomyLevel::Medium);
        dir.commit(USER, msg(6), Some("real-id".into()), Path::new("/home/op"), &prior, Some("go"));

        let snap = dir.snapshot();
        assert!(!snap.session_autonomy.contains_key(&local));
        assert_eq!(snap.session_autonomy.get("real-id"), Some(&AutonomyLevel::Medium));

        // The old link still resolves to the canonical session.
        let old = dir.resolve(USER, Some(msg(5))).descriptor;
        assert_eq!(old.session_id.as_deref(), Some("real-id"));
        assert_eq!(old.autonomy, AutonomyLevel::Medium);
    }

    #[test]
    fn history_is_capped() {
        let mut dir = directory();
        let fresh = dir.fresh_descriptor();
        for i in 0..(HISTORY_LIMIT as i32 + 5) {
            dir.commit(USER, msg(i), Some(format!("s{}", i)), Path::new("/a"), &fresh, None);
        }
        assert_eq!(dir.history().len(), HISTORY_LIMIT);
        assert_eq!(dir.history()[0].session_id, "s5");
    }

    #[test]
    fn switch_to_history_prefix() {
        let mut dir = directory();
        let fresh = dir.fresh_descriptor();
        dir.commit(USER, msg(1), Some("abc123".into()), Path::new("/a"), &fresh, None);
        dir.commit(USER, msg(2), Some("def456".into()), Path::new("/b"), &fresh, None);

        let entry = dir.switch_to(USER, "abc").unwrap();
        assert_eq!(entry.session_id, "abc123");
        let active = dir.resolve(USER, None).descriptor;
        assert_eq!(active.session_id.as_deref(), Some("abc123"));
        assert_eq!(active.cwd, PathBuf::from("/a"));
        assert!(dir.switch_to(USER, "zzz").is_none());
    }

    #[test]
    fn record_links_without_changing_the_active_session() {
        let mut dir = directory();
        let fresh = dir.fresh_descriptor();
        dir.commit(USER, msg(1), Some("mine".into()), Path::new("/a"), &fresh, None);

        let (linked, added) = dir.record(msg(2), Some("queued".into()), Path::new("/q"), &fresh, Some("task"));
        assert!(added);
        assert_eq!(linked.session_id.as_deref(), Some("queued"));
        assert_eq!(dir.resolve(USER, None).descriptor.session_id.as_deref(), Some("mine"));
        assert_eq!(dir.resolve(USER, Some(msg(2))).descriptor.cwd, PathBuf::from("/q"));
    }
}
