//! Configuration loading for droidgram.
//!
//! Settings come from an optional JSON file and are then overridden by the
//! environment variables the bot has always been deployed with.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::session::AutonomyLevel;

pub type Result<T> = std::result::Result<T, Error>;

/// Get the droidgram home directory (~/.droidgram).
pub fn get_home_dir() -> Result<PathBuf> {
    Ok(user_home()?.join(".droidgram"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

fn user_home() -> Result<PathBuf> {
    let dirs = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;
    Ok(dirs.home_dir().to_path_buf())
}

/// Load settings from `path` (or ~/.droidgram/settings.json), apply the
/// environment overrides and validate the result.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => get_settings_path()?,
    };

    let mut settings = if path.exists() {
        let content = std::fs::read_to_string(&path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        tracing::debug!("Loaded settings from {}", path.display());
        settings
    } else {
        tracing::debug!("No settings file at {}, using environment only", path.display());
        Settings::default()
    };

    apply_env(&mut settings, |key| std::env::var(key).ok())?;
    validate_settings(&settings)?;
    Ok(settings)
}

/// Overlay environment variables on top of file settings.
pub fn apply_env<F>(settings: &mut Settings, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(token) = get("TELEGRAM_BOT_TOKEN") {
        settings.telegram.bot_token = Some(token);
    }
    if let Some(raw) = get("TELEGRAM_ALLOWED_USER_IDS") {
        settings.telegram.allowed_user_ids = parse_allowed_users(&raw)?;
    }
    if let Some(path) = get("DROID_PATH") {
        settings.droid.path = path;
    }
    if let Some(cwd) = get("DROID_DEFAULT_CWD") {
        settings.droid.default_cwd = Some(expand_home(&cwd));
    }
    if let Some(file) = get("DROID_SESSIONS_FILE") {
        settings.storage.sessions_file = Some(expand_home(&file));
    }
    Ok(())
}

/// Parse a comma-separated list of Telegram user ids.
pub fn parse_allowed_users(raw: &str) -> Result<Vec<u64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>().map_err(|e| {
                Error::Config(format!("Invalid TELEGRAM_ALLOWED_USER_IDS entry '{}': {}", s, e))
            })
        })
        .collect()
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.telegram.bot_token.is_none() {
        return Err(Error::Config(
            "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
        ));
    }
    if settings.telegram.allowed_user_ids.is_empty() {
        tracing::warn!("No allowed users configured; every sender will be denied");
    }
    for (name, project) in &settings.projects {
        if !project.path.is_dir() {
            tracing::warn!("Project '{}' points at a missing directory: {}", name, project.path.display());
        }
    }
    Ok(())
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix('~') {
        if let Ok(home) = user_home() {
            return home.join(rest.trim_start_matches('/'));
        }
    }
    PathBuf::from(raw)
}

/// Resolve a user-supplied path argument against `base`.
///
/// Absolute paths are used as-is, `~` is expanded, anything else is relative to
/// `base`. Returns `Error::DirectoryNotFound` unless the result is a directory.
pub fn resolve_directory(arg: &str, base: &Path) -> Result<PathBuf> {
    let arg = arg.trim();
    let resolved = if arg.starts_with('/') {
        PathBuf::from(arg)
    } else if arg.starts_with('~') {
        expand_home(arg)
    } else {
        base.join(arg)
    };

    if resolved.is_dir() {
        Ok(resolved)
    } else {
        Err(Error::DirectoryNotFound(arg.to_string()))
    }
}

/// Render a path with the home directory collapsed to `~`.
pub fn display_path(path: &Path) -> String {
    let shown = path.display().to_string();
    match user_home() {
        Ok(home) => {
            let home = home.display().to_string();
            match shown.strip_prefix(&home) {
                Some(rest) if !home.is_empty() => format!("~{}", rest),
                _ => shown,
            }
        }
        Err(_) => shown,
    }
}

/// Telegram configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    #[serde(default)]
    pub allowed_user_ids: Vec<u64>,
}

/// Droid CLI configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DroidConfig {
    #[serde(default = "default_droid_path")]
    pub path: String,
    pub default_cwd: Option<PathBuf>,
    #[serde(default = "default_autonomy")]
    pub default_autonomy: AutonomyLevel,
    pub default_model: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_streaming")]
    pub streaming: bool,
}

fn default_droid_path() -> String {
    "droid".to_string()
}

fn default_autonomy() -> AutonomyLevel {
    AutonomyLevel::High
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_streaming() -> bool {
    true
}

impl Default for DroidConfig {
    fn default() -> Self {
        Self {
            path: default_droid_path(),
            default_cwd: None,
            default_autonomy: default_autonomy(),
            default_model: None,
            request_timeout_secs: default_request_timeout_secs(),
            streaming: default_streaming(),
        }
    }
}

/// Persistence configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StorageConfig {
    pub sessions_file: Option<PathBuf>,
}

/// Task queue configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QueueConfig {
    #[serde(default = "default_queue_delay_secs")]
    pub delay_secs: u64,
}

fn default_queue_delay_secs() -> u64 {
    2
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            delay_secs: default_queue_delay_secs(),
        }
    }
}

/// A named project shortcut.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ProjectConfig {
    pub path: PathBuf,
    pub autonomy: Option<AutonomyLevel>,
    pub model: Option<String>,
    #[serde(default)]
    pub git_sync: bool,
}

/// droidgram settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Settings {
    #[serde(default)]
    pub telegram: TelegramConfig,

    #[serde(default)]
    pub droid: DroidConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub projects: BTreeMap<String, ProjectConfig>,

    #[serde(default = "default_max_reply_chars")]
    pub max_reply_chars: usize,
}

fn default_max_reply_chars() -> usize {
    4000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            droid: DroidConfig::default(),
            storage: StorageConfig::default(),
            queue: QueueConfig::default(),
            projects: BTreeMap::new(),
            max_reply_chars: default_max_reply_chars(),
        }
    }
}

impl Settings {
    /// Whether `user_id` is on the allow-list. An empty list denies everyone.
    pub fn is_authorized(&self, user_id: u64) -> bool {
        self.telegram.allowed_user_ids.contains(&user_id)
    }

    /// Working directory used when a session has none.
    pub fn default_cwd(&self) -> PathBuf {
        self.droid
            .default_cwd
            .clone()
            .or_else(|| user_home().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Location of the session snapshot.
    pub fn sessions_file(&self) -> Result<PathBuf> {
        match &self.storage.sessions_file {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("sessions.json")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn env_overrides_file_settings() {
        let vars = env(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("TELEGRAM_ALLOWED_USER_IDS", "42, 7"),
            ("DROID_PATH", "/opt/droid"),
            ("DROID_DEFAULT_CWD", "/srv/code"),
        ]);
        let mut settings = Settings::default();
        apply_env(&mut settings, |k| vars.get(k).cloned()).unwrap();

        assert_eq!(settings.telegram.bot_token.as_deref(), Some("123:abc"));
        assert_eq!(settings.telegram.allowed_user_ids, vec![42, 7]);
        assert_eq!(settings.droid.path, "/opt/droid");
        assert_eq!(settings.default_cwd(), PathBuf::from("/srv/code"));
        assert!(settings.is_authorized(42));
        assert!(!settings.is_authorized(8));
    }

    #[test]
    fn malformed_allow_list_is_a_config_error() {
        let err = parse_allowed_users("42,abc").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_token_fails_validation() {
        let err = validate_settings(&Settings::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn empty_allow_list_denies_everyone() {
        let settings = Settings::default();
        assert!(!settings.is_authorized(1));
    }

    #[test]
    fn settings_file_defaults_fill_gaps() {
        let json = r#"{"projects": {"api": {"path": "/srv/api", "git_sync": true}}}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.droid.path, "droid");
        assert_eq!(settings.droid.request_timeout_secs, 300);
        assert_eq!(settings.droid.default_autonomy, AutonomyLevel::High);
        assert_eq!(settings.max_reply_chars, 4000);
        assert!(settings.projects["api"].git_sync);
    }

    #[test]
    fn resolve_directory_rejects_missing_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("app")).unwrap();

        let found = resolve_directory("app", dir.path()).unwrap();
        assert_eq!(found, dir.path().join("app"));

        let abs = dir.path().join("app").display().to_string();
        assert_eq!(resolve_directory(&abs, Path::new("/")).unwrap(), dir.path().join("app"));

        let err = resolve_directory("missing/dir", dir.path()).unwrap_err();
        assert!(matches!(err, Error::DirectoryNotFound(_)));
    }
}
