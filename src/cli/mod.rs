//! CLI commands for droidgram using clap.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{display_path, load_settings, Settings};
use crate::droid::{DroidBridge, ProcessRegistry, ToolRunner};
use crate::orchestrator::Orchestrator;
use crate::session::{short_session_id, SnapshotStore};
use crate::telegram::{bot_from_token, run_bot, TelegramSink};

/// droidgram - Telegram remote control for the Droid CLI.
#[derive(Parser, Debug)]
#[command(name = "droidgram")]
#[command(version)]
#[command(about = "Drive the Droid coding agent from Telegram", long_about = None)]
pub struct Commands {
    /// Settings file (default ~/.droidgram/settings.json)
    #[arg(long, global = true, env = "DROIDGRAM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for log files
    #[arg(long, global = true, env = "DROID_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start the bot (default)
    Run,

    /// Validate settings and report the droid version
    Check,

    /// Print the persisted session history
    Sessions,
}

impl Commands {
    pub async fn run(self) -> Result<()> {
        let settings = load_settings(self.config.as_deref()).context("Failed to load settings")?;
        match self.command.unwrap_or(Command::Run) {
            Command::Run => run(settings).await,
            Command::Check => check(settings).await,
            Command::Sessions => sessions(&settings),
        }
    }
}

async fn run(settings: Settings) -> Result<()> {
    let registry = Arc::new(ProcessRegistry::new());
    let bridge = Arc::new(DroidBridge::new(settings.droid.path.clone(), registry.clone()));
    match bridge.version().await {
        Some(version) => tracing::info!("Droid CLI: {}", version),
        None => tracing::warn!("Droid CLI not found at '{}'", settings.droid.path),
    }

    let bot = bot_from_token(settings.telegram.bot_token.as_deref())?;
    let store = SnapshotStore::new(settings.sessions_file()?);
    tracing::info!("Sessions file: {}", store.path().display());
    tracing::info!("Default directory: {}", settings.default_cwd().display());

    let sink = Arc::new(TelegramSink::new(bot.clone()));
    let orchestrator = Arc::new(Orchestrator::new(settings, store, registry, bridge, sink));
    run_bot(bot, orchestrator).await?;
    Ok(())
}

async fn check(settings: Settings) -> Result<()> {
    let bridge = DroidBridge::new(settings.droid.path.clone(), Arc::new(ProcessRegistry::new()));

    println!("✓ Bot token configured");
    if settings.telegram.allowed_user_ids.is_empty() {
        println!("⚠ No allowed users; every sender will be denied");
    } else {
        println!("✓ Allowed users: {}", settings.telegram.allowed_user_ids.len());
    }
    println!("  Default directory: {}", display_path(&settings.default_cwd()));
    println!("  Default autonomy: {}", settings.droid.default_autonomy);
    println!("  Sessions file: {}", settings.sessions_file()?.display());
    for (name, project) in &settings.projects {
        let marker = if project.path.is_dir() { "✓" } else { "✗" };
        println!("  {} project {} → {}", marker, name, display_path(&project.path));
    }

    match bridge.version().await {
        Some(version) => {
            println!("✓ Droid: {}", version);
            Ok(())
        }
        None => anyhow::bail!("droid CLI not found at '{}'", bridge.cli_path()),
    }
}

fn sessions(settings: &Settings) -> Result<()> {
    let snapshot = SnapshotStore::new(settings.sessions_file()?).load();
    if snapshot.session_history.is_empty() {
        println!("No sessions yet.");
        return Ok(());
    }

    for entry in snapshot.session_history.iter().rev() {
        println!(
            "{}  {}  {}  {}",
            short_session_id(&entry.session_id),
            entry.started_at.format("%Y-%m-%d %H:%M"),
            display_path(&entry.cwd),
            entry.first_message.as_deref().unwrap_or("")
        );
    }
    println!("\n{} linked messages", snapshot.sessions.len());
    Ok(())
}
