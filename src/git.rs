//! Git plumbing around droid exchanges: status summary, `/git` passthrough and
//! pull/commit/push sync. Every call spawns `git` directly, never a shell.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Ceiling for `/git` passthrough commands.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Ceiling for the quick status probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Ceiling for pull/push during sync.
const SYNC_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// Stdout, else stderr, else a placeholder.
    pub fn text(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        if !stdout.is_empty() {
            stdout.to_string()
        } else if !stderr.is_empty() {
            stderr.to_string()
        } else {
            "(no output)".to_string()
        }
    }
}

/// Run `git <args>` in `cwd`.
pub async fn run_git<S: AsRef<str>>(args: &[S], cwd: &Path, timeout: Duration) -> Result<GitOutput> {
    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    let output = tokio::time::timeout(
        timeout,
        Command::new("git")
            .args(&args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| Error::Git(format!("git {} timed out", args.first().copied().unwrap_or(""))))?
    .map_err(|e| Error::Git(format!("failed to run git: {}", e)))?;

    Ok(GitOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitStatus {
    NotARepo,
    Clean { branch: String },
    Dirty { branch: String, changes: usize },
    Unknown(String),
}

impl GitStatus {
    /// One-line summary used in headers, e.g. `⚠️ Git: on main (3 uncommitted)`.
    pub fn line(&self) -> String {
        match self {
            GitStatus::NotARepo => "Git: Not a git repo".to_string(),
            GitStatus::Clean { branch } => format!("✓ Git: on {} (clean)", branch),
            GitStatus::Dirty { branch, changes } => {
                format!("⚠️ Git: on {} ({} uncommitted)", branch, changes)
            }
            GitStatus::Unknown(e) => format!("Git: git error: {}", e),
        }
    }
}

pub async fn status(cwd: &Path) -> GitStatus {
    match probe_status(cwd).await {
        Ok(status) => status,
        Err(e) => GitStatus::Unknown(e.to_string()),
    }
}

async fn probe_status(cwd: &Path) -> Result<GitStatus> {
    if !run_git(&["rev-parse", "--git-dir"], cwd, PROBE_TIMEOUT).await?.success {
        return Ok(GitStatus::NotARepo);
    }
    let branch = run_git(&["branch", "--show-current"], cwd, PROBE_TIMEOUT).await?;
    let branch = match branch.stdout.trim() {
        "" => "detached HEAD".to_string(),
        b => b.to_string(),
    };
    let porcelain = run_git(&["status", "--porcelain"], cwd, PROBE_TIMEOUT).await?;
    let changes = porcelain.stdout.lines().filter(|l| !l.trim().is_empty()).count();
    Ok(if changes == 0 {
        GitStatus::Clean { branch }
    } else {
        GitStatus::Dirty { branch, changes }
    })
}

/// `git pull --ff-only`.
pub async fn pull(cwd: &Path) -> Result<String> {
    let out = run_git(&["pull", "--ff-only"], cwd, SYNC_TIMEOUT).await?;
    if !out.success {
        return Err(Error::Git(format!("pull failed: {}", out.text())));
    }
    Ok(out.text())
}

/// Stage everything, commit with `droid: <summary>` and push. A clean tree
/// is reported, not treated as an error.
pub async fn commit_and_push(cwd: &Path, summary: &str) -> Result<String> {
    let add = run_git(&["add", "-A"], cwd, PROBE_TIMEOUT).await?;
    if !add.success {
        return Err(Error::Git(format!("add failed: {}", add.text())));
    }

    let staged = run_git(&["diff", "--cached", "--quiet"], cwd, PROBE_TIMEOUT).await?;
    if staged.success {
        return Ok("Nothing to commit".to_string());
    }

    let message = format!("droid: {}", commit_summary(summary));
    let commit = run_git(&["commit", "-m", message.as_str()], cwd, SYNC_TIMEOUT).await?;
    if !commit.success {
        return Err(Error::Git(format!("commit failed: {}", commit.text())));
    }

    let push = run_git(&["push"], cwd, SYNC_TIMEOUT).await?;
    if !push.success {
        return Err(Error::Git(format!("push failed: {}", push.text())));
    }
    Ok(format!("Committed and pushed: {}", message))
}

/// First line of the task, capped for a commit subject.
fn commit_summary(task: &str) -> String {
    let line = task.lines().next().unwrap_or("").trim();
    if line.chars().count() > 60 {
        format!("{}...", line.chars().take(60).collect::<String>())
    } else if line.is_empty() {
        "update".to_string()
    } else {
        line.to_string()
    }
}

/// Cap `/git` output for a chat message.
pub fn truncate_output(output: &str, limit: usize) -> String {
    if output.chars().count() > limit {
        format!("{}\n\n[truncated]", output.chars().take(limit).collect::<String>())
    } else {
        output.to_string()
    }
}
