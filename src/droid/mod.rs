//! Bridge to the `droid` CLI.
//!
//! - `events`: one stdout line to an optional typed event
//! - `bridge`: subprocess spawn, streaming fold and answer recovery
//! - `registry`: running processes by run key, for cancellation

pub mod bridge;
pub mod events;
pub mod registry;

pub use bridge::DroidBridge;
pub use events::ToolEvent;
pub use registry::{ProcessRegistry, Registration, RunKey, StopOutcome};

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::session::AutonomyLevel;
use crate::sink::{ChatSink, MessageRef};

/// Where live tool-call status is rendered while a run is in flight.
#[derive(Clone)]
pub struct StatusTarget {
    pub sink: Arc<dyn ChatSink>,
    pub message: MessageRef,
    /// First line of the status text, e.g. `Working... (continuing)`.
    pub header: String,
}

/// One invocation of the external tool.
#[derive(Clone)]
pub struct RunRequest {
    pub key: RunKey,
    pub task: String,
    /// Canonical session id to continue; `None` starts a new session.
    pub continuation_id: Option<String>,
    pub cwd: PathBuf,
    pub autonomy: AutonomyLevel,
    pub model: Option<String>,
    pub status: Option<StatusTarget>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    pub final_text: String,
    pub session_id: Option<String>,
    /// The answer is an error report (error event or stderr-only output).
    pub errored: bool,
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run one task to completion. Tool-level failures come back inside the
    /// outcome; `Err` means the tool could not be run at all.
    async fn run(&self, request: RunRequest) -> Result<RunOutcome>;

    /// Version string reported by the tool, if it can be queried.
    async fn version(&self) -> Option<String>;
}
