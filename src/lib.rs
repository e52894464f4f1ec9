//! droidgram library root.

pub mod cli;
pub mod config;
pub mod droid;
pub mod error;
pub mod git;
pub mod logging;
pub mod markdown;
pub mod orchestrator;
pub mod queue;
pub mod session;
pub mod sink;
pub mod telegram;

pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use droid::{DroidBridge, ToolRunner};
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
pub use queue::TaskQueue;
pub use session::SessionDirectory;
