//! Telegram transport.

pub mod client;
pub mod sink;

pub use client::{bot_from_token, run_bot};
pub use sink::TelegramSink;
