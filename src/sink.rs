//! Notification sink: the three chat primitives the core relies on.
//!
//! The Telegram implementation lives in `telegram::sink`; everything else only
//! sees this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::markdown::markdown_to_html;

/// Reference to a sent or received chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i32,
}

impl MessageRef {
    pub fn new(chat_id: i64, message_id: i32) -> Self {
        Self { chat_id, message_id }
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chat_id, self.message_id)
    }
}

impl FromStr for MessageRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (chat, message) = s
            .split_once(':')
            .ok_or_else(|| Error::Other(format!("Invalid message reference: {}", s)))?;
        let chat_id = chat
            .parse()
            .map_err(|_| Error::Other(format!("Invalid chat id in message reference: {}", s)))?;
        let message_id = message
            .parse()
            .map_err(|_| Error::Other(format!("Invalid message id in message reference: {}", s)))?;
        Ok(Self { chat_id, message_id })
    }
}

impl From<MessageRef> for String {
    fn from(r: MessageRef) -> Self {
        r.to_string()
    }
}

impl TryFrom<String> for MessageRef {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Inline button attached to a posted message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// Markup language of a posted message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TextFormat {
    #[default]
    Plain,
    Html,
}

/// Options for `ChatSink::post_message`.
#[derive(Clone, Debug, Default)]
pub struct PostOptions {
    pub format: TextFormat,
    /// Message id in the same chat to reply to.
    pub reply_to: Option<i32>,
    /// Rows of inline buttons.
    pub buttons: Vec<Vec<Button>>,
}

impl PostOptions {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn html() -> Self {
        Self {
            format: TextFormat::Html,
            ..Self::default()
        }
    }

    pub fn reply_to(mut self, message_id: i32) -> Self {
        self.reply_to = Some(message_id);
        self
    }

    pub fn with_buttons(mut self, buttons: Vec<Vec<Button>>) -> Self {
        self.buttons = buttons;
        self
    }
}

#[async_trait]
pub trait ChatSink: Send + Sync {
    /// Post a new message and return its reference.
    async fn post_message(&self, chat_id: i64, text: &str, options: PostOptions) -> Result<MessageRef>;

    /// Replace the text of an existing message (plain text).
    async fn edit_message(&self, message: MessageRef, text: &str) -> Result<()>;

    /// Delete a message.
    async fn delete_message(&self, message: MessageRef) -> Result<()>;
}

/// Post markdown as HTML, falling back to the raw text when the sink rejects
/// the markup.
pub async fn post_formatted(
    sink: &dyn ChatSink,
    chat_id: i64,
    markdown: &str,
    reply_to: Option<i32>,
) -> Result<MessageRef> {
    let html = markdown_to_html(markdown);
    let mut options = PostOptions::html();
    options.reply_to = reply_to;

    match sink.post_message(chat_id, &html, options).await {
        Ok(message) => Ok(message),
        Err(e) => {
            tracing::warn!("HTML reply rejected, sending plain text: {}", e);
            let mut options = PostOptions::plain();
            options.reply_to = reply_to;
            sink.post_message(chat_id, markdown, options).await
        }
    }
}
