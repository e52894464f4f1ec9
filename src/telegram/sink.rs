//! `ChatSink` over the Telegram Bot API.

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ParseMode, ReplyParameters};

use crate::error::Result;
use crate::sink::{Button, ChatSink, MessageRef, PostOptions, TextFormat};

pub struct TelegramSink {
    bot: Bot,
}

impl TelegramSink {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn keyboard(rows: &[Vec<Button>]) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(rows.iter().map(|row| {
        row.iter()
            .map(|b| InlineKeyboardButton::callback(b.label.clone(), b.data.clone()))
            .collect::<Vec<_>>()
    }))
}

#[async_trait]
impl ChatSink for TelegramSink {
    async fn post_message(&self, chat_id: i64, text: &str, options: PostOptions) -> Result<MessageRef> {
        let mut request = self.bot.send_message(ChatId(chat_id), text);
        if options.format == TextFormat::Html {
            request = request.parse_mode(ParseMode::Html);
        }
        if let Some(reply_to) = options.reply_to {
            request = request.reply_parameters(ReplyParameters::new(MessageId(reply_to)));
        }
        if !options.buttons.is_empty() {
            request = request.reply_markup(keyboard(&options.buttons));
        }

        let sent = request.await?;
        Ok(MessageRef::new(sent.chat.id.0, sent.id.0))
    }

    async fn edit_message(&self, message: MessageRef, text: &str) -> Result<()> {
        self.bot
            .edit_message_text(ChatId(message.chat_id), MessageId(message.message_id), text)
            .await?;
        Ok(())
    }

    async fn delete_message(&self, message: MessageRef) -> Result<()> {
        self.bot
            .delete_message(ChatId(message.chat_id), MessageId(message.message_id))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buttons_become_callback_rows() {
        let markup = keyboard(&[vec![Button::new("✓ Allow", "perm_allow_1"), Button::new("✗ Deny", "perm_deny_1")]]);
        assert_eq!(markup.inline_keyboard.len(), 1);
        assert_eq!(markup.inline_keyboard[0].len(), 2);
        assert_eq!(markup.inline_keyboard[0][1].text, "✗ Deny");
    }
}
