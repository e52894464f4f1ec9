//! Telegram bot client: long polling, one task per update.

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::BotCommand;

use crate::error::{Error, Result};
use crate::orchestrator::{ButtonPress, Inbound, Orchestrator, BOT_COMMANDS};

/// Build the bot from the configured token.
pub fn bot_from_token(token: Option<&str>) -> Result<Bot> {
    let token = token
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| Error::Telegram("No bot token configured".to_string()))?;
    Ok(Bot::new(token))
}

/// Run the bot until interrupted.
pub async fn run_bot(bot: Bot, orchestrator: Arc<Orchestrator>) -> Result<()> {
    tracing::info!("Starting Telegram bot...");

    let commands: Vec<BotCommand> = BOT_COMMANDS
        .iter()
        .map(|(name, description)| BotCommand::new(*name, *description))
        .collect();
    if let Err(e) = bot.set_my_commands(commands).await {
        tracing::warn!("Failed to set commands: {}", e);
    }
    tracing::info!("Telegram bot commands set");

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(on_message))
        .branch(Update::filter_callback_query().endpoint(on_callback));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![orchestrator])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    tracing::info!("Telegram bot stopped");
    Ok(())
}

/// Convert a text message; `None` for anything else.
fn inbound(msg: &Message) -> Option<Inbound> {
    let text = msg.text()?;
    let user = msg.from.as_ref()?;
    Some(Inbound {
        chat_id: msg.chat.id.0,
        message_id: msg.id.0,
        user_id: user.id.0,
        text: text.to_string(),
        reply_to: msg.reply_to_message().map(|r| r.id.0),
    })
}

// The dispatcher serializes updates per chat; handling runs in its own task
// so `/stop` can arrive while a run is in flight.
async fn on_message(msg: Message, orchestrator: Arc<Orchestrator>) -> ResponseResult<()> {
    let Some(inbound) = inbound(&msg) else {
        return Ok(());
    };
    tokio::spawn(async move {
        if let Err(e) = orchestrator.handle_message(inbound).await {
            tracing::error!("Failed to handle message: {}", e);
        }
    });
    Ok(())
}

async fn on_callback(bot: Bot, q: CallbackQuery, orchestrator: Arc<Orchestrator>) -> ResponseResult<()> {
    if let Err(e) = bot.answer_callback_query(q.id.clone()).await {
        tracing::debug!("Failed to answer callback query: {}", e);
    }

    let (Some(data), Some(message)) = (q.data.clone(), q.message.as_ref()) else {
        return Ok(());
    };
    let press = ButtonPress {
        chat_id: message.chat().id.0,
        message_id: message.id().0,
        user_id: q.from.id.0,
        data,
    };

    tokio::spawn(async move {
        if let Err(e) = orchestrator.handle_button(press).await {
            tracing::error!("Failed to handle button press: {}", e);
        }
    });
    Ok(())
}
