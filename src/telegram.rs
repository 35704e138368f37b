use std::sync::Arc;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ChatKind, FileId, InputFile};
use tracing::debug;

use crate::channel::{InboundMessage, Outbound, SendError};
use crate::commands;
use crate::runtime::AppState;

/// `Outbound` backed by the Bot API. Flood-wait responses surface as
/// `SendError::RetryAfter` so the pipeline can decide whether to wait.
pub struct TelegramOutbound {
    bot: Bot,
}

impl TelegramOutbound {
    pub fn new(bot: Bot) -> Self {
        TelegramOutbound { bot }
    }
}

fn map_send_error(err: teloxide::RequestError) -> SendError {
    match err {
        teloxide::RequestError::RetryAfter(secs) => {
            SendError::RetryAfter(u64::from(secs.seconds()))
        }
        other => SendError::Terminal(other.to_string()),
    }
}

#[async_trait]
impl Outbound for TelegramOutbound {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), SendError> {
        self.bot
            .send_message(ChatId(chat_id), text)
            .await
            .map(|_| ())
            .map_err(map_send_error)
    }

    async fn send_sticker(&self, chat_id: i64, file_id: &str) -> Result<(), SendError> {
        self.bot
            .send_sticker(
                ChatId(chat_id),
                InputFile::file_id(FileId(file_id.to_string())),
            )
            .await
            .map(|_| ())
            .map_err(map_send_error)
    }

    async fn show_composing(&self, chat_id: i64) {
        if let Err(err) = self
            .bot
            .send_chat_action(ChatId(chat_id), ChatAction::Typing)
            .await
        {
            debug!("Failed to show composing indicator: {err}");
        }
    }
}

pub async fn start_bot(state: Arc<AppState>, bot: Bot) {
    let handler = Update::filter_message().endpoint(handle_message);

    Dispatcher::builder(bot, handler)
        .default_handler(|_| async {})
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

/// Removes the `@username` mention; `None` when the text does not mention
/// the bot at all.
fn strip_mention(text: &str, bot_username: &str) -> Option<String> {
    let mention = format!("@{bot_username}");
    if !text.contains(&mention) {
        return None;
    }
    Some(text.replace(&mention, " ").trim().to_string())
}

async fn handle_message(
    msg: teloxide::types::Message,
    state: Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Other bots never get replies.
    if msg.from.as_ref().is_some_and(|u| u.is_bot) {
        return Ok(());
    }

    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64);
    let chat_id = msg.chat.id.0;
    let sender_name = msg
        .from
        .as_ref()
        .map(|u| u.username.clone().unwrap_or_else(|| u.first_name.clone()))
        .unwrap_or_else(|| "Unknown".into());

    let is_private = matches!(msg.chat.kind, ChatKind::Private(_));
    let text = msg.text().map(str::to_string);

    if is_private {
        if let (Some(t), Some(uid)) = (text.as_deref(), user_id) {
            if commands::is_command(t) {
                if let Some(response) = commands::handle_command(&state, uid, t).await {
                    if let Err(err) = state.outbound.send_text(chat_id, &response).await {
                        debug!("Command response failed: {err}");
                    }
                }
                return Ok(());
            }
        }

        let inbound = InboundMessage {
            user_id,
            chat_id,
            sender_name,
            text,
            is_sticker: msg.sticker().is_some(),
            is_voice_like: msg.voice().is_some()
                || msg.audio().is_some()
                || msg.video_note().is_some(),
            is_group: false,
        };
        state.pipeline.handle_private(inbound).await;
        return Ok(());
    }

    let Some(text) = text else {
        return Ok(());
    };
    let Some(query) = strip_mention(&text, &state.config.bot_username) else {
        return Ok(());
    };

    let inbound = InboundMessage {
        user_id,
        chat_id,
        sender_name,
        text: Some(query),
        is_sticker: false,
        is_voice_like: false,
        is_group: true,
    };
    state.pipeline.handle_group(inbound).await;
    Ok(())
}
