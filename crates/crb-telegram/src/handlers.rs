//! Telegram update handlers.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};

use crb_core::{
    domain::{ChatId, UserId},
    messaging::types::IncomingText,
};

use crate::router::AppState;

/// Convert a Telegram message into the core's text message. Non-text messages and
/// messages without a sender (channel posts) yield `None`.
pub fn to_incoming(msg: &Message) -> Option<IncomingText> {
    let user = msg.from()?;
    let text = msg.text()?;
    Some(IncomingText {
        chat_id: ChatId(msg.chat.id.0),
        user_id: UserId(user.id.0 as i64),
        username: user.username.clone(),
        text: text.to_string(),
    })
}

pub async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(incoming) = to_incoming(&msg) else {
        return Ok(());
    };

    // The router classifies and logs every failure itself; nothing propagates to teloxide.
    state.router.handle(&incoming).await;
    Ok(())
}
