//! /start command plugin.

use teloxide::prelude::*;
use teloxide::types::ParseMode;

use crate::bot::dispatcher::{AppState, ThrottledBot};
use crate::i18n::get_text;

pub async fn start_handler(bot: ThrottledBot, msg: Message, state: AppState) -> anyhow::Result<()> {
    let lang = state.locale(msg.from.as_ref());

    bot.send_message(msg.chat.id, get_text(&lang, "start.text"))
        .parse_mode(ParseMode::Html)
        .await?;

    Ok(())
}
