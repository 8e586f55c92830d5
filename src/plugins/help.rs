//! /help command plugin.

use teloxide::prelude::*;
use teloxide::types::ParseMode;

use crate::bot::dispatcher::{AppState, ThrottledBot};
use crate::i18n::format_text;

pub async fn help_handler(bot: ThrottledBot, msg: Message, state: AppState) -> anyhow::Result<()> {
    let lang = state.locale(msg.from.as_ref());
    let minutes = (state.move_request_ttl.as_secs() / 60).to_string();

    bot.send_message(msg.chat.id, format_text(&lang, "help.text", &[("minutes", &minutes)]))
        .parse_mode(ParseMode::Html)
        .await?;

    Ok(())
}
