//! Ping command plugin.
//!
//! Measures and displays Telegram API latency.

use std::time::Instant;

use teloxide::prelude::*;
use teloxide::types::{ParseMode, ReplyParameters};

use crate::bot::dispatcher::{AppState, ThrottledBot};
use crate::i18n::format_text;

pub async fn ping_command(bot: ThrottledBot, msg: Message, state: AppState) -> anyhow::Result<()> {
    // getMe is the lightest call there is
    let start = Instant::now();
    let _ = bot.get_me().await;
    let ms = start.elapsed().as_millis();

    let text = format_text(
        &state.locale(msg.from.as_ref()),
        "ping.pong",
        &[("emoji", latency_emoji(ms)), ("ms", &ms.to_string())],
    );

    bot.send_message(msg.chat.id, text)
        .parse_mode(ParseMode::Html)
        .reply_parameters(ReplyParameters::new(msg.id))
        .await?;

    Ok(())
}

fn latency_emoji(ms: u128) -> &'static str {
    match ms {
        0..100 => "🟢",
        100..300 => "🟡",
        _ => "🔴",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grades_latency() {
        assert_eq!(latency_emoji(42), "🟢");
        assert_eq!(latency_emoji(100), "🟡");
        assert_eq!(latency_emoji(1500), "🔴");
    }
}
