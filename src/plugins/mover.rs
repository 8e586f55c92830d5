//! `/move` and `/movesettings`.
//!
//! `/move <member> [destination chat id]` asks a member, in a private
//! message, whether they want to join a chat the requester is in and they are
//! not. Accepting sends them a one-use invite link. The request waits on the
//! prompt's two buttons until it is answered or expires.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, Me, MessageId, ParseMode, ReplyParameters,
};
use tracing::{debug, info, warn};

use crate::bot::dispatcher::{AppState, ThrottledBot};
use crate::database::{MoveRequest, MoveSettings};
use crate::i18n::{format_text, get_text};
use crate::interaction::{Continuation, Interaction, TriggerKey};
use crate::permissions::Permissions;
use crate::utils::{html_escape, mention_html, resolve_target};

const CALLBACK_PREFIX: &str = "move:";
const ACCEPT: &str = "accept";
const REJECT: &str = "reject";

/// Action of a `move:<action>` callback.
pub fn parse_callback(data: &str) -> Option<&str> {
    data.strip_prefix(CALLBACK_PREFIX)
        .filter(|action| matches!(*action, ACCEPT | REJECT))
}

fn callback_data(action: &str) -> String {
    format!("{}{}", CALLBACK_PREFIX, action)
}

async fn reply(bot: &ThrottledBot, msg: &Message, text: String) -> anyhow::Result<()> {
    bot.send_message(msg.chat.id, text)
        .parse_mode(ParseMode::Html)
        .reply_parameters(ReplyParameters::new(msg.id))
        .await?;
    Ok(())
}

/// Handle /move.
pub async fn move_command(
    bot: ThrottledBot,
    msg: Message,
    state: AppState,
    me: Me,
    args: String,
) -> anyhow::Result<()> {
    let Some(requester) = msg.from.as_ref() else {
        return Ok(());
    };
    let lang = state.locale(Some(requester));

    if msg.chat.is_private() {
        return reply(&bot, &msg, get_text(&lang, "common.group_only")).await;
    }

    let settings = state.move_settings.fetch(&msg.chat.id.0).await?;
    if !settings.value().is_some_and(|s| s.enabled) {
        debug!("Ignoring /move in chat {}, feature disabled", msg.chat.id);
        return Ok(());
    }

    if args.trim().is_empty() && msg.reply_to_message().is_none() {
        return reply(&bot, &msg, get_text(&lang, "move.usage")).await;
    }

    let Some(target) = resolve_target(&bot, &msg, &state.users).await else {
        return reply(&bot, &msg, get_text(&lang, "move.no_target")).await;
    };
    if target.id == requester.id {
        return reply(&bot, &msg, get_text(&lang, "move.self")).await;
    }

    let destination = match args.split_whitespace().nth(target.consumed) {
        None => msg.chat.id,
        Some(raw) => match raw.parse::<i64>() {
            Ok(id) => ChatId(id),
            Err(_) => {
                let text = format_text(&lang, "move.bad_destination", &[("chat", &html_escape(raw))]);
                return reply(&bot, &msg, text).await;
            }
        },
    };

    let title = match bot.get_chat(destination).await {
        Ok(chat) => chat.title().unwrap_or("chat").to_string(),
        Err(e) => {
            debug!("Destination {} not reachable: {}", destination, e);
            let text = format_text(
                &lang,
                "move.unknown_destination",
                &[("chat", &destination.0.to_string())],
            );
            return reply(&bot, &msg, text).await;
        }
    };
    let chat = html_escape(&title);
    let target_mention = mention_html(target.id.0, &target.name);

    if !state.permissions.is_member(destination, requester.id).await? {
        let text = format_text(&lang, "move.requester_not_member", &[("chat", &chat)]);
        return reply(&bot, &msg, text).await;
    }
    if state.permissions.is_member(destination, target.id).await? {
        let text = format_text(
            &lang,
            "move.already_member",
            &[("target", &target_mention), ("chat", &chat)],
        );
        return reply(&bot, &msg, text).await;
    }
    if !state.permissions.can_invite_users(destination, me.id).await? {
        let text = format_text(&lang, "move.bot_cannot_invite", &[("chat", &chat)]);
        return reply(&bot, &msg, text).await;
    }

    let keyboard = InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback(get_text(&lang, "move.accept_btn"), callback_data(ACCEPT)),
        InlineKeyboardButton::callback(get_text(&lang, "move.reject_btn"), callback_data(REJECT)),
    ]]);
    let prompt_text = format_text(
        &lang,
        "move.prompt",
        &[
            ("requester", &mention_html(requester.id.0, &requester.first_name)),
            ("chat", &chat),
        ],
    );
    let prompt = match bot
        .send_message(target.id, prompt_text)
        .parse_mode(ParseMode::Html)
        .reply_markup(keyboard)
        .await
    {
        Ok(prompt) => prompt,
        Err(e) => {
            debug!("Couldn't DM user {}: {}", target.id, e);
            let text = format_text(
                &lang,
                "move.dm_failed",
                &[("target", &target_mention), ("chat", &chat)],
            );
            return reply(&bot, &msg, text).await;
        }
    };

    let deadline = Utc::now() + chrono::Duration::from_std(state.move_request_ttl)?;
    let request = MoveRequest {
        source_chat_id: msg.chat.id.0,
        destination_chat_id: destination.0,
        destination_title: title,
        requester_id: requester.id.0,
        requester_name: requester.first_name.clone(),
        target_id: target.id.0,
        target_name: target.name.clone(),
        prompt_message_id: prompt.id.0,
        lang: lang.clone(),
    };

    let interaction = match state.move_requests.create(deadline, request).await {
        Ok(interaction) => interaction,
        Err(e) => {
            let _ = bot.delete_message(prompt.chat.id, prompt.id).await;
            return Err(e.into());
        }
    };
    let keys = [ACCEPT, REJECT].map(|action| TriggerKey {
        chat_id: prompt.chat.id.0,
        message_id: prompt.id.0,
        user_id: target.id.0,
        action: action.to_string(),
    });
    interaction.listen(keys).await?;

    info!(
        "Move request {} by {} for {} into {}",
        interaction.id(),
        requester.id,
        target.id,
        destination
    );

    let text = format_text(&lang, "move.sent", &[("target", &target_mention), ("chat", &chat)]);
    reply(&bot, &msg, text).await
}

/// Handle /movesettings.
pub async fn movesettings_command(
    bot: ThrottledBot,
    msg: Message,
    state: AppState,
    args: String,
) -> anyhow::Result<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let lang = state.locale(Some(user));

    if msg.chat.is_private() {
        return reply(&bot, &msg, get_text(&lang, "common.group_only")).await;
    }

    let chat_id = msg.chat.id;
    let settings = state.move_settings.fetch(&chat_id.0).await?;
    let current = settings.value();
    let enabled = current.as_ref().is_some_and(|s| s.enabled);

    let wanted = match args.trim().to_lowercase().as_str() {
        "" => {
            let key = if enabled { "movesettings.status_on" } else { "movesettings.status_off" };
            return reply(&bot, &msg, get_text(&lang, key)).await;
        }
        "on" | "yes" | "enable" => true,
        "off" | "no" | "disable" => false,
        _ => return reply(&bot, &msg, get_text(&lang, "movesettings.usage")).await,
    };

    if !state.permissions.can_change_info(chat_id, user.id).await? {
        return reply(&bot, &msg, get_text(&lang, "common.no_permission")).await;
    }

    let updated = MoveSettings::new(chat_id.0, wanted);
    // the feed echo of this write is coalesced against the local value
    settings.update(wanted.then(|| updated.clone()));
    if let Err(e) = updated.save(state.move_settings.store().as_ref()).await {
        settings.update(current);
        return Err(e.into());
    }

    info!("User {} set /move to {} in chat {}", user.id, wanted, chat_id);
    let key = if wanted { "movesettings.enabled" } else { "movesettings.disabled" };
    reply(&bot, &msg, get_text(&lang, key)).await
}

/// Handle `move:*` button presses.
pub async fn move_callback(bot: ThrottledBot, q: CallbackQuery, state: AppState) -> anyhow::Result<()> {
    let action = q.data.as_deref().and_then(parse_callback).unwrap_or_default();
    let lang = state.locale(Some(&q.from));

    let handled = match &q.message {
        Some(message) => {
            let key = TriggerKey {
                chat_id: message.chat().id.0,
                message_id: message.id().0,
                user_id: q.from.id.0,
                action: action.to_string(),
            };
            state.listeners.dispatch(key).await
        }
        None => false,
    };

    if handled {
        bot.answer_callback_query(&q.id).await?;
    } else {
        bot.answer_callback_query(&q.id)
            .text(get_text(&lang, "move.expired"))
            .await?;
    }
    Ok(())
}

/// How a move request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Accepted,
    Rejected,
    Failed,
}

impl Outcome {
    fn message_key(self) -> &'static str {
        match self {
            Outcome::Accepted => "move.accepted",
            Outcome::Rejected => "move.rejected",
            Outcome::Failed => "move.failed",
        }
    }

    fn word_key(self) -> &'static str {
        match self {
            Outcome::Accepted => "move.outcome_accepted",
            Outcome::Rejected => "move.outcome_rejected",
            Outcome::Failed => "move.outcome_failed",
        }
    }
}

/// Second half of `/move`, run when the target presses a button.
pub struct MoveContinuation {
    bot: ThrottledBot,
    permissions: Permissions,
}

impl MoveContinuation {
    pub fn new(bot: ThrottledBot, permissions: Permissions) -> Self {
        Self { bot, permissions }
    }
}

impl Continuation<MoveRequest> for MoveContinuation {
    fn resume(
        &self,
        interaction: Interaction<MoveRequest>,
        trigger: TriggerKey,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        let bot = self.bot.clone();
        let permissions = self.permissions.clone();
        async move {
            let Some(request) = interaction.payload() else {
                return Ok(());
            };
            finish(&bot, &permissions, &request, interaction.expires_at(), &trigger.action).await;
            Ok(())
        }
        .boxed()
    }
}

async fn finish(
    bot: &ThrottledBot,
    permissions: &Permissions,
    request: &MoveRequest,
    expires_at: DateTime<Utc>,
    action: &str,
) {
    let target = UserId(request.target_id);
    let lang = request.lang.as_str();

    if let Err(e) = bot
        .delete_message(target, MessageId(request.prompt_message_id))
        .await
    {
        debug!("Couldn't delete move prompt for {}: {}", target, e);
    }

    let outcome = if action != ACCEPT {
        Outcome::Rejected
    } else {
        match send_invite(bot, request, expires_at).await {
            Ok(()) => {
                permissions.invalidate(ChatId(request.destination_chat_id), target);
                Outcome::Accepted
            }
            Err(e) => {
                warn!(
                    "Couldn't invite {} into {}: {}",
                    target, request.destination_chat_id, e
                );
                Outcome::Failed
            }
        }
    };
    info!("Move request for {} {:?}", target, outcome);

    let chat = html_escape(&request.destination_title);
    let result = format_text(lang, outcome.message_key(), &[("chat", &chat)]);
    if let Err(e) = bot.send_message(target, result).parse_mode(ParseMode::Html).await {
        debug!("Couldn't tell {} the outcome: {}", target, e);
    }

    let report = format_text(
        lang,
        "move.report",
        &[
            ("target", &mention_html(request.target_id, &request.target_name)),
            ("chat", &chat),
            ("outcome", &get_text(lang, outcome.word_key())),
        ],
    );
    if let Err(e) = bot
        .send_message(ChatId(request.source_chat_id), report)
        .parse_mode(ParseMode::Html)
        .await
    {
        warn!("Couldn't report move outcome to {}: {}", request.source_chat_id, e);
    }
}

/// DM the target a one-use invite link valid until the request's deadline.
async fn send_invite(
    bot: &ThrottledBot,
    request: &MoveRequest,
    expires_at: DateTime<Utc>,
) -> anyhow::Result<()> {
    let link = bot
        .create_chat_invite_link(ChatId(request.destination_chat_id))
        .member_limit(1)
        .expire_date(expires_at)
        .await?;

    let button = InlineKeyboardButton::url(
        format_text(
            &request.lang,
            "move.invite_btn",
            &[("chat", &request.destination_title)],
        ),
        link.invite_link.parse()?,
    );
    let text = format_text(
        &request.lang,
        "move.invite",
        &[("chat", &html_escape(&request.destination_title))],
    );

    bot.send_message(UserId(request.target_id), text)
        .parse_mode(ParseMode::Html)
        .reply_markup(InlineKeyboardMarkup::new(vec![vec![button]]))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_only_known_actions() {
        assert_eq!(parse_callback("move:accept"), Some(ACCEPT));
        assert_eq!(parse_callback("move:reject"), Some(REJECT));
        assert_eq!(parse_callback("move:explode"), None);
        assert_eq!(parse_callback("help:move"), None);
        assert_eq!(parse_callback(&callback_data(ACCEPT)), Some(ACCEPT));
    }

    #[test]
    fn every_outcome_is_translated() {
        for outcome in [Outcome::Accepted, Outcome::Rejected, Outcome::Failed] {
            for lang in ["en", "id"] {
                assert_ne!(get_text(lang, outcome.message_key()), outcome.message_key());
                assert_ne!(get_text(lang, outcome.word_key()), outcome.word_key());
            }
        }
    }
}
