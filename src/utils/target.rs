//! Target resolution for commands that act on a user.

use teloxide::prelude::*;
use teloxide::types::{Message, MessageEntityKind, UserId};

use super::command_args;
use crate::bot::dispatcher::ThrottledBot;
use crate::database::UserRepo;

/// User a command acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: UserId,
    pub name: String,
    /// Command arguments used up to name the target.
    pub consumed: usize,
}

impl Target {
    fn new(id: UserId, name: impl Into<String>, consumed: usize) -> Self {
        Self {
            id,
            name: name.into(),
            consumed,
        }
    }
}

/// Find the target of `msg`, tried in order:
/// 1. the author of the replied-to message
/// 2. a numeric user id argument
/// 3. a text mention near the command
/// 4. an `@username` known to the users repo, then to Telegram
pub async fn resolve_target(bot: &ThrottledBot, msg: &Message, users: &UserRepo) -> Option<Target> {
    if let Some(user) = msg.reply_to_message().and_then(|reply| reply.from.as_ref()) {
        return Some(Target::new(user.id, user.first_name.clone(), 0));
    }

    let text = msg.text()?;
    let arg = *command_args(text).first()?;

    if let Ok(id) = arg.parse::<u64>() {
        let name = match users.get_by_id(id).await {
            Ok(Some(user)) => user.first_name,
            _ => format!("User {}", id),
        };
        return Some(Target::new(UserId(id), name, 1));
    }

    let mentioned = msg.entities().into_iter().flatten().find_map(|entity| match &entity.kind {
        // only entities right after the command
        MessageEntityKind::TextMention { user } if entity.offset < 20 => Some((user, entity)),
        _ => None,
    });
    if let Some((user, entity)) = mentioned {
        let consumed = args_through(text, entity.offset + entity.length);
        return Some(Target::new(user.id, user.first_name.clone(), consumed));
    }

    if arg.starts_with('@') {
        if let Ok(Some(user)) = users.get_by_username(arg).await {
            return Some(Target::new(UserId(user.user_id), user.first_name, 1));
        }
        // not tracked yet, ask Telegram
        if let Ok(chat) = bot.get_chat(arg.to_string()).await {
            if chat.is_private() {
                let name = chat.first_name().unwrap_or("User").to_string();
                return Some(Target::new(UserId(chat.id.0 as u64), name, 1));
            }
        }
    }

    None
}

/// How many command arguments lie within the first `utf16_end` UTF-16 units
/// of `text`. Mention spans are measured that way, and a mention of a
/// multi-word name covers several arguments.
fn args_through(text: &str, utf16_end: usize) -> usize {
    let mut units = 0;
    let end = text
        .char_indices()
        .find_map(|(index, ch)| {
            let at = (units >= utf16_end).then_some(index);
            units += ch.len_utf16();
            at
        })
        .unwrap_or(text.len());
    command_args(&text[..end]).len().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_word_mention_covers_every_word() {
        // "Jane Doe" starts at 6 and is 8 units long
        assert_eq!(args_through("/move Jane Doe -100123", 14), 2);
        assert_eq!(args_through("/move Jane Doe", 14), 2);
        assert_eq!(args_through("/move Jane -100123", 10), 1);
    }

    #[test]
    fn mention_span_counts_utf16_units() {
        // the crab is one char but two UTF-16 units
        let text = "/move 🦀 Crab -100123";
        assert_eq!(args_through(text, 6 + 2 + 1 + 4), 2);
        assert_eq!(args_through(text, 6 + 2), 1);
    }
}
