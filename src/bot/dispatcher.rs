//! Message dispatcher setup.
//!
//! Builds the dispatcher with all command handlers and callback handlers.

use std::sync::Arc;
use std::time::Duration;

use teloxide::adaptors::Throttle;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::types::User;

use crate::database::{MongoStore, MoveRequest, MoveSettings, UserRepo};
use crate::entity::CacheManager;
use crate::i18n;
use crate::interaction::{InteractionCache, InteractionRecord, TriggerListeners};
use crate::permissions::Permissions;
use crate::plugins;

/// Bot type with Throttle adaptor for automatic rate limiting.
pub type ThrottledBot = Throttle<Bot>;

/// Live-synced `/move` settings per chat.
pub type MoveSettingsCache = CacheManager<MoveSettings, MongoStore<MoveSettings>>;

/// Pending `/move` requests.
pub type MoveRequests = InteractionCache<MoveRequest, MongoStore<InteractionRecord<MoveRequest>>>;

/// Shared application state, built once in `main`.
#[derive(Clone)]
pub struct AppState {
    pub permissions: Permissions,

    /// User repository for tracking and resolving users.
    pub users: Arc<UserRepo>,

    pub move_settings: Arc<MoveSettingsCache>,

    pub move_requests: MoveRequests,

    /// Routes button presses to the interaction waiting for them.
    pub listeners: TriggerListeners,

    pub move_request_ttl: Duration,

    pub default_lang: String,
}

impl AppState {
    /// Language for replies to `user`.
    pub fn locale(&self, user: Option<&User>) -> String {
        i18n::resolve_locale(
            user.and_then(|u| u.language_code.as_deref()),
            &self.default_lang,
        )
    }
}

/// Build the dispatcher with all handlers.
pub fn build_dispatcher(
    bot: ThrottledBot,
    state: AppState,
) -> Dispatcher<ThrottledBot, anyhow::Error, teloxide::dispatching::DefaultKey> {
    Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
}

/// Build the handler schema.
fn schema() -> UpdateHandler<anyhow::Error> {
    // user tracking runs before the commands
    let message_handler = Update::filter_message()
        .inspect_async(track_user)
        .branch(plugins::command_handler());

    dptree::entry()
        .branch(message_handler)
        .branch(plugins::callback_handler())
}

async fn track_user(msg: Message, state: AppState) {
    if let Some(user) = msg.from.as_ref() {
        state.users.clone().track(user.clone());
    }
}
