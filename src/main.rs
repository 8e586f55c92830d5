//! Tether - Telegram group bot on a live-synced entity cache.
//!
//! ## Architecture
//!
//! - `sync` - Event hub fed by the MongoDB change stream, per-key sync streams
//! - `entity` - Entity wrappers and the single-flight cache manager
//! - `interaction` - Expiring, trigger-resolved command continuations
//! - `database` - MongoDB stores, change feed, models
//! - `cache` - Moka lookup caches for Telegram API answers
//! - `permissions` - Admin and membership checks
//! - `bot` - Dispatcher and runtime (with Throttle for API rate limiting)
//! - `plugins` - Command handlers
//! - `i18n` - Embedded translations
//! - `utils` - Utility functions

mod bot;
mod cache;
mod config;
mod database;
mod entity;
mod i18n;
mod interaction;
mod permissions;
mod plugins;
mod sync;
mod utils;

use std::sync::Arc;

use teloxide::adaptors::throttle::Limits;
use teloxide::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bot::AppState;
use config::Config;
use database::{Database, MongoStore, MoveRequest, MoveSettings, UserRepo, open_change_feed};
use entity::{CacheManager, Record};
use interaction::{InteractionCache, InteractionRecord, TriggerListeners};
use permissions::Permissions;
use plugins::mover::MoveContinuation;
use sync::{EventHub, Synchronizer};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // RUST_LOG overrides the default filter
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tether=info,teloxide=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting Tether bot...");

    let config = Config::from_env();
    info!("Configuration loaded successfully");

    info!("Connecting to MongoDB...");
    let db = Database::connect(&config.mongodb_uri, &config.mongodb_database).await?;

    // The feed must be open before anything is loaded, or early writes are missed.
    let watched = [MoveSettings::COLLECTION, InteractionRecord::<MoveRequest>::COLLECTION];
    let feed = open_change_feed(&db, &watched).await?;
    let hub = EventHub::new(config.change_feed_capacity);
    hub.initialize(feed)?;

    let settings_sync = Arc::new(Synchronizer::for_record(Arc::clone(&hub)));
    settings_sync.initialize()?;
    let requests_sync = Arc::new(Synchronizer::for_record(Arc::clone(&hub)));
    requests_sync.initialize()?;

    let move_settings = Arc::new(CacheManager::new(
        Arc::new(MongoStore::<MoveSettings>::new(&db)),
        settings_sync,
    ));

    // Throttle respects Telegram's rate limits
    let bot = Bot::new(&config.bot_token).throttle(Limits::default());
    let me = bot.get_me().await?;
    let bot_username = config
        .bot_username
        .clone()
        .unwrap_or_else(|| me.username().to_string());
    info!("Using bot username: @{}", bot_username);

    if config.owner_ids.is_empty() {
        info!("No owner IDs configured (OWNER_IDS is empty)");
    } else {
        info!("Bot owners: {:?}", config.owner_ids);
    }

    let permissions = Permissions::new(bot.inner().clone(), config.owner_ids.clone());
    let listeners = TriggerListeners::new();
    let move_requests = InteractionCache::new(
        Arc::new(MongoStore::<InteractionRecord<MoveRequest>>::new(&db)),
        requests_sync,
        listeners.clone(),
        Arc::new(MoveContinuation::new(bot.clone(), permissions.clone())),
    );
    move_requests.restore().await?;

    let state = AppState {
        permissions,
        users: Arc::new(UserRepo::new(&db)),
        move_settings,
        move_requests,
        listeners,
        move_request_ttl: config.move_request_ttl,
        default_lang: config.default_lang.clone(),
    };

    let dispatcher = bot::build_dispatcher(bot, state);
    let result = bot::run(dispatcher, Arc::clone(&hub)).await;

    hub.shutdown();
    info!("Tether stopped");
    result
}
