//! Users seen by the bot, for resolving `@username` and id targets.
//!
//! Lookups go through two moka caches (by id, and lowercase username to id)
//! before touching the `users` collection.

use std::sync::Arc;
use std::time::Duration;

use mongodb::Collection;
use mongodb::bson::{Document, doc};
use mongodb::options::ReplaceOptions;
use teloxide::types::User;
use tracing::{debug, warn};

use super::models::CachedUser;
use super::{Database, StoreError};
use crate::cache::{CacheConfig, TypedCache};

#[derive(Clone)]
pub struct UserRepo {
    collection: Collection<CachedUser>,
    by_id: TypedCache<u64, CachedUser>,
    by_username: TypedCache<String, u64>,
}

impl UserRepo {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("users"),
            by_id: TypedCache::new("users_by_id", CacheConfig::with_capacity(10_000)),
            // usernames change, keep them shorter
            by_username: TypedCache::new(
                "users_by_username",
                CacheConfig::with_capacity(10_000).ttl(Duration::from_secs(1800)),
            ),
        }
    }

    /// Record `user`, skipping the write when nothing changed since last time.
    pub async fn upsert(&self, user: &User) -> Result<(), StoreError> {
        if let Some(cached) = self.by_id.get(&user.id.0) {
            if !cached.has_changed(user) {
                return Ok(());
            }
            if let Some(old) = &cached.username {
                self.by_username.invalidate(old);
            }
        }

        let seen = CachedUser::from_telegram(user);
        self.collection
            .replace_one(doc! { "user_id": seen.user_id as i64 }, &seen)
            .with_options(ReplaceOptions::builder().upsert(true).build())
            .await?;

        debug!("Tracked user {} (@{:?})", seen.user_id, seen.username);
        self.remember(seen);
        Ok(())
    }

    /// Fire-and-forget `upsert`, used on every incoming message.
    pub fn track(self: Arc<Self>, user: User) {
        tokio::spawn(async move {
            if let Err(e) = self.upsert(&user).await {
                warn!("Failed to track user {}: {}", user.id, e);
            }
        });
    }

    pub async fn get_by_id(&self, user_id: u64) -> Result<Option<CachedUser>, StoreError> {
        if let Some(user) = self.by_id.get(&user_id) {
            return Ok(Some(user));
        }
        self.find_one(doc! { "user_id": user_id as i64 }).await
    }

    /// Case-insensitive lookup, with or without the leading `@`.
    pub async fn get_by_username(&self, username: &str) -> Result<Option<CachedUser>, StoreError> {
        let username = username.trim_start_matches('@').to_lowercase();
        if let Some(user_id) = self.by_username.get(&username) {
            return self.get_by_id(user_id).await;
        }
        self.find_one(doc! { "username": username }).await
    }

    async fn find_one(&self, filter: Document) -> Result<Option<CachedUser>, StoreError> {
        let found = self.collection.find_one(filter).await?;
        if let Some(user) = &found {
            self.remember(user.clone());
        }
        Ok(found)
    }

    fn remember(&self, user: CachedUser) {
        if let Some(username) = &user.username {
            self.by_username.insert(username.clone(), user.user_id);
        }
        self.by_id.insert(user.user_id, user);
    }
}
