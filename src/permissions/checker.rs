//! Permission checker with caching.

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::{ChatMember, ChatMemberKind};
use tracing::debug;

use crate::cache::{CacheConfig, TypedCache};

/// Rights of an admin relevant to the bot's commands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminRights {
    pub can_change_info: bool,
    pub can_invite_users: bool,
}

impl AdminRights {
    fn full() -> Self {
        Self {
            can_change_info: true,
            can_invite_users: true,
        }
    }

    fn from_chat_member(member: &ChatMember) -> Option<Self> {
        match &member.kind {
            ChatMemberKind::Owner(_) => Some(Self::full()),
            ChatMemberKind::Administrator(admin) => Some(Self {
                can_change_info: admin.can_change_info,
                can_invite_users: admin.can_invite_users,
            }),
            _ => None,
        }
    }
}

/// (chat_id, user_id)
type MemberKey = (i64, u64);

/// Cached `getChatMember` lookups.
#[derive(Clone)]
pub struct Permissions {
    bot: Bot,
    admins: TypedCache<MemberKey, Option<AdminRights>>,
    members: TypedCache<MemberKey, bool>,
    owner_ids: Arc<[u64]>,
}

impl Permissions {
    pub fn new(bot: Bot, owner_ids: Vec<u64>) -> Self {
        Self {
            bot,
            admins: TypedCache::new("admin_rights", CacheConfig::api_lookup()),
            members: TypedCache::new("chat_members", CacheConfig::api_lookup()),
            owner_ids: owner_ids.into(),
        }
    }

    #[inline]
    pub fn is_bot_owner(&self, user_id: UserId) -> bool {
        self.owner_ids.contains(&user_id.0)
    }

    /// Admin rights of `user_id` in `chat_id`, `None` for non-admins.
    pub async fn admin_rights(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> anyhow::Result<Option<AdminRights>> {
        if self.is_bot_owner(user_id) {
            return Ok(Some(AdminRights::full()));
        }

        let key = (chat_id.0, user_id.0);
        if let Some(cached) = self.admins.get(&key) {
            return Ok(cached);
        }

        let member = self.fetch(chat_id, user_id).await?;
        Ok(AdminRights::from_chat_member(&member))
    }

    pub async fn can_change_info(&self, chat_id: ChatId, user_id: UserId) -> anyhow::Result<bool> {
        Ok(self
            .admin_rights(chat_id, user_id)
            .await?
            .is_some_and(|rights| rights.can_change_info))
    }

    pub async fn can_invite_users(&self, chat_id: ChatId, user_id: UserId) -> anyhow::Result<bool> {
        Ok(self
            .admin_rights(chat_id, user_id)
            .await?
            .is_some_and(|rights| rights.can_invite_users))
    }

    /// Whether `user_id` currently belongs to `chat_id`.
    pub async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> anyhow::Result<bool> {
        let key = (chat_id.0, user_id.0);
        if let Some(cached) = self.members.get(&key) {
            return Ok(cached);
        }

        let member = self.fetch(chat_id, user_id).await?;
        Ok(member.kind.is_present())
    }

    /// Forget what is known about `user_id` in `chat_id`.
    pub fn invalidate(&self, chat_id: ChatId, user_id: UserId) {
        let key = (chat_id.0, user_id.0);
        self.admins.invalidate(&key);
        self.members.invalidate(&key);
        debug!("Invalidated member cache for user {} in chat {}", user_id, chat_id);
    }

    /// One API call fills both caches.
    async fn fetch(&self, chat_id: ChatId, user_id: UserId) -> anyhow::Result<ChatMember> {
        debug!("Member cache miss for user {} in chat {}", user_id, chat_id);
        let member = self.bot.get_chat_member(chat_id, user_id).await?;

        let key = (chat_id.0, user_id.0);
        self.admins.insert(key, AdminRights::from_chat_member(&member));
        self.members.insert(key, member.kind.is_present());
        Ok(member)
    }
}
