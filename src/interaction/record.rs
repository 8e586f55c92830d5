//! Persisted interaction state.

use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::entity::Record;

/// Workflow data carried by an interaction.
pub trait InteractionPayload:
    Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Name of the command that owns the interaction.
    const COMMAND: &'static str;

    /// Collection the interactions are stored in.
    const COLLECTION: &'static str;
}

/// An external event an interaction waits for: `user_id` pressing `action`
/// on message `message_id` in `chat_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerKey {
    pub chat_id: i64,
    pub message_id: i32,
    pub user_id: u64,
    pub action: String,
}

/// Stored state of one pending interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord<P> {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub command: String,

    pub created_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,

    /// Triggers armed for this interaction, re-armed on restore.
    #[serde(default)]
    pub triggers: Vec<TriggerKey>,

    pub payload: P,
}

impl<P: InteractionPayload> InteractionRecord<P> {
    pub fn new(expires_at: DateTime<Utc>, payload: P) -> Self {
        Self {
            id: ObjectId::new(),
            command: P::COMMAND.to_string(),
            created_at: Utc::now(),
            expires_at,
            triggers: Vec::new(),
            payload,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl<P: InteractionPayload> Record for InteractionRecord<P> {
    type Key = ObjectId;
    const COLLECTION: &'static str = P::COLLECTION;

    fn key(&self) -> ObjectId {
        self.id
    }
}
