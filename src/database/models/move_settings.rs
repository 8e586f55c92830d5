//! Per-chat settings of the move workflow.

use serde::{Deserialize, Serialize};

use crate::database::{RecordStore, StoreError};
use crate::entity::Record;

/// Whether `/move` is enabled in a chat. A missing row means disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveSettings {
    #[serde(rename = "_id")]
    pub chat_id: i64,

    #[serde(default)]
    pub enabled: bool,
}

impl MoveSettings {
    pub fn new(chat_id: i64, enabled: bool) -> Self {
        Self { chat_id, enabled }
    }

    /// Persist these settings. Disabled settings are stored as no row at all.
    pub async fn save<S>(&self, store: &S) -> Result<(), StoreError>
    where
        S: RecordStore<MoveSettings>,
    {
        if self.enabled {
            store.upsert(self).await
        } else {
            store.delete(&self.chat_id).await.map(|_| ())
        }
    }
}

impl Record for MoveSettings {
    type Key = i64;
    const COLLECTION: &'static str = "move_settings";

    fn key(&self) -> i64 {
        self.chat_id
    }
}
