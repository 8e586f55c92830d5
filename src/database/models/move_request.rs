//! Payload of a pending `/move` request.

use serde::{Deserialize, Serialize};

use crate::interaction::InteractionPayload;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRequest {
    /// Chat the command was issued in.
    pub source_chat_id: i64,
    pub destination_chat_id: i64,
    pub destination_title: String,
    pub requester_id: u64,
    pub requester_name: String,
    pub target_id: u64,
    pub target_name: String,
    /// Prompt sent to the target's private chat.
    pub prompt_message_id: i32,
    pub lang: String,
}

impl InteractionPayload for MoveRequest {
    const COMMAND: &'static str = "move";
    const COLLECTION: &'static str = "interactions_move";
}
