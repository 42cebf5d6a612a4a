//! WebSocket event types and serialization
//!
//! Every envelope, in both directions and on the pub/sub channel, is JSON
//! `{"type": "<noun>:<verb>", "data": {...}}`. The adjacently-tagged enum
//! keeps the discriminator and payload in one type-safe place.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::connection::{OnlineUser, UserStatus};

/// Broadcast envelope for server-to-client and cross-process traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Welcome envelope with the current online roster
    #[serde(rename = "connection:established")]
    ConnectionEstablished {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<OnlineUser>,
        online_users: Vec<OnlineUser>,
        online_count: usize,
    },

    /// Heartbeat response
    #[serde(rename = "pong")]
    Pong,

    /// User connected
    #[serde(rename = "user:online")]
    UserOnline { user: OnlineUser },

    /// User disconnected
    #[serde(rename = "user:offline")]
    UserOffline { user_id: Uuid, display_name: String },

    /// User presence status changed (online/away/idle)
    #[serde(rename = "user:status")]
    UserStatusChanged { user_id: Uuid, status: UserStatus },

    #[serde(rename = "task:created")]
    TaskCreated(Value),
    #[serde(rename = "task:updated")]
    TaskUpdated(Value),
    #[serde(rename = "task:deleted")]
    TaskDeleted(Value),

    #[serde(rename = "category:created")]
    CategoryCreated(Value),
    #[serde(rename = "category:updated")]
    CategoryUpdated(Value),
    #[serde(rename = "category:deleted")]
    CategoryDeleted(Value),

    #[serde(rename = "user:created")]
    UserCreated(Value),
    #[serde(rename = "user:updated")]
    UserUpdated(Value),
    #[serde(rename = "user:deleted")]
    UserDeleted(Value),
}
