//! WebSocket connection handles and presence records

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use pulsedesk_shared::UserPublic;

use super::events::ServerEvent;

/// Close code sent to a connection displaced by a newer login.
pub const CLOSE_SUPERSEDED: u16 = 4008;
/// Close code for an invalid or expired token at connect time.
pub const CLOSE_INVALID_TOKEN: u16 = 4001;
/// Close code for a deactivated account.
pub const CLOSE_FORBIDDEN: u16 = 4003;

/// Presence status of a connected user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Online,
    Away,
    Idle,
}

/// In-memory presence record carried by an authenticated connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineUser {
    pub user_id: Uuid,
    pub display_name: String,
    pub role: String,
    pub status: UserStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub connected_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity_at: OffsetDateTime,
}

impl OnlineUser {
    pub fn connect(user: &UserPublic) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            user_id: user.id,
            display_name: user.display_name.clone(),
            role: user.role.clone(),
            status: UserStatus::Online,
            connected_at: now,
            last_activity_at: now,
        }
    }
}

/// Command delivered to a connection's socket task.
#[derive(Debug, Clone)]
pub enum SocketCommand {
    Event(ServerEvent),
    Close { code: u16, reason: String },
}

/// Handle to one live WebSocket connection.
///
/// Sends are channel writes and never block; the socket task owns the actual
/// sink. A send failure means the task is gone and the connection is dead.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    sender: mpsc::UnboundedSender<SocketCommand>,
}

impl Connection {
    pub fn new(sender: mpsc::UnboundedSender<SocketCommand>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
        }
    }

    /// Queue an event for delivery. Err means the connection is closed.
    pub fn send(&self, event: ServerEvent) -> Result<(), ConnectionClosed> {
        self.sender
            .send(SocketCommand::Event(event))
            .map_err(|_| ConnectionClosed)
    }

    /// Instruct the socket task to emit a close frame and stop.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.sender.send(SocketCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// The peer's socket task has exited; the connection cannot deliver.
#[derive(Debug, PartialEq, Eq)]
pub struct ConnectionClosed;
