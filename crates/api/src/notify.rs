//! Notification façade over the broadcaster
//!
//! Domain code announces entity changes here instead of talking to the
//! broadcaster directly. Each method stamps the entity id into the payload
//! so clients can always route the event, whatever shape the caller passed.

use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::websocket::{Broadcaster, OnlineUser, ServerEvent, UserStatus};

#[derive(Clone)]
pub struct Notifier {
    broadcaster: Arc<Broadcaster>,
}

impl Notifier {
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        Self { broadcaster }
    }

    pub async fn task_created(&self, id: Uuid, payload: Value) {
        self.emit(ServerEvent::TaskCreated(with_id(id, payload))).await;
    }

    pub async fn task_updated(&self, id: Uuid, payload: Value) {
        self.emit(ServerEvent::TaskUpdated(with_id(id, payload))).await;
    }

    pub async fn task_deleted(&self, id: Uuid) {
        self.emit(ServerEvent::TaskDeleted(json!({ "id": id.to_string() })))
            .await;
    }

    pub async fn category_created(&self, id: Uuid, payload: Value) {
        self.emit(ServerEvent::CategoryCreated(with_id(id, payload)))
            .await;
    }

    pub async fn category_updated(&self, id: Uuid, payload: Value) {
        self.emit(ServerEvent::CategoryUpdated(with_id(id, payload)))
            .await;
    }

    pub async fn category_deleted(&self, id: Uuid) {
        self.emit(ServerEvent::CategoryDeleted(json!({ "id": id.to_string() })))
            .await;
    }

    pub async fn user_created(&self, id: Uuid, payload: Value) {
        self.emit(ServerEvent::UserCreated(with_id(id, payload))).await;
    }

    pub async fn user_updated(&self, id: Uuid, payload: Value) {
        self.emit(ServerEvent::UserUpdated(with_id(id, payload))).await;
    }

    pub async fn user_deleted(&self, id: Uuid) {
        self.emit(ServerEvent::UserDeleted(json!({ "id": id.to_string() })))
            .await;
    }

    // Presence events are normally emitted by the broadcaster itself on
    // register/unregister; these exist for feature modules that learn about
    // presence changes some other way (e.g. an admin deactivation).

    pub async fn user_online(&self, user: OnlineUser) {
        self.emit(ServerEvent::UserOnline { user }).await;
    }

    pub async fn user_offline(&self, user_id: Uuid, display_name: String) {
        self.emit(ServerEvent::UserOffline {
            user_id,
            display_name,
        })
        .await;
    }

    pub async fn user_status(&self, user_id: Uuid, status: UserStatus) {
        self.emit(ServerEvent::UserStatusChanged { user_id, status })
            .await;
    }

    async fn emit(&self, event: ServerEvent) {
        self.broadcaster.broadcast(event).await;
    }
}

/// Merge the entity id into the payload, keeping whatever fields the caller
/// supplied. Non-object payloads are nested rather than discarded.
fn with_id(id: Uuid, payload: Value) -> Value {
    match payload {
        Value::Object(mut map) => {
            map.insert("id".into(), Value::String(id.to_string()));
            Value::Object(map)
        }
        Value::Null => json!({ "id": id.to_string() }),
        other => json!({ "id": id.to_string(), "value": other }),
    }
}
