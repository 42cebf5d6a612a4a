//! Connection registries and event fan-out
//!
//! One `Broadcaster` per process, explicitly constructed at the composition
//! root and passed by handle into connection handlers. It owns two
//! registries — anonymous (receive-only) and authenticated (one per user) —
//! and, when a pub/sub transport is configured, a lazily started subscriber
//! task that replays remote envelopes to local connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::connection::{Connection, OnlineUser, UserStatus, CLOSE_SUPERSEDED};
use super::events::ServerEvent;
use super::pubsub::{Backoff, PubSub};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

struct AuthedEntry {
    conn: Connection,
    user: OnlineUser,
}

struct ListenerHandle {
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

pub struct Broadcaster {
    anonymous: RwLock<HashMap<Uuid, Connection>>,
    authenticated: RwLock<HashMap<Uuid, AuthedEntry>>,
    pubsub: Option<Arc<dyn PubSub>>,
    channel: String,
    listener: Mutex<Option<ListenerHandle>>,
}

impl Broadcaster {
    /// Without a pub/sub transport broadcasts reach local connections only.
    pub fn new(pubsub: Option<Arc<dyn PubSub>>, channel: impl Into<String>) -> Self {
        Self {
            anonymous: RwLock::new(HashMap::new()),
            authenticated: RwLock::new(HashMap::new()),
            pubsub,
            channel: channel.into(),
            listener: Mutex::new(None),
        }
    }

    // ==================== Registration ====================

    pub async fn register_anonymous(self: &Arc<Self>, conn: Connection) {
        let total = {
            let mut anonymous = self.anonymous.write().await;
            anonymous.insert(conn.id, conn);
            anonymous.len()
        };
        tracing::info!(anonymous = total, "Anonymous connection registered");
        self.ensure_listener().await;
    }

    pub async fn unregister_anonymous(&self, conn_id: Uuid) {
        self.anonymous.write().await.remove(&conn_id);
        self.stop_listener_if_idle().await;
    }

    /// Register an authenticated connection, displacing any live connection
    /// the same user already holds in this process. The displaced socket is
    /// closed with a distinct code so the client can tell a takeover from a
    /// network fault.
    pub async fn register_authenticated(self: &Arc<Self>, conn: Connection, user: OnlineUser) {
        let user_id = user.user_id;
        let superseded = {
            let mut authenticated = self.authenticated.write().await;
            let old = authenticated.remove(&user_id);
            authenticated.insert(user_id, AuthedEntry { conn, user: user.clone() });
            old
        };

        if let Some(entry) = superseded {
            tracing::info!(user_id = %user_id, "Connection superseded by newer login");
            entry.conn.close(CLOSE_SUPERSEDED, "superseded");
        }

        self.ensure_listener().await;
        self.broadcast(ServerEvent::UserOnline { user }).await;
    }

    /// Remove an authenticated connection and announce the departure.
    /// Returns whether an entry was actually removed.
    ///
    /// The removal is id-checked: a superseded connection tearing itself
    /// down must never evict the connection that replaced it.
    pub async fn unregister_authenticated(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let removed = {
            let mut authenticated = self.authenticated.write().await;
            match authenticated.get(&user_id) {
                Some(entry) if entry.conn.id == conn_id => authenticated.remove(&user_id),
                _ => None,
            }
        };

        let was_present = removed.is_some();
        if let Some(entry) = removed {
            tracing::info!(user_id = %user_id, "Authenticated connection unregistered");
            self.broadcast(ServerEvent::UserOffline {
                user_id,
                display_name: entry.user.display_name,
            })
            .await;
        }
        self.stop_listener_if_idle().await;
        was_present
    }

    // ==================== Presence ====================

    /// Update a user's in-memory status, broadcasting only when the value
    /// actually changes. Activity pings that repeat the current status stamp
    /// `last_activity_at` without producing an event.
    pub async fn update_status(&self, user_id: Uuid, status: UserStatus) {
        let event = {
            let mut authenticated = self.authenticated.write().await;
            match authenticated.get_mut(&user_id) {
                Some(entry) => {
                    entry.user.last_activity_at = OffsetDateTime::now_utc();
                    if entry.user.status != status {
                        entry.user.status = status;
                        Some(ServerEvent::UserStatusChanged { user_id, status })
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        if let Some(event) = event {
            self.broadcast(event).await;
        }
    }

    pub async fn online_users(&self) -> Vec<OnlineUser> {
        let authenticated = self.authenticated.read().await;
        authenticated.values().map(|e| e.user.clone()).collect()
    }

    pub async fn online_count(&self) -> usize {
        self.authenticated.read().await.len()
    }

    /// Send directly to one user's connection, if present in this process.
    pub async fn send_to_user(&self, user_id: Uuid, event: ServerEvent) {
        let authenticated = self.authenticated.read().await;
        if let Some(entry) = authenticated.get(&user_id) {
            let _ = entry.conn.send(event);
        }
    }

    // ==================== Fan-out ====================

    /// Deliver to every local connection and, when a transport is
    /// configured, publish the same envelope for other processes.
    pub async fn broadcast(&self, event: ServerEvent) {
        let follow_ups = self.deliver_local(&event).await;
        self.publish(&event).await;

        // Departures discovered by failed sends are new local facts and get
        // the full treatment once; their own failures wait for the next pass
        for follow_up in follow_ups {
            self.deliver_local(&follow_up).await;
            self.publish(&follow_up).await;
        }
    }

    /// Replay a remote envelope to local connections only. Re-publishing
    /// would echo between processes forever.
    async fn handle_remote(&self, event: ServerEvent) {
        let follow_ups = self.deliver_local(&event).await;
        for follow_up in follow_ups {
            self.deliver_local(&follow_up).await;
            self.publish(&follow_up).await;
        }
    }

    /// One local fan-out pass. A failed send evicts only that connection;
    /// evicted authenticated entries yield `user:offline` follow-up events
    /// for the caller to distribute.
    async fn deliver_local(&self, event: &ServerEvent) -> Vec<ServerEvent> {
        let mut dead_anonymous = Vec::new();
        let mut dead_authenticated = Vec::new();

        {
            let anonymous = self.anonymous.read().await;
            for (id, conn) in anonymous.iter() {
                if conn.send(event.clone()).is_err() {
                    dead_anonymous.push(*id);
                }
            }
        }
        {
            let authenticated = self.authenticated.read().await;
            for (user_id, entry) in authenticated.iter() {
                if entry.conn.send(event.clone()).is_err() {
                    dead_authenticated.push((*user_id, entry.conn.id));
                }
            }
        }

        if dead_anonymous.is_empty() && dead_authenticated.is_empty() {
            return Vec::new();
        }

        {
            let mut anonymous = self.anonymous.write().await;
            for id in &dead_anonymous {
                anonymous.remove(id);
            }
        }

        let mut follow_ups = Vec::new();
        for (user_id, conn_id) in dead_authenticated {
            if let Some(event) = self.evict_authenticated(user_id, conn_id).await {
                follow_ups.push(event);
            }
        }
        follow_ups
    }

    /// Drop an entry whose send failed, id-checked like `unregister`: the
    /// user may have reconnected since the failure was observed, and the
    /// fresh registration must survive.
    async fn evict_authenticated(&self, user_id: Uuid, conn_id: Uuid) -> Option<ServerEvent> {
        let mut authenticated = self.authenticated.write().await;
        match authenticated.get(&user_id) {
            Some(entry) if entry.conn.id == conn_id => {
                let entry = authenticated.remove(&user_id)?;
                tracing::info!(user_id = %user_id, "Dropping connection after failed send");
                Some(ServerEvent::UserOffline {
                    user_id,
                    display_name: entry.user.display_name,
                })
            }
            _ => None,
        }
    }

    async fn publish(&self, event: &ServerEvent) {
        let Some(pubsub) = &self.pubsub else {
            return;
        };
        match serde_json::to_string(event) {
            Ok(payload) => {
                if let Err(e) = pubsub.publish(&self.channel, &payload).await {
                    tracing::error!(error = %e, "Pub/sub publish failed");
                }
            }
            Err(e) => tracing::error!(error = %e, "Event serialization failed"),
        }
    }

    // ==================== Subscriber lifecycle ====================

    /// Whether the subscriber task is currently running.
    pub async fn subscriber_running(&self) -> bool {
        self.listener.lock().await.is_some()
    }

    async fn ensure_listener(self: &Arc<Self>) {
        if self.pubsub.is_none() {
            return;
        }
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(subscriber_loop(
            Arc::clone(self),
            self.channel.clone(),
            cancel.clone(),
        ));
        *listener = Some(ListenerHandle {
            cancel,
            _task: task,
        });
        tracing::info!(channel = %self.channel, "Pub/sub subscriber started");
    }

    async fn has_local_connections(&self) -> bool {
        !self.anonymous.read().await.is_empty() || !self.authenticated.read().await.is_empty()
    }

    /// Stop the subscriber once no connection of either kind remains.
    /// Cancellation is cooperative and idempotent; the loop releases its
    /// subscription before exiting.
    async fn stop_listener_if_idle(&self) {
        if self.has_local_connections().await {
            return;
        }
        let mut listener = self.listener.lock().await;
        // A register may have slipped in between the emptiness check and
        // taking the lock; its connection still needs the listener
        if self.has_local_connections().await {
            return;
        }
        if let Some(handle) = listener.take() {
            handle.cancel.cancel();
            tracing::info!(channel = %self.channel, "Pub/sub subscriber stopped");
        }
    }
}

/// Per-process subscriber: decode and replay remote envelopes. Transport
/// failures are always recoverable — resubscribe after a doubling delay
/// (1s base, 60s ceiling) that resets on the next successful receipt.
async fn subscriber_loop(
    broadcaster: Arc<Broadcaster>,
    channel: String,
    cancel: CancellationToken,
) {
    let Some(pubsub) = broadcaster.pubsub.clone() else {
        return;
    };
    let mut backoff = Backoff::new(BACKOFF_BASE, BACKOFF_CAP);

    loop {
        let mut subscription = tokio::select! {
            _ = cancel.cancelled() => return,
            result = pubsub.subscribe(&channel) => match result {
                Ok(subscription) => subscription,
                Err(e) => {
                    tracing::warn!(error = %e, "Pub/sub subscribe failed, backing off");
                    if !sleep_or_cancel(&cancel, backoff.next_delay()).await {
                        return;
                    }
                    continue;
                }
            },
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    subscription.close().await;
                    return;
                }
                message = subscription.next_message() => match message {
                    Ok(Some(payload)) => {
                        backoff.reset();
                        match serde_json::from_str::<ServerEvent>(&payload) {
                            Ok(event) => broadcaster.handle_remote(event).await,
                            Err(e) => {
                                tracing::warn!(error = %e, "Undecodable pub/sub payload dropped");
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::warn!("Pub/sub stream ended, resubscribing");
                        subscription.close().await;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Pub/sub receive failed, resubscribing");
                        subscription.close().await;
                        break;
                    }
                },
            }
        }

        if !sleep_or_cancel(&cancel, backoff.next_delay()).await {
            return;
        }
    }
}

/// False when cancelled before the delay elapses.
async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::SocketCommand;
    use crate::websocket::pubsub::{MemoryPubSub, Subscription};
    use async_trait::async_trait;
    use pulsedesk_shared::CoreError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration as TokioDuration};

    fn online_user(user_id: Uuid, name: &str) -> OnlineUser {
        let now = OffsetDateTime::now_utc();
        OnlineUser {
            user_id,
            display_name: name.into(),
            role: "user".into(),
            status: UserStatus::Online,
            connected_at: now,
            last_activity_at: now,
        }
    }

    fn conn_pair() -> (Connection, mpsc::UnboundedReceiver<SocketCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new(tx), rx)
    }

    async fn next_event_of(
        rx: &mut mpsc::UnboundedReceiver<SocketCommand>,
        want: fn(&ServerEvent) -> bool,
    ) -> ServerEvent {
        timeout(TokioDuration::from_secs(2), async {
            loop {
                match rx.recv().await {
                    Some(SocketCommand::Event(event)) if want(&event) => return event,
                    Some(_) => continue,
                    None => panic!("channel closed while waiting for event"),
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_second_login_supersedes_first() {
        let broadcaster = Arc::new(Broadcaster::new(None, "events"));
        let user_id = Uuid::new_v4();

        let (first, mut first_rx) = conn_pair();
        let (second, _second_rx) = conn_pair();

        broadcaster
            .register_authenticated(first, online_user(user_id, "alice"))
            .await;
        broadcaster
            .register_authenticated(second.clone(), online_user(user_id, "alice"))
            .await;

        // Exactly one registry entry remains, and it is the newer connection
        assert_eq!(broadcaster.online_count().await, 1);

        let close = timeout(TokioDuration::from_secs(2), async {
            loop {
                match first_rx.recv().await {
                    Some(SocketCommand::Close { code, reason }) => return (code, reason),
                    Some(_) => continue,
                    None => panic!("channel closed before close frame"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(close, (CLOSE_SUPERSEDED, "superseded".to_string()));

        // The superseded socket's teardown must not evict the replacement
        assert!(
            !broadcaster
                .unregister_authenticated(user_id, Uuid::new_v4())
                .await
        );
        assert_eq!(broadcaster.online_count().await, 1);

        assert!(broadcaster.unregister_authenticated(user_id, second.id).await);
        assert_eq!(broadcaster.online_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_send_evicts_only_that_connection() {
        let broadcaster = Arc::new(Broadcaster::new(None, "events"));
        let dead_user = Uuid::new_v4();
        let live_user = Uuid::new_v4();

        let (dead, dead_rx) = conn_pair();
        drop(dead_rx);
        let (live, mut live_rx) = conn_pair();

        broadcaster
            .register_authenticated(dead, online_user(dead_user, "ghost"))
            .await;
        broadcaster
            .register_authenticated(live, online_user(live_user, "alice"))
            .await;

        broadcaster
            .broadcast(ServerEvent::TaskDeleted(serde_json::json!({"id": "1"})))
            .await;

        // The live connection got the event...
        next_event_of(&mut live_rx, |e| matches!(e, ServerEvent::TaskDeleted(_))).await;
        // ...and the offline notice for the evicted one
        let offline =
            next_event_of(&mut live_rx, |e| matches!(e, ServerEvent::UserOffline { .. })).await;
        match offline {
            ServerEvent::UserOffline { user_id, .. } => assert_eq!(user_id, dead_user),
            _ => unreachable!(),
        }
        assert_eq!(broadcaster.online_count().await, 1);
    }

    #[tokio::test]
    async fn test_eviction_is_id_checked_against_reconnects() {
        let broadcaster = Arc::new(Broadcaster::new(None, "events"));
        let user_id = Uuid::new_v4();

        let (stale, _stale_rx) = conn_pair();
        let stale_id = stale.id;
        broadcaster
            .register_authenticated(stale, online_user(user_id, "alice"))
            .await;

        // The user reconnects before the failed-send cleanup acts
        let (fresh, mut fresh_rx) = conn_pair();
        let fresh_id = fresh.id;
        broadcaster
            .register_authenticated(fresh, online_user(user_id, "alice"))
            .await;

        // Cleanup keyed to the stale connection leaves the fresh one alone
        assert!(broadcaster
            .evict_authenticated(user_id, stale_id)
            .await
            .is_none());
        assert_eq!(broadcaster.online_count().await, 1);

        broadcaster
            .broadcast(ServerEvent::TaskUpdated(serde_json::json!({"id": "1"})))
            .await;
        next_event_of(&mut fresh_rx, |e| matches!(e, ServerEvent::TaskUpdated(_))).await;

        // Keyed to the current connection it still evicts and announces
        let offline = broadcaster.evict_authenticated(user_id, fresh_id).await;
        assert!(matches!(offline, Some(ServerEvent::UserOffline { .. })));
        assert_eq!(broadcaster.online_count().await, 0);
    }

    #[tokio::test]
    async fn test_status_broadcast_only_on_change() {
        let broadcaster = Arc::new(Broadcaster::new(None, "events"));
        let user_id = Uuid::new_v4();
        let observer_id = Uuid::new_v4();

        let (conn, _rx) = conn_pair();
        let (observer, mut observer_rx) = conn_pair();
        broadcaster
            .register_authenticated(conn, online_user(user_id, "alice"))
            .await;
        broadcaster
            .register_authenticated(observer, online_user(observer_id, "bob"))
            .await;

        broadcaster.update_status(user_id, UserStatus::Away).await;
        broadcaster.update_status(user_id, UserStatus::Away).await;
        broadcaster.update_status(user_id, UserStatus::Online).await;

        let first = next_event_of(&mut observer_rx, |e| {
            matches!(e, ServerEvent::UserStatusChanged { .. })
        })
        .await;
        match first {
            ServerEvent::UserStatusChanged { status, .. } => {
                assert_eq!(status, UserStatus::Away)
            }
            _ => unreachable!(),
        }
        // The repeated Away produced nothing; next status event is the
        // return to Online
        let second = next_event_of(&mut observer_rx, |e| {
            matches!(e, ServerEvent::UserStatusChanged { .. })
        })
        .await;
        match second {
            ServerEvent::UserStatusChanged { status, .. } => {
                assert_eq!(status, UserStatus::Online)
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_no_pubsub_reaches_local_only() {
        let process_a = Arc::new(Broadcaster::new(None, "events"));
        let process_b = Arc::new(Broadcaster::new(None, "events"));

        let (conn_b, mut rx_b) = conn_pair();
        process_b.register_anonymous(conn_b).await;

        process_a
            .broadcast(ServerEvent::TaskCreated(serde_json::json!({"id": "1"})))
            .await;

        // Nothing crosses between unconnected processes
        tokio::time::sleep(TokioDuration::from_millis(50)).await;
        assert!(rx_b.try_recv().is_err());
        assert!(!process_a.subscriber_running().await);
    }

    #[tokio::test]
    async fn test_pubsub_fans_out_across_processes() {
        let bus: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new());
        let process_a = Arc::new(Broadcaster::new(Some(bus.clone()), "events"));
        let process_b = Arc::new(Broadcaster::new(Some(bus), "events"));

        let (conn_b, mut rx_b) = conn_pair();
        process_b.register_anonymous(conn_b).await;
        assert!(process_b.subscriber_running().await);

        // Give process B's subscriber a moment to attach
        tokio::time::sleep(TokioDuration::from_millis(50)).await;

        process_a
            .broadcast(ServerEvent::CategoryUpdated(
                serde_json::json!({"id": "7", "title": "Renamed"}),
            ))
            .await;

        let event =
            next_event_of(&mut rx_b, |e| matches!(e, ServerEvent::CategoryUpdated(_))).await;
        match event {
            ServerEvent::CategoryUpdated(data) => assert_eq!(data["title"], "Renamed"),
            _ => unreachable!(),
        }
    }

    struct FaultedSubscription;

    #[async_trait]
    impl Subscription for FaultedSubscription {
        async fn next_message(&mut self) -> Result<Option<String>, CoreError> {
            Err(CoreError::ServiceUnavailable("transport fault".into()))
        }

        async fn close(&mut self) {}
    }

    /// Transport whose first subscription fails on receive, then recovers.
    struct FlakyPubSub {
        bus: MemoryPubSub,
        faulted: AtomicBool,
    }

    #[async_trait]
    impl PubSub for FlakyPubSub {
        async fn publish(&self, channel: &str, payload: &str) -> Result<(), CoreError> {
            self.bus.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, CoreError> {
            if !self.faulted.swap(true, Ordering::SeqCst) {
                return Ok(Box::new(FaultedSubscription));
            }
            self.bus.subscribe(channel).await
        }
    }

    #[tokio::test]
    async fn test_subscriber_recovers_after_transport_fault() {
        let bus = Arc::new(FlakyPubSub {
            bus: MemoryPubSub::new(),
            faulted: AtomicBool::new(false),
        });
        let broadcaster = Arc::new(Broadcaster::new(
            Some(bus.clone() as Arc<dyn PubSub>),
            "events",
        ));

        let (conn, mut rx) = conn_pair();
        broadcaster.register_anonymous(conn).await;
        assert!(broadcaster.subscriber_running().await);

        // The loop hits the faulted subscription, backs off and
        // resubscribes; keep publishing until the recovered one delivers
        let payload =
            serde_json::to_string(&ServerEvent::TaskUpdated(serde_json::json!({"id": "9"})))
                .unwrap();
        let deadline = tokio::time::Instant::now() + TokioDuration::from_secs(5);
        loop {
            bus.publish("events", &payload).await.unwrap();
            match timeout(TokioDuration::from_millis(100), rx.recv()).await {
                Ok(Some(SocketCommand::Event(ServerEvent::TaskUpdated(_)))) => break,
                _ => assert!(
                    tokio::time::Instant::now() < deadline,
                    "subscriber did not recover after the transport fault"
                ),
            }
        }
    }

    #[tokio::test]
    async fn test_idle_stop_yields_to_concurrent_register() {
        let bus: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new());
        let broadcaster = Arc::new(Broadcaster::new(Some(bus), "events"));

        let (first, _first_rx) = conn_pair();
        let first_id = first.id;
        broadcaster.register_anonymous(first).await;

        // Hold the listener lock so the unregister's stop check parks on
        // it, land a new registration meanwhile, then release
        let guard = broadcaster.listener.lock().await;
        let original_cancel = guard.as_ref().map(|h| h.cancel.clone()).unwrap();

        let unregister = {
            let broadcaster = Arc::clone(&broadcaster);
            tokio::spawn(async move { broadcaster.unregister_anonymous(first_id).await })
        };
        tokio::time::sleep(TokioDuration::from_millis(50)).await;

        let (second, _second_rx) = conn_pair();
        let register = {
            let broadcaster = Arc::clone(&broadcaster);
            tokio::spawn(async move { broadcaster.register_anonymous(second).await })
        };
        tokio::time::sleep(TokioDuration::from_millis(50)).await;

        drop(guard);
        unregister.await.unwrap();
        register.await.unwrap();

        // The listener the new connection relies on was neither cancelled
        // nor replaced
        assert!(!original_cancel.is_cancelled());
        assert!(broadcaster.subscriber_running().await);
    }

    #[tokio::test]
    async fn test_subscriber_stops_when_last_connection_leaves() {
        let bus: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new());
        let broadcaster = Arc::new(Broadcaster::new(Some(bus), "events"));

        let (conn, _rx) = conn_pair();
        let conn_id = conn.id;
        broadcaster.register_anonymous(conn).await;
        assert!(broadcaster.subscriber_running().await);

        broadcaster.unregister_anonymous(conn_id).await;
        assert!(!broadcaster.subscriber_running().await);

        // Stopping again is a no-op
        broadcaster.unregister_anonymous(conn_id).await;
        assert!(!broadcaster.subscriber_running().await);
    }
}
