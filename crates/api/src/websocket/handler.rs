//! WebSocket handler for Axum
//!
//! Authenticates via an optional query-parameter token. A connection with
//! no token (or a bad one, after the close handshake below) is still
//! upgraded: auth failures are reported with an application close code so
//! browser clients can read them, which a 401 on the HTTP upgrade would
//! not allow.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{stream::StreamExt, SinkExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use pulsedesk_shared::{CoreError, UserCredentials};

use crate::state::AppState;

use super::{
    connection::{
        Connection, OnlineUser, SocketCommand, UserStatus, CLOSE_FORBIDDEN, CLOSE_INVALID_TOKEN,
    },
    events::ServerEvent,
};

#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    token: Option<String>,
}

enum ConnectOutcome {
    Anonymous,
    Authenticated {
        user: Box<UserCredentials>,
        token: String,
    },
    Reject {
        code: u16,
        reason: &'static str,
    },
}

/// Upgrade handler. Token validation happens before the upgrade, but the
/// verdict is delivered after it.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WebSocketQuery>,
) -> Response {
    let outcome = match params.token.as_deref() {
        None => ConnectOutcome::Anonymous,
        Some(token) => match state.sessions.verify_token(token).await {
            Ok(user) => ConnectOutcome::Authenticated {
                user: Box::new(user),
                token: token.to_string(),
            },
            Err(CoreError::Forbidden) => {
                tracing::warn!("WebSocket auth failed: account deactivated");
                ConnectOutcome::Reject {
                    code: CLOSE_FORBIDDEN,
                    reason: "account deactivated",
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket auth failed: invalid token");
                ConnectOutcome::Reject {
                    code: CLOSE_INVALID_TOKEN,
                    reason: "invalid token",
                }
            }
        },
    };

    ws.on_upgrade(move |socket| handle_socket(socket, outcome, state))
}

/// Handle one WebSocket connection for its whole lifetime.
async fn handle_socket(mut socket: WebSocket, outcome: ConnectOutcome, state: AppState) {
    let (user, token) = match outcome {
        ConnectOutcome::Reject { code, reason } => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
        ConnectOutcome::Anonymous => (None, None),
        ConnectOutcome::Authenticated { user, token } => (Some(*user), Some(token)),
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SocketCommand>();
    let conn = Connection::new(tx);
    let conn_id = conn.id;

    let identity = match &user {
        Some(user) => {
            let online = OnlineUser::connect(&user.to_public());
            state
                .broadcaster
                .register_authenticated(conn.clone(), online.clone())
                .await;
            if let Err(e) = state.sessions.set_online(user.id, true).await {
                tracing::error!(user_id = %user.id, error = %e, "Presence write failed on connect");
            }
            if let Some(token) = &token {
                if let Err(e) = state.sessions.update_last_activity(token).await {
                    tracing::error!(user_id = %user.id, error = %e, "Activity write failed on connect");
                }
            }
            Some((user.id, online))
        }
        None => {
            state.broadcaster.register_anonymous(conn.clone()).await;
            None
        }
    };

    // Welcome envelope with the current presence snapshot
    let _ = conn.send(ServerEvent::ConnectionEstablished {
        user: identity.as_ref().map(|(_, online)| online.clone()),
        online_users: state.broadcaster.online_users().await,
        online_count: state.broadcaster.online_count().await,
    });

    // Outbound half: drain the command channel onto the socket
    let send_task = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                SocketCommand::Event(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = ?e, "Failed to serialize WebSocket event");
                    }
                },
                SocketCommand::Close { code, reason } => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Inbound half: the client speaks a plain-text command protocol
    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            Message::Text(text) => {
                handle_client_command(text.trim(), &conn, &identity, token.as_deref(), &state)
                    .await;
            }
            Message::Close(_) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Axum answers protocol pings itself
            }
            _ => {}
        }
    }

    // Cleanup on disconnect
    match identity {
        Some((user_id, _)) => {
            let removed = state
                .broadcaster
                .unregister_authenticated(user_id, conn_id)
                .await;
            // A superseded socket must not clear the presence its
            // replacement just wrote
            if removed {
                if let Err(e) = state.sessions.set_online(user_id, false).await {
                    tracing::error!(user_id = %user_id, error = %e, "Presence clear failed on disconnect");
                }
            }
            tracing::info!(conn_id = %conn_id, user_id = %user_id, "WebSocket connection closed");
        }
        None => {
            state.broadcaster.unregister_anonymous(conn_id).await;
            tracing::info!(conn_id = %conn_id, "Anonymous WebSocket connection closed");
        }
    }

    send_task.abort();
}

/// Dispatch one text command. Anonymous connections may only ping;
/// everything else needs an identity to act on. Unknown commands are
/// dropped without a reply.
async fn handle_client_command(
    command: &str,
    conn: &Connection,
    identity: &Option<(Uuid, OnlineUser)>,
    token: Option<&str>,
    state: &AppState,
) {
    match command {
        "ping" => {
            let _ = conn.send(ServerEvent::Pong);
        }
        "activity" => {
            let Some((user_id, _)) = identity else {
                return;
            };
            if let Some(token) = token {
                if let Err(e) = state.sessions.update_last_activity(token).await {
                    tracing::error!(user_id = %user_id, error = %e, "Activity write failed");
                }
            }
            if let Err(e) = state.sessions.set_online(*user_id, true).await {
                tracing::error!(user_id = %user_id, error = %e, "Presence refresh failed");
            }
            state
                .broadcaster
                .update_status(*user_id, UserStatus::Online)
                .await;
        }
        "away" => {
            if let Some((user_id, _)) = identity {
                state
                    .broadcaster
                    .update_status(*user_id, UserStatus::Away)
                    .await;
            }
        }
        "idle" => {
            if let Some((user_id, _)) = identity {
                state
                    .broadcaster
                    .update_status(*user_id, UserStatus::Idle)
                    .await;
            }
        }
        other => {
            tracing::debug!(command = %other, "Unknown WebSocket command ignored");
        }
    }
}
