//! Pulsedesk API server entry point

use std::sync::Arc;

use anyhow::Context;
use axum::{extract::State, routing::get, Json, Router};
use serde_json::json;
use time::Duration;
use uuid::Uuid;

use pulsedesk_api::auth::jwt::TokenCodec;
use pulsedesk_api::auth::provider::MemoryCredentials;
use pulsedesk_api::auth::{hash_password, AuthService};
use pulsedesk_api::websocket::{ws_handler, Broadcaster, RedisPubSub};
use pulsedesk_api::{AppState, Config, SessionStore};
use pulsedesk_shared::UserCredentials;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulsedesk_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(bind = %config.bind_address, "Starting pulsedesk-api");

    // Shared store and pub/sub transport
    let store = Arc::new(
        pulsedesk_api::store::RedisStore::connect(&config.redis_url)
            .await
            .context("Failed to connect to Redis")?,
    );
    let pubsub = Arc::new(
        RedisPubSub::connect(&config.redis_url)
            .await
            .context("Failed to connect Redis pub/sub")?,
    );

    let codec = TokenCodec::new(
        &config.jwt_secret,
        Duration::seconds(config.access_token_ttl_secs as i64),
        Duration::seconds(config.refresh_token_ttl_secs as i64),
        Duration::seconds(config.verification_token_ttl_secs as i64),
        Duration::seconds(config.reset_token_ttl_secs as i64),
    );
    let sessions = Arc::new(SessionStore::new(store, codec));

    let credentials = Arc::new(MemoryCredentials::new());
    bootstrap_admin(&credentials).await?;

    let auth = Arc::new(AuthService::new(credentials, Arc::clone(&sessions)));
    let broadcaster = Arc::new(Broadcaster::new(
        Some(pubsub),
        config.broadcast_channel.clone(),
    ));
    let state = AppState::new(auth, sessions, broadcaster);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/online", get(online_users))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    tracing::info!(addr = %config.bind_address, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Online-users probe: the live presence roster of this process.
async fn online_users(State(state): State<AppState>) -> Json<serde_json::Value> {
    let users = state.broadcaster.online_users().await;
    let count = users.len();
    Json(json!({ "online_users": users, "online_count": count }))
}

/// Seed the initial operator account from ADMIN_EMAIL / ADMIN_PASSWORD.
/// Skipped silently when the variables are unset.
async fn bootstrap_admin(credentials: &MemoryCredentials) -> anyhow::Result<()> {
    let (Ok(email), Ok(password)) = (
        std::env::var("ADMIN_EMAIL"),
        std::env::var("ADMIN_PASSWORD"),
    ) else {
        tracing::warn!("ADMIN_EMAIL/ADMIN_PASSWORD not set, no accounts seeded");
        return Ok(());
    };

    let password_hash = hash_password(&password).context("Failed to hash admin password")?;
    credentials
        .insert(UserCredentials {
            id: Uuid::new_v4(),
            email: email.clone(),
            display_name: std::env::var("ADMIN_DISPLAY_NAME").unwrap_or_else(|_| "Admin".into()),
            role: "admin".into(),
            password_hash,
            is_active: true,
        })
        .await;
    tracing::info!(email = %email, "Admin account seeded");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
