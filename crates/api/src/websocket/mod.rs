//! WebSocket support for real-time features
//!
//! Provides WebSocket infrastructure for realtime notification delivery:
//! - User presence tracking (online/away/idle, live roster)
//! - Domain change broadcasts (tasks, categories, users)
//! - Cross-process fan-out over a pub/sub channel
//!
//! # Architecture
//!
//! - **Connection**: A registered socket's command handle
//! - **Broadcaster**: Per-process registries plus pub/sub fan-out
//! - **PubSub**: Transport abstraction (Redis in production, in-memory
//!   channels in tests)
//! - **Handler**: Axum WebSocket route handler
//! - **Events**: Type-safe event envelopes for the wire

pub mod broadcaster;
pub mod connection;
pub mod events;
pub mod handler;
pub mod pubsub;

pub use broadcaster::Broadcaster;
pub use connection::{Connection, OnlineUser, UserStatus};
pub use events::ServerEvent;
pub use handler::ws_handler;
pub use pubsub::{MemoryPubSub, PubSub, RedisPubSub};
