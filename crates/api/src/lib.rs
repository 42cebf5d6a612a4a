//! Pulsedesk API Library
//!
//! Session lifecycle (JWT issue/validate, Redis-backed session state) and the
//! realtime notification core (per-process WebSocket registries with
//! cross-process pub/sub fan-out).

pub mod auth;
pub mod config;
pub mod notify;
pub mod session;
pub mod state;
pub mod store;
pub mod websocket;

pub use config::Config;
pub use notify::Notifier;
pub use session::SessionStore;
pub use state::AppState;
pub use websocket::Broadcaster;
