//! Shared application state

use std::sync::Arc;

use crate::auth::AuthService;
use crate::notify::Notifier;
use crate::session::SessionStore;
use crate::websocket::Broadcaster;

/// Cloneable handle bundle passed to every handler via axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub sessions: Arc<SessionStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub notifier: Notifier,
}

impl AppState {
    pub fn new(
        auth: Arc<AuthService>,
        sessions: Arc<SessionStore>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        let notifier = Notifier::new(Arc::clone(&broadcaster));
        Self {
            auth,
            sessions,
            broadcaster,
            notifier,
        }
    }
}
