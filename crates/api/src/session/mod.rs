//! Session state over the shared key/value store
//!
//! Key namespace:
//! - `token:{t}` — serialized credential snapshot, TTL = access lifetime
//! - `sessions:{email}` — set of historically issued access tokens
//! - `last_activity:{t}` — unix timestamp of last client activity
//! - `online:{user_id}` — presence flag, TTL = access lifetime
//! - `user:{user_id}:refresh_tokens` — refresh set, TTL = refresh lifetime
//! - `password_reset:{t}` — reset token -> user id, short TTL, single use
//!
//! Each store call is independently atomic. Invalidation is a sequence of
//! such calls, not a transaction: a login racing the sweep may recreate a
//! token the sweep has not reached yet, which a later sweep or TTL expiry
//! converges.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use pulsedesk_shared::{CoreError, UserCredentials};

use crate::auth::jwt::TokenCodec;
use crate::store::KeyValueStore;

const SCAN_BATCH: usize = 100;

fn token_key(token: &str) -> String {
    format!("token:{token}")
}

fn sessions_key(email: &str) -> String {
    format!("sessions:{email}")
}

fn activity_key(token: &str) -> String {
    format!("last_activity:{token}")
}

fn online_key(user_id: Uuid) -> String {
    format!("online:{user_id}")
}

fn refresh_key(user_id: Uuid) -> String {
    format!("user:{user_id}:refresh_tokens")
}

fn reset_key(token: &str) -> String {
    format!("password_reset:{token}")
}

/// Persistent per-token / per-user session state.
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
    codec: TokenCodec,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KeyValueStore>, codec: TokenCodec) -> Self {
        Self { store, codec }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    fn access_ttl(&self) -> u64 {
        self.codec.access_ttl_secs().max(0) as u64
    }

    // ==================== Access sessions ====================

    /// Persist a session for a freshly issued access token: snapshot, session
    /// set membership, presence online and an activity stamp.
    pub async fn save_session(
        &self,
        user: &UserCredentials,
        token: &str,
    ) -> Result<(), CoreError> {
        let snapshot = serde_json::to_string(user)
            .map_err(|e| CoreError::Internal(format!("snapshot serialization: {e}")))?;

        self.store
            .set(&token_key(token), &snapshot, Some(self.access_ttl()))
            .await?;
        self.store
            .sadd(&sessions_key(&user.email), token)
            .await?;

        self.set_online(user.id, true).await?;
        self.update_last_activity(token).await?;
        Ok(())
    }

    pub async fn get_session(&self, token: &str) -> Result<Option<UserCredentials>, CoreError> {
        match self.store.get(&token_key(token)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| CoreError::Internal(format!("snapshot deserialization: {e}"))),
            None => Ok(None),
        }
    }

    /// End the session for one access token.
    pub async fn remove_session(&self, token: &str) -> Result<(), CoreError> {
        if let Some(user) = self.get_session(token).await? {
            self.store
                .srem(&sessions_key(&user.email), token)
                .await?;
        }
        self.store.del(&token_key(token)).await?;
        self.store.del(&activity_key(token)).await?;
        Ok(())
    }

    /// Full access-token check: signature, type, live session record, active
    /// account. The read path — store failures here are surfaced.
    pub async fn verify_token(&self, token: &str) -> Result<UserCredentials, CoreError> {
        let claims = self.codec.decode(token)?;
        self.codec.validate_access(&claims)?;

        // A valid signature without a live record is a revoked session
        let user = self.get_session(token).await?.ok_or(CoreError::Invalid)?;
        if !user.is_active {
            tracing::warn!(user_id = %user.id, "Deactivated account presented a valid token");
            return Err(CoreError::Forbidden);
        }
        Ok(user)
    }

    /// Historically issued access tokens for one identity.
    pub async fn user_sessions(&self, email: &str) -> Result<Vec<String>, CoreError> {
        self.store.smembers(&sessions_key(email)).await
    }

    // ==================== Activity & presence ====================

    pub async fn update_last_activity(&self, token: &str) -> Result<(), CoreError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.store
            .set(&activity_key(token), &now.to_string(), Some(self.access_ttl()))
            .await
    }

    pub async fn last_activity(&self, token: &str) -> Result<Option<i64>, CoreError> {
        Ok(self
            .store
            .get(&activity_key(token))
            .await?
            .and_then(|raw| raw.parse().ok()))
    }

    /// Presence flag. The TTL never outlives the access token that backs it.
    pub async fn set_online(&self, user_id: Uuid, online: bool) -> Result<(), CoreError> {
        self.store
            .set(
                &online_key(user_id),
                if online { "true" } else { "false" },
                Some(self.access_ttl()),
            )
            .await
    }

    pub async fn is_online(&self, user_id: Uuid) -> Result<bool, CoreError> {
        Ok(self.store.get(&online_key(user_id)).await?.as_deref() == Some("true"))
    }

    // ==================== Refresh tokens ====================

    pub async fn save_refresh_token(&self, user_id: Uuid, token: &str) -> Result<(), CoreError> {
        let key = refresh_key(user_id);
        self.store.sadd(&key, token).await?;
        self.store
            .expire(&key, self.codec.refresh_ttl_secs().max(0) as u64)
            .await
    }

    pub async fn check_refresh_token(&self, user_id: Uuid, token: &str) -> Result<bool, CoreError> {
        self.store.sismember(&refresh_key(user_id), token).await
    }

    pub async fn remove_refresh_token(&self, user_id: Uuid, token: &str) -> Result<(), CoreError> {
        self.store.srem(&refresh_key(user_id), token).await
    }

    pub async fn remove_all_refresh_tokens(&self, user_id: Uuid) -> Result<(), CoreError> {
        self.store.del(&refresh_key(user_id)).await
    }

    // ==================== Invalidation ====================

    /// Revoke everything a user holds: refresh set, every access session and
    /// activity stamp found by a bounded scan, then presence.
    ///
    /// Best-effort by contract: the caller's primary outcome (a password
    /// change, an admin revoke) must succeed even when cleanup is partial,
    /// so failures are logged and swallowed.
    pub async fn invalidate_user(&self, user_id: Uuid) {
        tracing::info!(user_id = %user_id, "Invalidating all tokens for user");
        if let Err(e) = self.invalidate_user_inner(user_id).await {
            tracing::error!(user_id = %user_id, error = %e, "Token invalidation incomplete");
        }
    }

    async fn invalidate_user_inner(&self, user_id: Uuid) -> Result<(), CoreError> {
        self.remove_all_refresh_tokens(user_id).await?;

        let mut cursor = 0;
        loop {
            let (next, keys) = self.store.scan(cursor, "token:*", SCAN_BATCH).await?;

            for key in keys {
                let token = match key.strip_prefix("token:") {
                    Some(t) => t,
                    None => continue,
                };
                let owned = self
                    .get_session(token)
                    .await?
                    .is_some_and(|user| user.id == user_id);
                if owned {
                    self.store.del(&key).await?;
                    self.store.del(&activity_key(token)).await?;
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        self.set_online(user_id, false).await?;
        tracing::info!(user_id = %user_id, "All tokens invalidated");
        Ok(())
    }

    // ==================== Password reset tokens ====================

    /// Persist a reset token. Presence of the record = valid and unused.
    pub async fn save_reset_token(
        &self,
        user_id: Uuid,
        token: &str,
        ttl_secs: u64,
    ) -> Result<(), CoreError> {
        self.store
            .set(&reset_key(token), &user_id.to_string(), Some(ttl_secs))
            .await
    }

    pub async fn get_reset_token_user(&self, token: &str) -> Result<Option<Uuid>, CoreError> {
        Ok(self
            .store
            .get(&reset_key(token))
            .await?
            .and_then(|raw| Uuid::parse_str(&raw).ok()))
    }

    /// Consume a reset token so it cannot replay. Failures are logged only —
    /// the password change it follows has already succeeded.
    pub async fn delete_reset_token(&self, token: &str) {
        if let Err(e) = self.store.del(&reset_key(token)).await {
            tracing::error!(error = %e, "Failed to delete consumed reset token");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwt::TokenSubject;
    use crate::store::MemoryStore;
    use time::Duration;

    fn test_codec() -> TokenCodec {
        TokenCodec::new(
            "test-secret-key-at-least-32-chars!!",
            Duration::minutes(30),
            Duration::days(30),
            Duration::hours(24),
            Duration::minutes(30),
        )
    }

    fn sessions() -> SessionStore {
        SessionStore::new(Arc::new(MemoryStore::new()), test_codec())
    }

    fn user(email: &str) -> UserCredentials {
        UserCredentials {
            id: Uuid::new_v4(),
            email: email.into(),
            display_name: "Test".into(),
            role: "user".into(),
            password_hash: String::new(),
            is_active: true,
        }
    }

    fn access_token(codec: &TokenCodec, user: &UserCredentials) -> String {
        codec
            .issue_access(&TokenSubject {
                id: user.id,
                email: user.email.clone(),
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_save_verify_remove_session() {
        let sessions = sessions();
        let alice = user("alice@example.com");
        let token = access_token(sessions.codec(), &alice);

        sessions.save_session(&alice, &token).await.unwrap();
        assert!(sessions.is_online(alice.id).await.unwrap());
        assert!(sessions.last_activity(&token).await.unwrap().is_some());

        let verified = sessions.verify_token(&token).await.unwrap();
        assert_eq!(verified.id, alice.id);

        sessions.remove_session(&token).await.unwrap();
        // Record gone: the same well-signed token no longer resolves
        assert!(matches!(
            sessions.verify_token(&token).await,
            Err(CoreError::Invalid)
        ));
        assert!(sessions
            .user_sessions("alice@example.com")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_deactivated_account_is_forbidden() {
        let sessions = sessions();
        let mut bob = user("bob@example.com");
        bob.is_active = false;
        let token = access_token(sessions.codec(), &bob);

        sessions.save_session(&bob, &token).await.unwrap();
        assert!(matches!(
            sessions.verify_token(&token).await,
            Err(CoreError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn test_refresh_token_set() {
        let sessions = sessions();
        let id = Uuid::new_v4();

        sessions.save_refresh_token(id, "r1").await.unwrap();
        assert!(sessions.check_refresh_token(id, "r1").await.unwrap());
        assert!(!sessions.check_refresh_token(id, "r2").await.unwrap());

        sessions.remove_refresh_token(id, "r1").await.unwrap();
        assert!(!sessions.check_refresh_token(id, "r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_user_sweeps_only_own_tokens() {
        let sessions = sessions();
        let alice = user("alice@example.com");
        let carol = user("carol@example.com");

        // Enough sessions to force multiple scan batches over small counts
        let mut alice_tokens = Vec::new();
        for _ in 0..3 {
            let t = access_token(sessions.codec(), &alice);
            sessions.save_session(&alice, &t).await.unwrap();
            alice_tokens.push(t);
        }
        let carol_token = access_token(sessions.codec(), &carol);
        sessions.save_session(&carol, &carol_token).await.unwrap();
        sessions.save_refresh_token(alice.id, "ar1").await.unwrap();

        sessions.invalidate_user(alice.id).await;

        for t in &alice_tokens {
            assert!(sessions.get_session(t).await.unwrap().is_none());
            assert!(sessions.last_activity(t).await.unwrap().is_none());
        }
        assert!(!sessions.check_refresh_token(alice.id, "ar1").await.unwrap());
        assert!(!sessions.is_online(alice.id).await.unwrap());

        // Carol untouched
        assert!(sessions.get_session(&carol_token).await.unwrap().is_some());
        assert!(sessions.is_online(carol.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_token_single_use() {
        let sessions = sessions();
        let id = Uuid::new_v4();

        sessions.save_reset_token(id, "tok", 1800).await.unwrap();
        assert_eq!(sessions.get_reset_token_user("tok").await.unwrap(), Some(id));

        sessions.delete_reset_token("tok").await;
        assert_eq!(sessions.get_reset_token_user("tok").await.unwrap(), None);
    }
}
