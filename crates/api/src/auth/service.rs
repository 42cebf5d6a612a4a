//! Authentication flows
//!
//! Login, refresh rotation, logout, password reset and change. The read
//! paths (login, refresh) surface store failures; teardown paths are
//! best-effort so the user-facing outcome never hinges on cleanup.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use pulsedesk_shared::{CoreError, UserCredentials};

use crate::auth::jwt::{TokenSubject, TokenType};
use crate::auth::password::{hash_password, validate_password_strength, verify_password};
use crate::auth::provider::CredentialProvider;
use crate::session::SessionStore;

/// Issued token pair, the login/refresh response body.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

pub struct AuthService {
    credentials: Arc<dyn CredentialProvider>,
    sessions: Arc<SessionStore>,
}

impl AuthService {
    pub fn new(credentials: Arc<dyn CredentialProvider>, sessions: Arc<SessionStore>) -> Self {
        Self {
            credentials,
            sessions,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    // ==================== Login / refresh / logout ====================

    /// Authenticate by email and password; on success the session record,
    /// refresh membership and presence flag are all established.
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair, CoreError> {
        let user = self
            .credentials
            .find_by_email(email)
            .await?
            .ok_or(CoreError::InvalidCredentials)?;

        let password_ok = verify_password(password, &user.password_hash)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        if !password_ok {
            tracing::warn!(email = %email, "Login failed: wrong password");
            return Err(CoreError::InvalidCredentials);
        }
        if !user.is_active {
            tracing::warn!(user_id = %user.id, "Login rejected: account deactivated");
            return Err(CoreError::Forbidden);
        }

        let pair = self.issue_pair(&user).await?;
        tracing::info!(user_id = %user.id, "User authenticated");
        Ok(pair)
    }

    /// Rotate a refresh token: the presented token leaves the refresh set
    /// before its replacement pair exists, leaving no reuse window beyond
    /// this validation.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, CoreError> {
        let codec = self.sessions.codec();
        let claims = codec.decode(refresh_token)?;
        let user_id = codec.validate_subject(&claims, TokenType::Refresh)?;

        if !self
            .sessions
            .check_refresh_token(user_id, refresh_token)
            .await?
        {
            tracing::warn!(user_id = %user_id, "Refresh token not in the active set");
            return Err(CoreError::Invalid);
        }

        let user = self
            .credentials
            .find_by_id(user_id)
            .await?
            .ok_or(CoreError::Invalid)?;
        if !user.is_active {
            return Err(CoreError::Forbidden);
        }

        self.sessions
            .remove_refresh_token(user_id, refresh_token)
            .await?;

        let pair = self.issue_pair(&user).await?;
        tracing::debug!(user_id = %user_id, "Refresh token rotated");
        Ok(pair)
    }

    /// End the session behind an access token. Best-effort: every store
    /// failure is logged and swallowed, the logout itself always succeeds.
    pub async fn logout(&self, access_token: &str) {
        match self.sessions.get_session(access_token).await {
            Ok(Some(user)) => {
                if let Err(e) = self.sessions.set_online(user.id, false).await {
                    tracing::error!(user_id = %user.id, error = %e, "Logout: presence clear failed");
                }
                if let Err(e) = self.sessions.remove_all_refresh_tokens(user.id).await {
                    tracing::error!(user_id = %user.id, error = %e, "Logout: refresh cleanup failed");
                }
                tracing::info!(user_id = %user.id, "User logged out");
            }
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "Logout: session lookup failed"),
        }
        if let Err(e) = self.sessions.remove_session(access_token).await {
            tracing::error!(error = %e, "Logout: session removal failed");
        }
    }

    async fn issue_pair(&self, user: &UserCredentials) -> Result<TokenPair, CoreError> {
        let codec = self.sessions.codec();
        let access_token = codec.issue_access(&TokenSubject {
            id: user.id,
            email: user.email.clone(),
        })?;
        let refresh_token = codec.issue_refresh(user.id)?;

        self.sessions.save_session(user, &access_token).await?;
        self.sessions
            .save_refresh_token(user.id, &refresh_token)
            .await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "bearer".to_string(),
            expires_in: codec.access_ttl_secs(),
        })
    }

    // ==================== Password reset / change ====================

    /// Issue a reset token for the account behind `email`.
    ///
    /// Returns `None` for an unknown address without revealing whether it
    /// exists; the caller is responsible for delivering the token.
    pub async fn request_password_reset(&self, email: &str) -> Result<Option<String>, CoreError> {
        let user = match self.credentials.find_by_email(email).await? {
            Some(user) => user,
            None => {
                tracing::debug!("Password reset requested for unknown email");
                return Ok(None);
            }
        };

        let codec = self.sessions.codec();
        let token = codec.issue_reset(user.id)?;
        self.sessions
            .save_reset_token(user.id, &token, codec.reset_ttl_secs().max(0) as u64)
            .await?;

        tracing::info!(user_id = %user.id, "Password reset token issued");
        Ok(Some(token))
    }

    /// Consume a reset token and set a new password, then revoke every
    /// session the user holds.
    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<(), CoreError> {
        let codec = self.sessions.codec();
        let claims = codec.decode(token)?;
        let user_id = codec.validate_subject(&claims, TokenType::PasswordReset)?;

        // Single-use: the record's presence is what makes the token valid
        let record_user = self
            .sessions
            .get_reset_token_user(token)
            .await?
            .ok_or(CoreError::Invalid)?;
        if record_user != user_id {
            return Err(CoreError::Invalid);
        }

        validate_password_strength(new_password)
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        let hash = hash_password(new_password).map_err(|e| CoreError::Internal(e.to_string()))?;
        self.credentials.update_password_hash(user_id, &hash).await?;

        // The password is changed; everything past here is cleanup
        self.sessions.delete_reset_token(token).await;
        self.sessions.invalidate_user(user_id).await;

        tracing::info!(user_id = %user_id, "Password reset completed");
        Ok(())
    }

    /// Change a password with the current one as proof, then revoke every
    /// session the user holds.
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), CoreError> {
        let user = self
            .credentials
            .find_by_id(user_id)
            .await?
            .ok_or(CoreError::InvalidCredentials)?;

        let current_ok = verify_password(current_password, &user.password_hash)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        if !current_ok {
            return Err(CoreError::InvalidCredentials);
        }

        validate_password_strength(new_password)
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        let hash = hash_password(new_password).map_err(|e| CoreError::Internal(e.to_string()))?;
        self.credentials.update_password_hash(user_id, &hash).await?;

        self.sessions.invalidate_user(user_id).await;

        tracing::info!(user_id = %user_id, "Password changed");
        Ok(())
    }
}
