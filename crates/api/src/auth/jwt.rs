//! JWT token issue, decode and validation
//!
//! All four token types share one codec so the `type` claim is minted and
//! checked in exactly one place. Expiry lives in the custom `expires_at`
//! claim and is enforced here with zero leeway; the library's own `exp`
//! handling is disabled so a stale-but-well-signed token is reported as
//! Expired, never Invalid.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use pulsedesk_shared::CoreError;

/// Token type claim. Cross-type use always fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
    EmailVerification,
    PasswordReset,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
            TokenType::EmailVerification => "email_verification",
            TokenType::PasswordReset => "password_reset",
        }
    }
}

/// Claims carried by every Pulsedesk-issued token.
///
/// Access tokens additionally carry `email`; refresh, verification and reset
/// tokens carry only the subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: Uuid,
    /// Email, access tokens only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Expiry (unix seconds), custom claim checked by this codec
    pub expires_at: i64,
    /// JWT ID for session tracking
    pub jti: String,
    /// Token type tag
    #[serde(rename = "type")]
    pub token_type: TokenType,
}

/// The narrow shape token issuance needs from a user entity.
#[derive(Debug, Clone)]
pub struct TokenSubject {
    pub id: Uuid,
    pub email: String,
}

/// Stateless signed-token codec.
#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
    verification_ttl: Duration,
    reset_ttl: Duration,
}

impl TokenCodec {
    pub fn new(
        secret: &str,
        access_ttl: Duration,
        refresh_ttl: Duration,
        verification_ttl: Duration,
        reset_ttl: Duration,
    ) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl,
            refresh_ttl,
            verification_ttl,
            reset_ttl,
        }
    }

    /// Access token lifetime in seconds, also the session-record TTL.
    pub fn access_ttl_secs(&self) -> i64 {
        self.access_ttl.whole_seconds()
    }

    /// Refresh token lifetime in seconds.
    pub fn refresh_ttl_secs(&self) -> i64 {
        self.refresh_ttl.whole_seconds()
    }

    /// Reset token lifetime in seconds.
    pub fn reset_ttl_secs(&self) -> i64 {
        self.reset_ttl.whole_seconds()
    }

    /// Issue a signed token of the given type.
    ///
    /// `email` is only meaningful for access tokens; every other type carries
    /// the subject alone.
    pub fn issue(
        &self,
        token_type: TokenType,
        subject: Uuid,
        ttl: Duration,
        email: Option<&str>,
    ) -> Result<String, JwtError> {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: subject,
            email: email.map(str::to_owned),
            iat: now.unix_timestamp(),
            expires_at: (now + ttl).unix_timestamp(),
            jti: Uuid::new_v4().to_string(),
            token_type,
        };

        // Explicit algorithm prevents algorithm confusion attacks
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| JwtError::Encoding(e.to_string()))
    }

    pub fn issue_access(&self, subject: &TokenSubject) -> Result<String, JwtError> {
        self.issue(
            TokenType::Access,
            subject.id,
            self.access_ttl,
            Some(&subject.email),
        )
    }

    pub fn issue_refresh(&self, user_id: Uuid) -> Result<String, JwtError> {
        self.issue(TokenType::Refresh, user_id, self.refresh_ttl, None)
    }

    pub fn issue_verification(&self, user_id: Uuid) -> Result<String, JwtError> {
        self.issue(
            TokenType::EmailVerification,
            user_id,
            self.verification_ttl,
            None,
        )
    }

    pub fn issue_reset(&self, user_id: Uuid) -> Result<String, JwtError> {
        self.issue(TokenType::PasswordReset, user_id, self.reset_ttl, None)
    }

    /// Decode and verify the signature of a token.
    ///
    /// Fails Missing on an empty token, Invalid on a bad signature or
    /// structure, Expired when the signature is valid but `expires_at` has
    /// passed.
    pub fn decode(&self, token: &str) -> Result<Claims, JwtError> {
        if token.is_empty() {
            return Err(JwtError::Missing);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is the custom expires_at claim, enforced below
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let claims = decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|_| JwtError::Invalid)?;

        if is_expired(claims.expires_at, 0) {
            return Err(JwtError::Expired);
        }
        Ok(claims)
    }

    /// Enforce the expected type on decoded claims.
    ///
    /// Cross-type use is Invalid: a password-reset token presented where an
    /// access token is expected must never pass.
    pub fn validate(&self, claims: &Claims, expected: TokenType) -> Result<(), JwtError> {
        if claims.token_type != expected {
            tracing::warn!(
                expected = expected.as_str(),
                got = claims.token_type.as_str(),
                "Token type mismatch"
            );
            return Err(JwtError::Invalid);
        }
        if is_expired(claims.expires_at, 0) {
            return Err(JwtError::Expired);
        }
        Ok(())
    }

    /// Validate access claims and extract the identity they carry.
    pub fn validate_access(&self, claims: &Claims) -> Result<(Uuid, String), JwtError> {
        self.validate(claims, TokenType::Access)?;
        let email = claims.email.clone().ok_or(JwtError::Invalid)?;
        Ok((claims.sub, email))
    }

    /// Validate claims of a subject-only token type and return the user id.
    pub fn validate_subject(&self, claims: &Claims, expected: TokenType) -> Result<Uuid, JwtError> {
        self.validate(claims, expected)?;
        Ok(claims.sub)
    }
}

/// Zero-leeway expiry check: expired strictly after `expires_at`.
fn is_expired(expires_at: i64, leeway_secs: i64) -> bool {
    OffsetDateTime::now_utc().unix_timestamp() > expires_at + leeway_secs
}

/// Extract a bearer token from an `Authorization` header value.
pub fn bearer_token(authorization: Option<&str>) -> Result<&str, JwtError> {
    let value = authorization.ok_or(JwtError::Missing)?;
    if value.trim().is_empty() {
        return Err(JwtError::Missing);
    }

    let parts: Vec<&str> = value.split_whitespace().collect();
    match parts.as_slice() {
        [scheme, token] if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() => Ok(token),
        _ => Err(JwtError::Invalid),
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JwtError {
    #[error("Token is missing")]
    Missing,
    #[error("Invalid token")]
    Invalid,
    #[error("Token has expired")]
    Expired,
    #[error("Token encoding failed: {0}")]
    Encoding(String),
}

impl From<JwtError> for CoreError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::Missing => CoreError::Missing,
            JwtError::Invalid => CoreError::Invalid,
            JwtError::Expired => CoreError::Expired,
            JwtError::Encoding(msg) => CoreError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new(
            "test-secret-key-at-least-32-chars!!",
            Duration::minutes(30),
            Duration::days(30),
            Duration::hours(24),
            Duration::minutes(30),
        )
    }

    #[test]
    fn test_issue_decode_round_trip() {
        let codec = codec();
        let user_id = Uuid::new_v4();

        for token_type in [
            TokenType::Access,
            TokenType::Refresh,
            TokenType::EmailVerification,
            TokenType::PasswordReset,
        ] {
            let token = codec
                .issue(token_type, user_id, Duration::minutes(5), None)
                .unwrap();
            let claims = codec.decode(&token).unwrap();
            assert_eq!(claims.sub, user_id);
            assert_eq!(claims.token_type, token_type);
            assert!(claims.expires_at <= claims.iat + 300);
            assert!(!claims.jti.is_empty());
        }
    }

    #[test]
    fn test_access_token_carries_email() {
        let codec = codec();
        let subject = TokenSubject {
            id: Uuid::new_v4(),
            email: "alice@example.com".into(),
        };

        let token = codec.issue_access(&subject).unwrap();
        let claims = codec.decode(&token).unwrap();
        let (user_id, email) = codec.validate_access(&claims).unwrap();
        assert_eq!(user_id, subject.id);
        assert_eq!(email, "alice@example.com");

        // Subject-only tokens carry no email
        let refresh = codec.issue_refresh(subject.id).unwrap();
        let claims = codec.decode(&refresh).unwrap();
        assert!(claims.email.is_none());
    }

    #[test]
    fn test_cross_type_use_fails_invalid() {
        let codec = codec();
        let user_id = Uuid::new_v4();

        let reset = codec.issue_reset(user_id).unwrap();
        let claims = codec.decode(&reset).unwrap();

        // A reset token presented where an access token is expected
        assert_eq!(codec.validate_access(&claims), Err(JwtError::Invalid));
        // ...or a refresh token
        assert_eq!(
            codec.validate_subject(&claims, TokenType::Refresh),
            Err(JwtError::Invalid)
        );
        // Its own type passes
        assert_eq!(
            codec.validate_subject(&claims, TokenType::PasswordReset),
            Ok(user_id)
        );
    }

    #[test]
    fn test_expired_token_fails_expired_not_invalid() {
        let codec = codec();
        let token = codec
            .issue(
                TokenType::Access,
                Uuid::new_v4(),
                Duration::seconds(-5),
                Some("alice@example.com"),
            )
            .unwrap();

        assert_eq!(codec.decode(&token), Err(JwtError::Expired));
    }

    #[test]
    fn test_tampered_token_fails_invalid() {
        let codec = codec();
        let token = codec.issue_refresh(Uuid::new_v4()).unwrap();

        let mut tampered = token.clone();
        tampered.pop();
        assert_eq!(codec.decode(&tampered), Err(JwtError::Invalid));

        let other = TokenCodec::new(
            "another-secret-key-also-32-chars!!!",
            Duration::minutes(30),
            Duration::days(30),
            Duration::hours(24),
            Duration::minutes(30),
        );
        assert_eq!(other.decode(&token), Err(JwtError::Invalid));
    }

    #[test]
    fn test_empty_token_fails_missing() {
        assert_eq!(codec().decode(""), Err(JwtError::Missing));
    }

    #[test]
    fn test_bearer_token_extraction() {
        assert_eq!(bearer_token(Some("Bearer abc.def.ghi")), Ok("abc.def.ghi"));
        assert_eq!(bearer_token(Some("bearer abc.def.ghi")), Ok("abc.def.ghi"));

        assert_eq!(bearer_token(None), Err(JwtError::Missing));
        assert_eq!(bearer_token(Some("")), Err(JwtError::Missing));
        assert_eq!(bearer_token(Some("   ")), Err(JwtError::Missing));
        assert_eq!(bearer_token(Some("abc.def.ghi")), Err(JwtError::Invalid));
        assert_eq!(bearer_token(Some("Basic abc")), Err(JwtError::Invalid));
        assert_eq!(
            bearer_token(Some("Bearer abc def")),
            Err(JwtError::Invalid)
        );
    }
}
