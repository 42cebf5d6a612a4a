//! Shared domain types
//!
//! The credential snapshot is the unit the session store persists per access
//! token and the auth flows pass around. It is deliberately narrow: feature
//! modules never see more of a user than this.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Credential snapshot for an account.
///
/// This is what the identifier->credential collaborator returns and what a
/// session record serializes. The password hash never leaves the auth layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCredentials {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub role: String,
    pub password_hash: String,
    pub is_active: bool,
}

impl UserCredentials {
    pub fn to_public(&self) -> UserPublic {
        UserPublic {
            id: self.id,
            email: self.email.clone(),
            display_name: self.display_name.clone(),
            role: self.role.clone(),
        }
    }
}

/// Public projection of a user, safe for wire envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPublic {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub role: String,
}
