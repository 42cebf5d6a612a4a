//! Identifier -> credential lookup collaborator
//!
//! The auth flows need exactly three things from whatever owns user records:
//! lookup by email, lookup by id, and persisting a new password hash. The
//! trait keeps the session core decoupled from any particular persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use pulsedesk_shared::{CoreError, UserCredentials};

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserCredentials>, CoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserCredentials>, CoreError>;

    async fn update_password_hash(&self, id: Uuid, hash: &str) -> Result<(), CoreError>;
}

/// In-memory credential table for single-process setups and tests.
#[derive(Default)]
pub struct MemoryCredentials {
    users: RwLock<HashMap<Uuid, UserCredentials>>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user: UserCredentials) {
        self.users.write().await.insert(user.id, user);
    }
}

#[async_trait]
impl CredentialProvider for MemoryCredentials {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserCredentials>, CoreError> {
        let users = self.users.read().await;
        Ok(users.values().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserCredentials>, CoreError> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn update_password_hash(&self, id: Uuid, hash: &str) -> Result<(), CoreError> {
        let mut users = self.users.write().await;
        match users.get_mut(&id) {
            Some(user) => {
                user.password_hash = hash.to_string();
                Ok(())
            }
            None => Err(CoreError::Internal(format!("unknown user {id}"))),
        }
    }
}
