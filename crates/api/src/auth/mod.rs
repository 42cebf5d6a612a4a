//! Authentication module for Pulsedesk

pub mod jwt;
pub mod password;
pub mod provider;
pub mod service;

pub use jwt::{bearer_token, Claims, JwtError, TokenCodec, TokenSubject, TokenType};
pub use password::{hash_password, validate_password_strength, verify_password};
pub use provider::{CredentialProvider, MemoryCredentials};
pub use service::{AuthService, TokenPair};
