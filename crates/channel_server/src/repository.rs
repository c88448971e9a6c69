//! Persistence boundary.
//!
//! Login/logout flows call out to these repositories purely as side effects.
//! The core never retries them: failures are logged and surfaced as a failure
//! acknowledgment, and login-critical failures close the connection instead
//! of leaving a half-authenticated session.

use crate::error::ServerError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Identity resolved from a validated login token.
#[derive(Debug, Clone)]
pub struct LoginIdentity {
    /// Character id the token resolves to
    pub char_id: u32,
    /// Display name of the character
    pub name: String,
}

/// Login-side persistence operations.
#[async_trait]
pub trait LoginRepository: Send + Sync {
    /// Validates a login token and resolves the character it belongs to.
    async fn validate_login_token(&self, token: &str) -> Result<LoginIdentity, ServerError>;

    /// Records which shard a character's session lives on.
    async fn bind_session(&self, char_id: u32, shard: &str) -> Result<(), ServerError>;

    /// Publishes the shard's current player count.
    async fn update_player_count(&self, shard: &str, count: usize) -> Result<(), ServerError>;
}

/// Character-side persistence operations.
#[async_trait]
pub trait CharacterRepository: Send + Sync {
    /// Persists the data a session accumulated, called at logout.
    async fn save_character_data(&self, char_id: u32, data: &[u8]) -> Result<(), ServerError>;
}

/// In-memory repositories backing tests and local development.
#[derive(Default)]
pub struct MemoryRepository {
    tokens: Mutex<HashMap<String, LoginIdentity>>,
    saved: Mutex<HashMap<u32, Vec<u8>>>,
}

impl MemoryRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a token the login flow will accept.
    pub fn insert_token(&self, token: &str, char_id: u32, name: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.to_string(), LoginIdentity { char_id, name: name.to_string() });
    }

    /// The last data saved for `char_id`, if any.
    pub fn saved_data(&self, char_id: u32) -> Option<Vec<u8>> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&char_id)
            .cloned()
    }
}

#[async_trait]
impl LoginRepository for MemoryRepository {
    async fn validate_login_token(&self, token: &str) -> Result<LoginIdentity, ServerError> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
            .ok_or_else(|| ServerError::Persistence(format!("Unknown login token: {token}")))
    }

    async fn bind_session(&self, _char_id: u32, _shard: &str) -> Result<(), ServerError> {
        Ok(())
    }

    async fn update_player_count(&self, _shard: &str, _count: usize) -> Result<(), ServerError> {
        Ok(())
    }
}

#[async_trait]
impl CharacterRepository for MemoryRepository {
    async fn save_character_data(&self, char_id: u32, data: &[u8]) -> Result<(), ServerError> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(char_id, data.to_vec());
        Ok(())
    }
}
