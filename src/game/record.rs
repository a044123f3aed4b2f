//! Persistence Collaborators
//!
//! The session tier loads users and stores finished games through these
//! traits. Durable storage lives outside this crate; `MemoryRepository`
//! backs tests and single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::ids::{GameId, PlayerId};

/// A known user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// User identifier.
    pub id: PlayerId,
    /// Display name.
    pub username: String,
}

/// Final record of a game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRecord {
    /// Game identifier.
    pub id: GameId,
    /// White seat.
    pub white_id: PlayerId,
    /// Black seat.
    pub black_id: PlayerId,
    /// Move history (PGN movetext).
    pub serialized_game: String,
    /// Position at the end (FEN).
    pub final_position: String,
    /// `white`, `black` or `draw`.
    pub result: String,
    /// How the game ended.
    pub result_reason: String,
    /// Always `ended` for records written by the session tier.
    pub status: String,
    /// When the game was created.
    pub started_at: DateTime<Utc>,
    /// When the game ended.
    pub ended_at: DateTime<Utc>,
}

/// Repository failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    /// The user does not exist.
    #[error("user not found: {0}")]
    UserNotFound(PlayerId),

    /// The backing store failed.
    #[error("storage failure: {0}")]
    Storage(String),
}

/// User lookup.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Load a user by id.
    async fn find_user(&self, id: PlayerId) -> Result<UserRecord, RepositoryError>;

    /// Insert or refresh a user after a verified login.
    async fn upsert_user(&self, user: UserRecord) -> Result<(), RepositoryError>;
}

/// Game record storage.
#[async_trait]
pub trait GameRepository: Send + Sync {
    /// Insert or replace a game record.
    async fn upsert_game(&self, record: GameRecord) -> Result<(), RepositoryError>;
}

/// In-memory implementation of both repositories.
#[derive(Default)]
pub struct MemoryRepository {
    users: RwLock<HashMap<PlayerId, UserRecord>>,
    games: RwLock<HashMap<GameId, GameRecord>>,
}

impl MemoryRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a stored game.
    pub async fn game(&self, id: GameId) -> Option<GameRecord> {
        self.games.read().await.get(&id).cloned()
    }

    /// Number of stored games.
    pub async fn game_count(&self) -> usize {
        self.games.read().await.len()
    }
}

#[async_trait]
impl UserRepository for MemoryRepository {
    async fn find_user(&self, id: PlayerId) -> Result<UserRecord, RepositoryError> {
        self.users
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(RepositoryError::UserNotFound(id))
    }

    async fn upsert_user(&self, user: UserRecord) -> Result<(), RepositoryError> {
        self.users.write().await.insert(user.id, user);
        Ok(())
    }
}

#[async_trait]
impl GameRepository for MemoryRepository {
    async fn upsert_game(&self, record: GameRecord) -> Result<(), RepositoryError> {
        self.games.write().await.insert(record.id, record);
        Ok(())
    }
}
