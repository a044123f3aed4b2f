//! Session-Tier RPC
//!
//! The matchmaker talks to the session tier through [`RoomService`]: one
//! request/response call to create a room, and one long-lived server-pushed
//! stream of finished games. [`LocalRoomService`] serves both in-process.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::ids::{GameId, PlayerId};
use crate::game::registry::SessionRegistry;

pub use crate::game::registry::GameEndedEvent;

/// Answer to a room request. Exactly one field is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomResponse {
    /// Created room.
    pub room_id: Option<GameId>,
    /// Why the session tier refused.
    pub error_message: Option<String>,
}

impl RoomResponse {
    /// A created room.
    pub fn created(room_id: GameId) -> Self {
        Self {
            room_id: Some(room_id),
            error_message: None,
        }
    }

    /// A refusal.
    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            room_id: None,
            error_message: Some(message.into()),
        }
    }
}

/// Transport-level RPC failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RoomServiceError {
    /// The session tier could not be reached.
    #[error("session tier unavailable: {0}")]
    Unavailable(String),

    /// The call exceeded its deadline.
    #[error("room request timed out")]
    Timeout,

    /// The event stream ended.
    #[error("event stream closed")]
    StreamClosed,
}

/// Server-pushed game-ended events.
pub type GameEndedStream =
    Pin<Box<dyn Stream<Item = Result<GameEndedEvent, RoomServiceError>> + Send>>;

/// The session tier, as seen from the matchmaker.
#[async_trait]
pub trait RoomService: Send + Sync {
    /// Create a game for two players.
    async fn request_room(
        &self,
        player1: PlayerId,
        player2: PlayerId,
    ) -> Result<RoomResponse, RoomServiceError>;

    /// Open the game-ended stream.
    async fn game_ended_events(&self) -> Result<GameEndedStream, RoomServiceError>;
}

/// In-process session tier.
pub struct LocalRoomService {
    registry: Arc<SessionRegistry>,
}

impl LocalRoomService {
    /// Serve rooms from `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RoomService for LocalRoomService {
    async fn request_room(
        &self,
        player1: PlayerId,
        player2: PlayerId,
    ) -> Result<RoomResponse, RoomServiceError> {
        match self.registry.create_game(player1, player2).await {
            Ok(game) => Ok(RoomResponse::created(game.id())),
            Err(e) => {
                warn!("Room request for {} and {} refused: {}", player1, player2, e);
                Ok(RoomResponse::refused(e.to_string()))
            }
        }
    }

    async fn game_ended_events(&self) -> Result<GameEndedStream, RoomServiceError> {
        let rx = self.registry.subscribe_game_ended();
        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (Ok(event), rx))
        });
        Ok(Box::pin(events))
    }
}
