//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON envelope `{"type": ..., "data": ...}`. Inbound
//! frames are decoded once, here, into [`ClientMessage`]; nothing past this
//! module looks at raw JSON.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ids::{GameId, PlayerId};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    /// Attach this connection to a game (as a seat or a spectator).
    #[serde(rename = "init")]
    Init(InitRequest),

    /// Seated player submits a move.
    #[serde(rename = "player_moved")]
    PlayerMoved(MovePayload),

    /// Seated player resigns.
    #[serde(rename = "resign")]
    Resign,

    /// Liveness reply.
    #[serde(rename = "ping")]
    Ping,

    /// Join the matchmaking queue.
    #[serde(rename = "joinQueue")]
    JoinQueue,

    /// Leave the matchmaking queue.
    #[serde(rename = "leaveQueue")]
    LeaveQueue,
}

/// Payload of `init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    /// Room (game) to attach to.
    pub room_id: String,
}

/// A move as submitted by a client, and as echoed to the other participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovePayload {
    /// Origin square, e.g. `e2`.
    pub move_from_square: String,
    /// Destination square, e.g. `e4`.
    pub move_to_square: String,
    /// Standard algebraic notation, e.g. `e4`.
    pub move_notation: String,
}

/// Raw inbound envelope.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    /// Full game snapshot, sent on every attach.
    #[serde(rename = "welcome")]
    Welcome(GameSnapshot),

    /// Both seats are ready; white to move.
    #[serde(rename = "game_started")]
    GameStarted {},

    /// A move was applied.
    #[serde(rename = "player_moved")]
    PlayerMoved(MovePayload),

    /// The game is over.
    #[serde(rename = "game_ended")]
    GameEnded(GameEndedInfo),

    /// Matchmaking paired this player.
    #[serde(rename = "matchFound")]
    MatchFound(MatchFoundInfo),

    /// Terminal instruction. The transport is closed right after it.
    #[serde(rename = "quit")]
    Quit {
        /// Why the connection is being closed.
        reason: String,
    },

    /// Liveness probe. Clients answer with a `ping` of their own.
    #[serde(rename = "ping")]
    Ping {},
}

/// Game lifecycle as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    /// Waiting for both seats to attach.
    #[serde(rename = "waiting")]
    WaitingPlayers,
    /// Moves are being accepted.
    Ongoing,
    /// Terminal.
    Ended,
}

/// Snapshot carried by `welcome`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    /// Room identifier.
    pub room_id: GameId,
    /// White seat.
    pub white_id: PlayerId,
    /// White display name.
    pub white_username: String,
    /// Black seat.
    pub black_id: PlayerId,
    /// Black display name.
    pub black_username: String,
    /// Current position (FEN).
    pub fen: String,
    /// Move history (PGN movetext).
    pub pgn: String,
    /// Origin square of the last move.
    pub last_move_from: Option<String>,
    /// Destination square of the last move.
    pub last_move_to: Option<String>,
    /// Current status.
    pub status: GameStatus,
    /// Winner id, `"draw"`, or empty while undecided.
    pub winner: String,
}

/// Payload of `game_ended`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameEndedInfo {
    /// Winner id or `"draw"`.
    pub winner: String,
}

/// Payload of `matchFound`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchFoundInfo {
    /// Room to `init` into.
    pub room_id: GameId,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Malformed inbound frame. Terminates only the offending connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Not JSON, or not an envelope.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),

    /// Envelope type is not part of the protocol.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// Payload does not match the message type.
    #[error("invalid payload for {kind}: {source}")]
    InvalidPayload {
        /// Message type.
        kind: String,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode an inbound frame.
    ///
    /// `data` may be an object, absent, `null`, or a string holding JSON
    /// (older clients double-encode payloads); the empty string counts as `{}`.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(s).map_err(ProtocolError::InvalidEnvelope)?;
        let Envelope { kind, data } = envelope;

        match kind.as_str() {
            "init" => Ok(Self::Init(decode_payload(&kind, data)?)),
            "player_moved" => Ok(Self::PlayerMoved(decode_payload(&kind, data)?)),
            "resign" => Ok(Self::Resign),
            "ping" => Ok(Self::Ping),
            "joinQueue" => Ok(Self::JoinQueue),
            "leaveQueue" => Ok(Self::LeaveQueue),
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }
}

fn decode_payload<T: DeserializeOwned>(kind: &str, data: Value) -> Result<T, ProtocolError> {
    let invalid = |source| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        source,
    };

    let data = match data {
        Value::String(s) if s.trim().is_empty() => Value::Object(Default::default()),
        Value::String(s) => serde_json::from_str(&s).map_err(invalid)?,
        Value::Null => Value::Object(Default::default()),
        other => other,
    };

    serde_json::from_value(data).map_err(invalid)
}

impl ServerMessage {
    /// Build a terminal instruction.
    pub fn quit(reason: impl Into<String>) -> Self {
        Self::Quit { reason: reason.into() }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
