//! Matchmaking
//!
//! - `manager`: Queue, statuses and the pairing loop
//! - `rpc`: The boundary to the session tier (room requests, game-ended feed)
//! - `lobby`: The `/matchmaking` WebSocket handler

pub mod lobby;
pub mod manager;
pub mod rpc;

pub use manager::{Matchmaker, MatchmakingConfig, QueueStatus, TickOutcome};
pub use rpc::{LocalRoomService, RoomResponse, RoomService, RoomServiceError};
