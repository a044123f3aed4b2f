//! # Chess Arena Server
//!
//! Real-time matchmaking and live game sessions for two-player chess.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CHESS ARENA SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/            - Identifiers                              │
//! │  └── ids.rs       - PlayerId / GameId                        │
//! │                                                              │
//! │  game/            - Session tier                             │
//! │  ├── rules.rs     - Board, move decoding, outcomes           │
//! │  ├── session.rs   - One live game and its participants       │
//! │  ├── registry.rs  - Players, games, game-ended feed          │
//! │  └── record.rs    - User / game repositories                 │
//! │                                                              │
//! │  matchmaking/     - Matchmaking tier                         │
//! │  ├── manager.rs   - Queue, statuses, pairing loop            │
//! │  ├── rpc.rs       - Room requests and game-ended stream      │
//! │  └── lobby.rs     - /matchmaking connection handler          │
//! │                                                              │
//! │  network/         - Transport                                │
//! │  ├── server.rs    - Accept loop, handshake auth, routing     │
//! │  ├── connection.rs- Player Session (/game handler)           │
//! │  ├── outbox.rs    - Bounded outbound queue + writer          │
//! │  ├── protocol.rs  - Wire messages                            │
//! │  └── auth.rs      - Token validation                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! A client joins the queue over `/matchmaking`. The pairing loop takes the
//! two oldest searching players, asks the session tier for a room and sends
//! both `matchFound`. Each then connects to `/game` and sends `init` with the
//! room id. When the game ends the record is persisted, everyone is told the
//! result, the connections are closed and the matchmaker is notified so both
//! players return to idle.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod matchmaking;
pub mod network;

// Re-export commonly used types
pub use core::ids::{GameId, PlayerId};
pub use game::registry::{RegistryConfig, SessionRegistry};
pub use game::session::GameSession;
pub use matchmaking::manager::{Matchmaker, MatchmakingConfig};
pub use network::connection::PlayerSession;
pub use network::server::{GameServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
