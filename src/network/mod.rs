//! Network Layer
//!
//! WebSocket transport: wire messages, token checks, the per-player
//! connection handler and the accept loop.

pub mod auth;
pub mod connection;
pub mod outbox;
pub mod protocol;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{authenticate, validate_token, AuthConfig, AuthError, Identity, TokenClaims};
pub use connection::{ConnectionConfig, DispatchError, PlayerSession};
pub use outbox::{Outbox, WriterExit};
pub use protocol::{
    ClientMessage, GameSnapshot, GameStatus, MovePayload, ProtocolError, ServerMessage,
};
pub use server::{GameServer, ServerConfig, ServerError};
