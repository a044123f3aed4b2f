//! Game Module
//!
//! ## Module Structure
//!
//! - `rules`: Board state, move decoding and outcome detection
//! - `session`: One live game and its connected participants
//! - `registry`: Process-wide index of players and games
//! - `record`: Persisted user and game records

pub mod record;
pub mod registry;
pub mod rules;
pub mod session;

pub use record::{GameRecord, GameRepository, MemoryRepository, UserRecord, UserRepository};
pub use registry::{GameEndedEvent, RegistryConfig, RegistryError, SessionRegistry};
pub use rules::{ChessBoard, EndReason, Outcome, Side};
pub use session::{GameSession, MoveRejection, Winner};
