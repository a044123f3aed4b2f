//! Core identifiers shared by every layer.

pub mod ids;

pub use ids::{GameId, PlayerId};
