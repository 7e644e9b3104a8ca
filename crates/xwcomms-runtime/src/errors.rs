//! Runtime error types

use xwcomms_core::{CommsError, GameId, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Channel error: {reason}")]
    Channel { reason: String },

    #[error("No running game {game_id}")]
    GameNotFound { game_id: GameId },

    #[error("Game {game_id} is already running")]
    GameExists { game_id: GameId },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error(transparent)]
    Core(#[from] CommsError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RuntimeError {
    pub fn channel_closed(what: &str) -> Self {
        Self::Channel {
            reason: format!("{} closed", what),
        }
    }
}

pub type Result<T> = core::result::Result<T, RuntimeError>;
