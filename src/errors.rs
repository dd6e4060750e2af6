//! Error types for the Cartela bingo engine.
//!
//! Validation failures are reported back to the originating client only and
//! never abort a room; infrastructure failures bubble up so the worker can
//! restart with backoff.

use thiserror::Error;

/// Root error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("State store error: {0}")]
    Store(String),

    #[error("Game error: {0}")]
    Game(#[from] GameError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Room-lifecycle validation errors. These are always targeted at the
/// originating client; the room keeps running.
#[derive(Debug, Error, PartialEq)]
pub enum GameError {
    #[error("Game already in progress. Please wait for next round.")]
    GameInProgress,

    #[error("Card(s) already selected: {0:?}")]
    CardConflict(Vec<i64>),

    #[error("User not found")]
    UserNotFound,

    #[error("User account is inactive.")]
    UserInactive,

    #[error("Insufficient balance.")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("Not enough players to start")]
    NotEnoughPlayers,

    #[error("Game not found")]
    GameNotFound,

    #[error("No active game to check bingo.")]
    NoActiveGame,

    #[error("Invalid stake: {0}")]
    InvalidStake(String),

    #[error("player_id and card_id required")]
    MissingField,
}

/// Settlement-path errors.
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("Game {0} is already finalized")]
    AlreadyFinalized(i64),

    #[error("User {user_id} holds no cards in game {game_id}")]
    NotAParticipant { user_id: i64, game_id: i64 },
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required field: {0}")]
    MissingRequired(String),
}

impl From<redis::RedisError> for EngineError {
    fn from(e: redis::RedisError) -> Self {
        EngineError::Store(e.to_string())
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Gateway(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_game_error_messages_match_client_contract() {
        assert_eq!(
            GameError::GameInProgress.to_string(),
            "Game already in progress. Please wait for next round."
        );
        assert_eq!(
            GameError::InsufficientFunds {
                required: 20.0,
                available: 15.0
            }
            .to_string(),
            "Insufficient balance."
        );
    }

    #[test]
    fn test_error_conversion() {
        let err: EngineError = GameError::NotEnoughPlayers.into();
        match err {
            EngineError::Game(GameError::NotEnoughPlayers) => {}
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_card_conflict_lists_cards() {
        let err = GameError::CardConflict(vec![4, 9]);
        assert!(err.to_string().contains("[4, 9]"));
    }

    #[test]
    fn test_invalid_stake_names_the_value() {
        let err = GameError::InvalidStake("13".to_string());
        assert_eq!(err.to_string(), "Invalid stake: 13");
    }
}
