use thiserror::Error;

/// Error type for engine operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("quiz game lottery {0} not found")]
    LotteryNotFound(String),
    #[error("quiz game {0} not found")]
    GameNotFound(String),
    #[error("quiz game {0} already finished")]
    GameFinished(String),
    #[error("quiz game {0} cannot terminate")]
    Unterminable(String),
    #[error("quiz game lottery {0} still owns games")]
    LotteryBusy(String),
    #[error("unknown answer option {option_id} for quiz game {game_id}")]
    UnknownOption { game_id: String, option_id: String },
    #[error("participation store: {0:#}")]
    Store(anyhow::Error),
    #[error("persistence: {0:#}")]
    Persistence(anyhow::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
