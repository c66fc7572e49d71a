//! Binance collaborator errors

use wsfeed_core::ClientError;

/// Result type for Binance operations
pub type BinanceResult<T> = Result<T, BinanceError>;

#[derive(Debug, thiserror::Error)]
pub enum BinanceError {
    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("Invalid trade signal: {0}")]
    InvalidSignal(String),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
