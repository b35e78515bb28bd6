//! Error types for ProxyHub.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid tunnel id: {0}")]
    InvalidStableId(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
