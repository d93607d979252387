//! Errors surfaced by Playnet services.

use playnet_core::WireError;

#[derive(Debug, thiserror::Error)]
pub enum PlayError {
    #[error("malformed message: {0}")]
    Format(#[from] WireError),

    #[error("timed out waiting for a reply")]
    Timeout,

    #[error("request was cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("an asynchronous enumeration is already running")]
    AlreadyRunning,

    #[error("no capacity left in {0}")]
    NoCapacity(&'static str),

    #[error("request of {requested} bytes exceeds the {limit} byte limit")]
    RequestTooLarge { requested: usize, limit: usize },

    #[error("buffer too small: {required} bytes required")]
    BufferTooSmall { required: usize },

    #[error("cannot create player: {0}")]
    CannotCreatePlayer(&'static str),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("connection already initialized")]
    AlreadyInitialized,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type PlayResult<T> = Result<T, PlayError>;
