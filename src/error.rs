use thiserror::Error;

/// Failures raised synchronously at the point of misuse. None of these are
/// retried; the coordination protocol carries no timeout or retry layer.
#[derive(Debug, Error)]
pub enum WormerError {
    #[error("worm is already attached to a different engine; detach it first")]
    AlreadyAttached,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("malformed gene: {0}")]
    MalformedGene(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

pub type Result<T> = std::result::Result<T, WormerError>;
