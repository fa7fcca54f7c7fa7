use thiserror::Error;

/// Errors produced by the imx protocol and transport layers.
#[derive(Debug, Error)]
pub enum ImxError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("session not found: {0}")]
    SessionNotFound(u64),

    #[error("connection not found: {0}")]
    ConnectionNotFound(u64),

    #[error("queue closed: {0}")]
    QueueClosed(&'static str),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for ImxError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        ImxError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for ImxError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        ImxError::Codec(e.to_string())
    }
}

pub type ImxResult<T> = Result<T, ImxError>;
