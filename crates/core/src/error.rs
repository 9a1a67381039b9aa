use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Failure reported by the remote operation handler. The message is the
    /// handler's own error string, carried verbatim in the response frame.
    #[error("{0}")]
    Operation(String),

    #[error("Connection lost while the call was pending")]
    ConnectionLost,

    #[error("Timed out waiting for a response to '{0}'")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
