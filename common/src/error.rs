// Error types for the skyrelay services
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Reconnect budget exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Operation attempted after terminate")]
    Terminated,

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
