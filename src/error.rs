use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Streaming not supported by agent: {0}")]
    StreamingUnsupported(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection gone: {0}")]
    ConnectionGone(String),

    #[error("Invocation error: {0}")]
    InvocationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Environment variable error: {0}")]
    EnvVarError(#[from] std::env::VarError),
}

impl RelayError {
    /// Whether this error means the client connection can no longer be written to
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            RelayError::TransportError(_) | RelayError::ConnectionGone(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
