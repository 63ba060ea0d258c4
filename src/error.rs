use thiserror::Error;

use crate::server::registry::ConnId;

/// Failures while pulling the next frame off a connection.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("invalid UTF-8 in frame: {0}")]
    Decode(#[from] std::string::FromUtf8Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// A session lifecycle bug: the same connection was registered twice.
    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnId),
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("log sink IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log sink serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("log sink queue is full, entry dropped")]
    QueueFull,

    #[error("log sink writer has stopped")]
    Closed,

    #[error("log sink rejected entry: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, RelayError>;
