//! Workspace-wide error domain.

use thiserror::Error;

/// Crate-local result alias defaulting to [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Error domain shared across the Wisp workspace.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying socket or filesystem failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Message encode/decode failure.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// Invalid or unusable configuration.
    #[error("config: {0}")]
    Config(String),
    /// Protocol violation or unusable peer data.
    #[error("protocol: {0}")]
    Protocol(String),
}

impl Error {
    /// Build a configuration error from any message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Build a protocol error from any message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

// Map TOML deserialization errors into the config error domain without adding a new variant
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
