//! Error types for the tunnel core.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::transport::{EngineState, Handle};

/// Errors reported by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("tunnel engine unavailable: {0}")]
    Unavailable(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid transport handle {0}")]
    InvalidHandle(Handle),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Lifecycle-level failures of the tunnel as a whole.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("tunnel not ready, state: {0}")]
    TunnelNotReady(EngineState),

    #[error("tunnel connection failed: {0}")]
    ConnectFailed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),
}

impl From<TransportError> for TunnelError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable(reason) => Self::TransportUnavailable(reason),
            TransportError::ConnectFailed(_) | TransportError::Timeout(_) => {
                Self::ConnectFailed(err.to_string())
            }
            TransportError::InvalidHandle(_) => Self::ProtocolMisuse(err.to_string()),
            TransportError::Io(e) => Self::Io(e.to_string()),
        }
    }
}

/// Errors surfaced by a [`ChannelBridge`](crate::bridge::ChannelBridge).
///
/// These are local to one session and never affect the tunnel itself.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("tunnel not ready, state: {0}")]
    TunnelNotReady(EngineState),

    #[error("connection to {addr} failed: {reason}")]
    ConnectFailed { addr: SocketAddr, reason: String },

    #[error("connect attempt was abandoned before completing")]
    Abandoned,

    #[error("I/O error: {0}")]
    Io(#[from] TransportError),

    #[error("channel is closed")]
    Closed,

    #[error("channel output is shut down")]
    OutputShutdown,

    #[error("unsupported message type: {0}")]
    UnsupportedMessage(&'static str),

    #[error("protocol misuse: {0}")]
    ProtocolMisuse(&'static str),
}

impl ChannelError {
    /// Whether this error is an integration defect rather than a runtime condition.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::ProtocolMisuse(_) | Self::UnsupportedMessage(_))
    }
}

/// Errors loading or saving the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access config file: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}
