//! Error type shared by the relay device, its wire protocol and the daemon's
//! relay source.

use std::io;

/// Errors surfaced by relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Unknown or stale handle, framebuffer or record id.
    #[error("no such object")]
    NotFound,
    /// Another consumer already owns the event channel.
    #[error("a consumer is already attached")]
    Busy,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The consumer registration was torn down while waiting.
    #[error("relay registration torn down")]
    Disconnected,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Stable identifier used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::NotFound => "not_found",
            RelayError::Busy => "busy",
            RelayError::InvalidArgument(_) => "invalid_argument",
            RelayError::Disconnected => "disconnected",
            RelayError::Protocol(_) => "protocol",
            RelayError::Io(_) => "io",
        }
    }

    /// Rebuild an error from its wire representation.
    pub fn from_wire(kind: &str, message: String) -> Self {
        match kind {
            "not_found" => RelayError::NotFound,
            "busy" => RelayError::Busy,
            "invalid_argument" => RelayError::InvalidArgument("rejected by relay"),
            "disconnected" => RelayError::Disconnected,
            "io" => RelayError::Io(io::Error::other(message)),
            _ => RelayError::Protocol(message),
        }
    }
}

impl From<nix::errno::Errno> for RelayError {
    fn from(errno: nix::errno::Errno) -> Self {
        RelayError::Io(io::Error::from(errno))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
