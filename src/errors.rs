// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the broadcast subsystem
//!
//! Server-level failures ([`ServerError`]) are surfaced through
//! `ServerState::Error`. Per-client ([`ClientFault`]) and per-frame
//! ([`EncodeError`]) faults are absorbed where they happen and only logged.

use std::fmt;
use std::io;

/// Result type alias for server operations
pub type ServerResult<T> = Result<T, ServerError>;

/// Server-level failures
///
/// `Clone` so the cause can be carried by `ServerState::Error` and observed by
/// any number of subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// No usable bind address could be determined
    HostResolution(String),
    /// The port is unavailable or already in use
    Bind { address: String, reason: String },
    /// Any other failure while bringing the listener up
    Start(String),
    /// Listener-level fault while running
    Transport(String),
    /// Shutdown did not complete cleanly
    Stop(String),
    /// The start attempt was cancelled by a newer start or stop request
    Superseded,
}

impl ServerError {
    /// Classify an I/O error raised by `bind`
    ///
    /// Only an occupied address is a `Bind` failure; privileged ports and
    /// foreign addresses get the generic start description.
    pub fn from_bind(address: String, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => ServerError::Bind {
                address,
                reason: err.to_string(),
            },
            _ => ServerError::Start(format!("{}: {}", address, err)),
        }
    }

    /// True for failures that end the server episode (everything except a
    /// superseded start)
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ServerError::Superseded)
    }

    /// Message suitable for showing to a user
    ///
    /// Port-in-use and unresolved-host failures get their own wording; all
    /// other causes fall back to the error description.
    pub fn user_message(&self) -> String {
        match self {
            ServerError::Bind { address, .. } => {
                format!("Address {} is already in use. Try another port.", address)
            }
            ServerError::HostResolution(_) => {
                "Could not determine the device address. Connect to a network or enable \
                 listening on all interfaces."
                    .to_string()
            }
            other => other.to_string(),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::HostResolution(msg) => write!(f, "Host resolution failed: {}", msg),
            ServerError::Bind { address, reason } => {
                write!(f, "Failed to bind {}: {}", address, reason)
            }
            ServerError::Start(msg) => write!(f, "Failed to start server: {}", msg),
            ServerError::Transport(msg) => write!(f, "Transport fault: {}", msg),
            ServerError::Stop(msg) => write!(f, "Failed to stop server cleanly: {}", msg),
            ServerError::Superseded => write!(f, "Start request superseded"),
        }
    }
}

impl std::error::Error for ServerError {}

/// Fault local to a single client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFault {
    /// WebSocket handshake failed or timed out
    Handshake(String),
    /// Sending to the client failed
    Send(String),
    /// Reading from the client failed
    Receive(String),
    /// The client's outbound lane is gone
    Disconnected,
}

impl fmt::Display for ClientFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientFault::Handshake(msg) => write!(f, "Handshake failed: {}", msg),
            ClientFault::Send(msg) => write!(f, "Send failed: {}", msg),
            ClientFault::Receive(msg) => write!(f, "Receive failed: {}", msg),
            ClientFault::Disconnected => write!(f, "Client disconnected"),
        }
    }
}

impl std::error::Error for ClientFault {}

/// Per-frame encoding fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Frame buffer does not match its declared dimensions
    InvalidFrame(String),
    /// The image codec rejected the frame
    Codec(String),
    /// The encoding task panicked or was cancelled
    Task(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
            EncodeError::Codec(msg) => write!(f, "Encoding failed: {}", msg),
            EncodeError::Task(msg) => write!(f, "Encoding task error: {}", msg),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Settings persistence errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    /// Stored record could not be decoded (recovered by defaulting)
    Deserialize(String),
    /// Record could not be encoded
    Serialize(String),
    /// A transformed record failed validation and was not stored
    Invalid(String),
    /// Backend storage failure
    Storage(String),
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::Deserialize(msg) => write!(f, "Failed to read settings: {}", msg),
            SettingsError::Serialize(msg) => write!(f, "Failed to write settings: {}", msg),
            SettingsError::Invalid(msg) => write!(f, "Invalid settings: {}", msg),
            SettingsError::Storage(msg) => write!(f, "Settings storage error: {}", msg),
        }
    }
}

impl std::error::Error for SettingsError {}

impl From<io::Error> for SettingsError {
    fn from(err: io::Error) -> Self {
        SettingsError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SettingsError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            SettingsError::Deserialize(err.to_string())
        } else {
            SettingsError::Serialize(err.to_string())
        }
    }
}

/// Frame source errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The requested configuration cannot be produced
    Unsupported(String),
    /// The source could not be opened
    Open(String),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::Unsupported(msg) => write!(f, "Unsupported capture configuration: {}", msg),
            CaptureError::Open(msg) => write!(f, "Failed to open frame source: {}", msg),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Control channel errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The server component is not reachable right now
    Unavailable(String),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Unavailable(msg) => write!(f, "Server component unavailable: {}", msg),
        }
    }
}

impl std::error::Error for ConnectError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_errors_are_classified() {
        let in_use = io::Error::new(io::ErrorKind::AddrInUse, "address in use");
        assert!(matches!(
            ServerError::from_bind("0.0.0.0:8080".into(), &in_use),
            ServerError::Bind { .. }
        ));

        let other = io::Error::other("boom");
        assert!(matches!(
            ServerError::from_bind("0.0.0.0:8080".into(), &other),
            ServerError::Start(_)
        ));

        for kind in [io::ErrorKind::PermissionDenied, io::ErrorKind::AddrNotAvailable] {
            let err = ServerError::from_bind("0.0.0.0:80".into(), &io::Error::from(kind));
            assert!(matches!(err, ServerError::Start(_)));
            assert!(!err.user_message().contains("in use"));
        }
    }

    #[test]
    fn test_user_messages_are_distinct() {
        let bind = ServerError::Bind {
            address: "0.0.0.0:8080".into(),
            reason: "in use".into(),
        };
        let host = ServerError::HostResolution("no address".into());
        let other = ServerError::Transport("listener closed".into());

        assert_ne!(bind.user_message(), host.user_message());
        assert!(bind.user_message().contains("0.0.0.0:8080"));
        assert_eq!(other.user_message(), other.to_string());
    }

    #[test]
    fn test_superseded_is_not_terminal() {
        assert!(!ServerError::Superseded.is_terminal());
        assert!(ServerError::Transport("x".into()).is_terminal());
    }
}
