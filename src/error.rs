//! Error types for mavsession.
//!
//! Transport and protocol faults are mostly handled inside the session task
//! (state transitions, logging, events). The variants here are what escapes
//! through explicit calls such as `connect`, `send_command` or
//! `start_mission_upload`.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Opening, reading or writing the link failed
    #[error("Transport error on '{endpoint}': {source}")]
    Transport {
        /// Endpoint description (address or device)
        endpoint: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Serial port errors (device not found, permission denied, hardware issues)
    #[error("Serial port error on '{device}': {source}")]
    Serial {
        /// Path to the serial device
        device: String,
        /// Underlying serial error
        #[source]
        source: tokio_serial::Error,
    },

    /// No heartbeat arrived before the connect deadline
    #[error("No heartbeat from '{endpoint}' within {timeout:?}")]
    ProtocolTimeout {
        /// Endpoint description
        endpoint: String,
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// The vehicle asked for a mission item outside the uploaded list
    #[error("Mission item {requested} requested but upload holds {total} items")]
    SequenceMismatch {
        /// Sequence number the vehicle asked for
        requested: u16,
        /// Number of items in the upload
        total: u16,
    },

    /// A decoded message carried fields a handler could not use
    #[error("Malformed {message}: {reason}")]
    MalformedMessage {
        /// MAVLink message name
        message: &'static str,
        /// What was wrong with it
        reason: String,
    },

    #[error("Not connected")]
    NotConnected,

    #[error("A mission upload is already in progress")]
    UploadInProgress,

    #[error("Invalid parameter name '{0}' (must be 1 to 16 bytes)")]
    InvalidParameterName(String),

    #[error("Unknown message name '{0}'")]
    UnknownMessage(String),

    #[error("Unknown flight mode '{0}'")]
    UnknownMode(String),

    /// Encoding an outbound frame failed
    #[error("Encode error: {0}")]
    Encode(String),

    /// Configuration-related errors (parsing, validation, missing files)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation was interrupted by `disconnect`
    #[error("Connection attempt cancelled")]
    Cancelled,
}

/// Type alias for Results that use SessionError
pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new transport error
    pub fn transport(endpoint: impl Into<String>, source: io::Error) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Create a new serial error
    pub fn serial(device: impl Into<String>, source: tokio_serial::Error) -> Self {
        Self::Serial {
            device: device.into(),
            source,
        }
    }

    /// Create a new malformed-message error
    pub fn malformed(message: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message,
            reason: reason.into(),
        }
    }

    /// Whether the error came from the link rather than from the caller.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Serial { .. } | Self::ProtocolTimeout { .. }
        )
    }
}

/// Convert from anyhow::Error (configuration loading uses anyhow contexts)
impl From<anyhow::Error> for SessionError {
    fn from(err: anyhow::Error) -> Self {
        Self::Config(format!("{:#}", err))
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        Self::Transport {
            endpoint: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<tokio_serial::Error> for SessionError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::Serial {
            device: "unknown".to_string(),
            source: err,
        }
    }
}
