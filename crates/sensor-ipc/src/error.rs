//! IPC error type.
//!
//! [`IpcError`] converts into [`SlimprobeError`] so the inspector can
//! propagate it with `?`.

use std::time::Duration;

use slimprobe_core::error::{SlimprobeError, TransportError};

use crate::frame::FrameType;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// A single read or write did not finish in time
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// Could not reach the sensor before the connect deadline
    #[error("gave up connecting to {addr} after {waited:?}")]
    WaitTimeout { addr: String, waited: Duration },

    #[error("connection to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the connection
    #[error("connection closed by sensor")]
    Closed,

    /// Nothing to send, or the reply had no body
    #[error("no data")]
    NoData,

    #[error("frame tid mismatch: expected {expected}, got {actual}")]
    TidMismatch { expected: String, actual: String },

    #[error("unexpected frame type {0}")]
    UnexpectedFrame(FrameType),

    /// Sensor answered with an error frame or an error status
    #[error("remote error: {0}")]
    Remote(String),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("encode error: {0}")]
    Encode(String),

    /// Channel used after the client was stopped
    #[error("ipc client is stopped")]
    Stopped,
}

impl IpcError {
    /// Timeouts are the only errors callers may retry on the same connection.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<IpcError> for SlimprobeError {
    fn from(err: IpcError) -> Self {
        let transport = match &err {
            IpcError::Timeout { .. } | IpcError::WaitTimeout { .. } => {
                TransportError::Timeout(err.to_string())
            }
            IpcError::Connect { .. } | IpcError::Io(_) | IpcError::Closed | IpcError::Stopped => {
                TransportError::Connection(err.to_string())
            }
            IpcError::Remote(msg) => TransportError::Remote(msg.clone()),
            IpcError::NoData
            | IpcError::TidMismatch { .. }
            | IpcError::UnexpectedFrame(_)
            | IpcError::Malformed(_)
            | IpcError::Encode(_) => TransportError::Protocol(err.to_string()),
        };
        SlimprobeError::Transport(transport)
    }
}
