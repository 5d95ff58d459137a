//! Probe engine error type.
//!
//! Per-attempt failures are counted, not returned. These errors cover
//! setup problems and host-side probe commands.

use slimprobe_core::error::{ProbeError, SlimprobeError};

#[derive(Debug, thiserror::Error)]
pub enum HttpProbeError {
    /// HTTP client could not be built
    #[error("http client setup failed: {0}")]
    Client(String),

    #[error("invalid probe command: {0}")]
    InvalidCommand(String),

    #[error("failed to read body file '{path}': {reason}")]
    BodyFile { path: String, reason: String },

    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Host-side probe command failed to parse, start or finish
    #[error("host probe '{command}' failed: {reason}")]
    HostExec { command: String, reason: String },

    /// The probe task ended without publishing a summary
    #[error("probe task ended without a summary")]
    Aborted,
}

impl From<HttpProbeError> for SlimprobeError {
    fn from(err: HttpProbeError) -> Self {
        match err {
            HttpProbeError::Client(msg) => SlimprobeError::Probe(ProbeError::Client(msg)),
            HttpProbeError::BodyFile { path, reason } => {
                SlimprobeError::Probe(ProbeError::BodyFile { path, reason })
            }
            other @ (HttpProbeError::InvalidCommand(_)
            | HttpProbeError::WebSocket(_)
            | HttpProbeError::HostExec { .. }
            | HttpProbeError::Aborted) => {
                SlimprobeError::Probe(ProbeError::InvalidCommand(other.to_string()))
            }
        }
    }
}
