//! Wire frames shared by both channels.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::IpcError;

pub const FRAME_HEADER: &str = "[<|]";
pub const FRAME_TRAILER: &str = "[|>]\n";

/// Lines longer than this are rejected instead of buffered.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    #[serde(rename = "ft.request")]
    Request,
    #[serde(rename = "ft.response")]
    Response,
    #[serde(rename = "ft.event")]
    Event,
    #[serde(rename = "ft.error")]
    Error,
    #[serde(rename = "ft.control")]
    Control,
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Request => "ft.request",
            Self::Response => "ft.response",
            Self::Event => "ft.event",
            Self::Error => "ft.error",
            Self::Control => "ft.control",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub tid: String,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl Frame {
    /// New frame with a fresh transaction id.
    pub fn new(frame_type: FrameType, body: Option<serde_json::Value>) -> Self {
        Self {
            tid: generate_tid(),
            frame_type,
            body,
        }
    }

    /// Reply frame reusing the request's transaction id.
    pub fn reply(&self, frame_type: FrameType, body: Option<serde_json::Value>) -> Self {
        Self {
            tid: self.tid.clone(),
            frame_type,
            body,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, IpcError> {
        let json = serde_json::to_vec(self).map_err(|e| IpcError::Encode(e.to_string()))?;
        let mut out = Vec::with_capacity(FRAME_HEADER.len() + json.len() + FRAME_TRAILER.len());
        out.extend_from_slice(FRAME_HEADER.as_bytes());
        out.extend_from_slice(&json);
        out.extend_from_slice(FRAME_TRAILER.as_bytes());
        Ok(out)
    }

    /// Decodes one raw line including its trailing newline.
    pub fn decode(raw: &[u8]) -> Result<Self, IpcError> {
        let header = FRAME_HEADER.as_bytes();
        let trailer = FRAME_TRAILER.as_bytes();
        if raw.len() <= header.len() + trailer.len()
            || !raw.starts_with(header)
            || !raw.ends_with(trailer)
        {
            return Err(IpcError::Malformed(format!(
                "missing frame delimiters ({} bytes)",
                raw.len()
            )));
        }
        let data = &raw[header.len()..raw.len() - trailer.len()];
        serde_json::from_slice(data).map_err(|e| IpcError::Malformed(e.to_string()))
    }
}

/// `<unix nanos>.<16 hex chars>`
pub fn generate_tid() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{nanos}.{}", &random[..16])
}
