//! Request templates built from probe commands.

use std::path::Path;

use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

use slimprobe_core::types::ProbeCommand;

use crate::error::HttpProbeError;

/// A probe command resolved once and re-sent on every attempt.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub method: Method,
    pub resource: String,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    pub auth: Option<(String, String)>,
}

impl ProbeRequest {
    /// Resolves method, headers, credentials and body.
    ///
    /// A body file is preferred over the literal body. An unreadable body
    /// file is logged and the request goes out without a body.
    pub async fn from_command(cmd: &ProbeCommand) -> Result<Self, HttpProbeError> {
        let method_name = if cmd.method.is_empty() { "GET" } else { cmd.method.as_str() };
        let method = Method::from_bytes(method_name.to_ascii_uppercase().as_bytes())
            .map_err(|_| HttpProbeError::InvalidCommand(format!("bad method '{}'", cmd.method)))?;

        let mut headers = HeaderMap::new();
        for line in &cmd.headers {
            match parse_header_line(line) {
                Some((name, value)) => {
                    headers.append(name, value);
                }
                None => debug!(header = %line, "ignoring malformed header"),
            }
        }

        let body = match &cmd.body_file {
            Some(path) => match read_body_file(path).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(error = %e, "probe body not sent");
                    None
                }
            },
            None => cmd.body.as_ref().map(|b| b.clone().into_bytes()),
        };

        let auth = (cmd.username.is_some() || cmd.password.is_some()).then(|| {
            (
                cmd.username.clone().unwrap_or_default(),
                cmd.password.clone().unwrap_or_default(),
            )
        });

        Ok(Self {
            method,
            resource: normalize_resource(&cmd.resource),
            headers,
            body,
            auth,
        })
    }

    /// Builds a fresh request against `base` (`scheme://host:port`).
    pub fn build(&self, client: &reqwest::Client, base: &str) -> reqwest::RequestBuilder {
        let mut req = client
            .request(self.method.clone(), format!("{base}{}", self.resource))
            .headers(self.headers.clone());
        if let Some((user, pass)) = &self.auth {
            req = req.basic_auth(user, Some(pass));
        }
        if let Some(body) = &self.body {
            req = req.body(body.clone());
        }
        req
    }
}

/// Splits `Name: value` on the first colon.
pub fn parse_header_line(line: &str) -> Option<(HeaderName, HeaderValue)> {
    let (name, value) = line.split_once(':')?;
    let name = HeaderName::from_bytes(name.trim().as_bytes()).ok()?;
    let value = HeaderValue::from_str(value.trim()).ok()?;
    Some((name, value))
}

fn normalize_resource(resource: &str) -> String {
    if resource.is_empty() {
        "/".to_owned()
    } else if resource.starts_with('/') {
        resource.to_owned()
    } else {
        format!("/{resource}")
    }
}

async fn read_body_file(path: &Path) -> Result<Vec<u8>, HttpProbeError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| HttpProbeError::BodyFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}
