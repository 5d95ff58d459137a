//! Domain types shared across crates.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Protocol used to talk to a probed port.
///
/// Config files and command-line strings share one parser, so the `h2`/`h2c`
/// aliases and any letter case are accepted in both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ProbeProtocol {
    Http,
    Https,
    /// HTTP/2 over TLS
    Http2,
    /// HTTP/2 cleartext (prior knowledge)
    Http2c,
    Ws,
    Wss,
}

impl ProbeProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Http2 => "http2",
            Self::Http2c => "http2c",
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }

    /// URL scheme used on the wire.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Http | Self::Http2c => "http",
            Self::Https | Self::Http2 => "https",
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, Self::Ws | Self::Wss)
    }
}

impl fmt::Display for ProbeProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "http2" | "h2" => Ok(Self::Http2),
            "http2c" | "h2c" => Ok(Self::Http2c),
            "ws" => Ok(Self::Ws),
            "wss" => Ok(Self::Wss),
            other => Err(format!("unknown probe protocol '{other}'")),
        }
    }
}

impl TryFrom<String> for ProbeProtocol {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProbeProtocol> for String {
    fn from(protocol: ProbeProtocol) -> Self {
        protocol.as_str().to_owned()
    }
}

/// One request template applied against every probed port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeCommand {
    /// Explicit protocol; inferred from the port when absent
    pub protocol: Option<ProbeProtocol>,
    pub method: String,
    pub resource: String,
    /// Raw `Name: value` header lines
    pub headers: Vec<String>,
    pub body: Option<String>,
    /// Takes precedence over `body`
    pub body_file: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub crawl: bool,
}

impl Default for ProbeCommand {
    fn default() -> Self {
        Self {
            protocol: None,
            method: "GET".to_owned(),
            resource: "/".to_owned(),
            headers: Vec::new(),
            body: None,
            body_file: None,
            username: None,
            password: None,
            crawl: false,
        }
    }
}

impl ProbeCommand {
    /// Parses the compact `[protocol:]METHOD:/resource` form used on the command line.
    ///
    /// `GET:/health`, `post:/api`, `https:GET:/` and a bare `/path` are accepted.
    pub fn parse_compact(spec: &str) -> Result<Self, String> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err("empty probe command".to_owned());
        }
        if spec.starts_with('/') {
            return Ok(Self {
                resource: spec.to_owned(),
                ..Self::default()
            });
        }

        let parts: Vec<&str> = spec.splitn(3, ':').collect();
        let (protocol, method, resource) = match parts.as_slice() {
            [method, resource] => (None, *method, *resource),
            [proto, method, resource] => (Some(proto.parse::<ProbeProtocol>()?), *method, *resource),
            _ => return Err(format!("malformed probe command '{spec}'")),
        };

        if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(format!("invalid method in probe command '{spec}'"));
        }
        let resource = if resource.is_empty() {
            "/".to_owned()
        } else if resource.starts_with('/') {
            resource.to_owned()
        } else {
            format!("/{resource}")
        };

        Ok(Self {
            protocol,
            method: method.to_ascii_uppercase(),
            resource,
            ..Self::default()
        })
    }
}

/// A container port key such as `8080/tcp`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortKey {
    pub port: u16,
    pub proto: String,
}

impl PortKey {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            proto: "tcp".to_owned(),
        }
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.proto)
    }
}

impl FromStr for PortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (port, proto) = match s.split_once('/') {
            Some((port, proto)) => (port, proto.to_ascii_lowercase()),
            None => (s, "tcp".to_owned()),
        };
        if !matches!(proto.as_str(), "tcp" | "udp" | "sctp") {
            return Err(format!("invalid port protocol in '{s}'"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port number in '{s}'"))?;
        Ok(Self { port, proto })
    }
}

impl TryFrom<String> for PortKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortKey> for String {
    fn from(key: PortKey) -> Self {
        key.to_string()
    }
}

/// A container port published on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailablePort {
    pub container: PortKey,
    pub host_ip: String,
    pub host_port: u16,
}

/// How the host reaches the sensor IPC ports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpcMode {
    /// Container IP and container ports
    Direct,
    /// Docker host IP and published host ports
    #[default]
    Proxy,
}

impl FromStr for IpcMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "proxy" => Ok(Self::Proxy),
            other => Err(format!("unknown ipc mode '{other}'")),
        }
    }
}

/// Strategy for deciding when the instrumented container has run long enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContinueAfterMode {
    /// Wait for a line on stdin
    Enter,
    /// Wait for SIGUSR1
    Signal,
    /// Wait for a fixed duration
    Timeout,
    /// Wait for the HTTP probe to finish
    Probe,
    /// Run one command inside the container
    Exec,
    /// Run host-side probe commands
    HostExec,
}

impl ContinueAfterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enter => "enter",
            Self::Signal => "signal",
            Self::Timeout => "timeout",
            Self::Probe => "probe",
            Self::Exec => "exec",
            Self::HostExec => "host-exec",
        }
    }
}

impl fmt::Display for ContinueAfterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContinueAfterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "enter" => Ok(Self::Enter),
            "signal" => Ok(Self::Signal),
            "timeout" => Ok(Self::Timeout),
            "probe" => Ok(Self::Probe),
            "exec" => Ok(Self::Exec),
            "host-exec" => Ok(Self::HostExec),
            other => Err(format!("unknown continue-after mode '{other}'")),
        }
    }
}

/// Default wait for the `timeout` continue-after mode.
pub const DEFAULT_CONTINUE_AFTER_TIMEOUT_SECS: u64 = 60;

/// Parsed continue-after mode string.
///
/// Modes are `&`-joined and kept in declaration order with duplicates removed.
/// A bare number means `timeout` with that many seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinueAfterSpec {
    pub modes: Vec<ContinueAfterMode>,
    /// Set when the mode string itself carried the timeout
    pub timeout_secs: Option<u64>,
}

impl ContinueAfterSpec {
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut modes = Vec::new();
        let mut timeout_secs = None;

        for token in spec.split('&').map(str::trim) {
            if token.is_empty() {
                return Err(format!("empty mode in continue-after '{spec}'"));
            }
            let mode = if let Ok(secs) = token.parse::<u64>() {
                timeout_secs = Some(secs);
                ContinueAfterMode::Timeout
            } else {
                token.parse::<ContinueAfterMode>()?
            };
            if !modes.contains(&mode) {
                modes.push(mode);
            }
        }

        Ok(Self {
            modes,
            timeout_secs,
        })
    }

    pub fn contains(&self, mode: ContinueAfterMode) -> bool {
        self.modes.contains(&mode)
    }
}
