//! Protocol candidates for a probe command on a port.

use slimprobe_core::types::ProbeProtocol;

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Protocols to try, in order.
///
/// An explicit protocol always wins. Otherwise 80 is `http`, 443 is
/// `https`, and any other port tries `http` then `https`.
pub fn infer_protocols(port: u16, explicit: Option<ProbeProtocol>) -> Vec<ProbeProtocol> {
    if let Some(protocol) = explicit {
        return vec![protocol];
    }
    match port {
        DEFAULT_HTTP_PORT => vec![ProbeProtocol::Http],
        DEFAULT_HTTPS_PORT => vec![ProbeProtocol::Https],
        _ => vec![ProbeProtocol::Http, ProbeProtocol::Https],
    }
}

/// `scheme://host:port`, bracketing IPv6 hosts.
pub fn base_url(protocol: ProbeProtocol, host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("{}://[{host}]:{port}", protocol.scheme())
    } else {
        format!("{}://{host}:{port}", protocol.scheme())
    }
}
