//! Probe target port ordering.

use tracing::debug;

use slimprobe_core::types::{AvailablePort, PortKey};

use crate::protocol::{DEFAULT_HTTP_PORT, DEFAULT_HTTPS_PORT};

/// Ports to probe, in order.
///
/// `direct` selects container ports (the probe reaches the container IP);
/// otherwise the published host ports are used. Only tcp ports are probed.
///
/// - explicit ports are kept in order, filtered to the published ones
/// - otherwise `EXPOSE` ports go first (last declared first), then any
///   remaining published ports by container port
///
/// Port 80 is moved ahead of 443 when both are present.
pub fn derive_probe_ports(
    explicit: &[u16],
    exposed: &[PortKey],
    available: &[AvailablePort],
    direct: bool,
) -> Vec<u16> {
    let tcp: Vec<&AvailablePort> = available
        .iter()
        .filter(|p| p.container.proto == "tcp")
        .collect();
    let target = |p: &AvailablePort| if direct { p.container.port } else { p.host_port };

    let mut ports = Vec::new();
    if !explicit.is_empty() {
        for port in explicit {
            match tcp.iter().find(|p| p.container.port == *port) {
                Some(p) => ports.push(target(p)),
                None => debug!(port, "ignoring unpublished target port"),
            }
        }
    } else {
        let mut remaining = tcp.clone();
        for key in exposed.iter().rev() {
            if let Some(idx) = remaining.iter().position(|p| p.container == *key) {
                let p = remaining.remove(idx);
                ports.push(target(p));
            } else {
                debug!(port = %key, "exposed port is not published");
            }
        }
        remaining.sort_by_key(|p| p.container.port);
        ports.extend(remaining.into_iter().map(target));
    }

    let http = ports.iter().position(|p| *p == DEFAULT_HTTP_PORT);
    let https = ports.iter().position(|p| *p == DEFAULT_HTTPS_PORT);
    if let (Some(http), Some(https)) = (http, https) {
        if https < http {
            ports.swap(http, https);
        }
    }
    ports
}
