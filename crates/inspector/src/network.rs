//! Address resolution for the sensor IPC and probe targets.

use slimprobe_core::types::{AvailablePort, IpcMode, PortKey};

use crate::docker::ContainerDetails;
use crate::error::InspectorError;
use crate::launch::PortPlan;

const LOOPBACK: &str = "127.0.0.1";

/// Where the host reaches the sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcTarget {
    pub host: String,
    pub cmd_port: u16,
    pub evt_port: u16,
}

/// Published container ports usable for probing.
///
/// IPC ports and bindings without a host port are left out. A host-networked
/// container publishes nothing, so its planned tcp ports are reached on
/// loopback at the container port.
pub fn available_ports(
    details: &ContainerDetails,
    plan: &PortPlan,
    cmd_port: u16,
    evt_port: u16,
) -> Vec<AvailablePort> {
    let ipc = [PortKey::tcp(cmd_port), PortKey::tcp(evt_port)];
    if details.is_host_network() {
        return plan
            .exposed
            .iter()
            .filter(|key| key.proto == "tcp" && !ipc.contains(key))
            .map(|key| AvailablePort {
                container: key.clone(),
                host_ip: LOOPBACK.to_owned(),
                host_port: key.port,
            })
            .collect();
    }
    details
        .ports
        .iter()
        .filter(|(key, _)| !ipc.contains(key))
        .filter_map(|(key, hosts)| {
            let host = hosts.iter().find(|h| h.host_port != 0)?;
            Some(AvailablePort {
                container: key.clone(),
                host_ip: host.host_ip.clone(),
                host_port: host.host_port,
            })
        })
        .collect()
}

fn published_port(details: &ContainerDetails, port: u16) -> Result<u16, InspectorError> {
    details
        .ports
        .get(&PortKey::tcp(port))
        .and_then(|hosts| hosts.iter().find(|h| h.host_port != 0))
        .map(|h| h.host_port)
        .ok_or_else(|| InspectorError::Launch(format!("sensor ipc port {port} is not published")))
}

/// Resolves the IPC address for the given mode.
///
/// Host networking always uses the container ports since nothing is
/// published; `endpoint` overrides only the host part.
pub fn resolve_ipc_target(
    mode: IpcMode,
    endpoint: &str,
    details: &ContainerDetails,
    cmd_port: u16,
    evt_port: u16,
    docker_host_ip: &str,
) -> Result<IpcTarget, InspectorError> {
    let override_host = (!endpoint.is_empty()).then(|| endpoint.to_owned());

    if details.is_host_network() {
        return Ok(IpcTarget {
            host: override_host.unwrap_or_else(|| LOOPBACK.to_owned()),
            cmd_port,
            evt_port,
        });
    }

    match mode {
        IpcMode::Direct => {
            let host = match override_host {
                Some(host) => host,
                None => details
                    .reachable_ip()
                    .map(str::to_owned)
                    .ok_or_else(|| {
                        InspectorError::Launch("container has no reachable ip address".to_owned())
                    })?,
            };
            Ok(IpcTarget {
                host,
                cmd_port,
                evt_port,
            })
        }
        IpcMode::Proxy => Ok(IpcTarget {
            host: override_host.unwrap_or_else(|| docker_host_ip.to_owned()),
            cmd_port: published_port(details, cmd_port)?,
            evt_port: published_port(details, evt_port)?,
        }),
    }
}

/// Host the probe engine should target.
pub fn probe_host(mode: IpcMode, details: &ContainerDetails, docker_host_ip: &str) -> String {
    if details.is_host_network() {
        return LOOPBACK.to_owned();
    }
    match mode {
        IpcMode::Direct => details
            .reachable_ip()
            .map(str::to_owned)
            .unwrap_or_else(|| docker_host_ip.to_owned()),
        IpcMode::Proxy => docker_host_ip.to_owned(),
    }
}
