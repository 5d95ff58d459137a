//! Launch options for the instrumented container.
//!
//! Everything here is pure: configuration plus image metadata in, a
//! [`LaunchSpec`] out. The docker client turns the spec into API calls.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use slimprobe_core::config::{ContainerConfig, SensorConfig};
use slimprobe_core::error::{FatalError, IpcChannel};
use slimprobe_core::types::PortKey;

use crate::error::InspectorError;

/// Sensor binary location inside the container
pub const SENSOR_BIN_PATH: &str = "/opt/_slim/bin/slim-sensor";
/// Artifact directory inside the container
pub const ARTIFACTS_MOUNT_PATH: &str = "/opt/_slim/artifacts";
pub const CONTAINER_TYPE_LABEL: &str = "runtime.container.type";
pub const CONTAINER_TYPE_VALUE: &str = "_slim";
/// The sensor runs as root regardless of the application user
pub const SENSOR_USER: &str = "0:0";
pub const SENSOR_CAPABILITY: &str = "SYS_ADMIN";

/// Image metadata relevant to launching and probing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub reference: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub workdir: String,
    pub user: String,
    /// Ports in `EXPOSE` declaration order
    pub exposed_ports: Vec<PortKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Bind,
    Volume,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub kind: MountKind,
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl VolumeMount {
    pub fn bind(source: impl Into<String>, target: impl Into<String>, read_only: bool) -> Self {
        Self {
            kind: MountKind::Bind,
            source: source.into(),
            target: target.into(),
            read_only,
        }
    }

    /// Identity used to collapse duplicate mounts.
    pub fn key(&self) -> String {
        let kind = match self.kind {
            MountKind::Bind => "bind",
            MountKind::Volume => "volume",
        };
        format!("{kind}:{}:{}", self.source, self.target)
    }

    /// Docker `Binds` entry.
    pub fn to_bind(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

/// Parses `src:dst[:ro|rw]`.
///
/// Host paths starting with `~`, `.` or `..` are expanded; other relative
/// sources are named volumes.
pub fn parse_volume(spec: &str, home: Option<&Path>, cwd: &Path) -> Result<VolumeMount, InspectorError> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (source, target, read_only) = match parts.as_slice() {
        [source, target] => (*source, *target, false),
        [source, target, "ro"] => (*source, *target, true),
        [source, target, "rw"] => (*source, *target, false),
        _ => {
            return Err(InspectorError::Launch(format!(
                "malformed volume '{spec}', expected src:dst[:ro]"
            )));
        }
    };
    if source.is_empty() || !target.starts_with('/') {
        return Err(InspectorError::Launch(format!(
            "volume '{spec}' needs a source and an absolute target"
        )));
    }

    let expanded = if source == "~" || source.starts_with("~/") {
        let home = home.ok_or_else(|| {
            InspectorError::Launch(format!("cannot expand '~' in volume '{spec}'"))
        })?;
        Some(home.join(source.trim_start_matches('~').trim_start_matches('/')))
    } else if source == "." || source == ".." || source.starts_with("./") || source.starts_with("../")
    {
        Some(cwd.join(source))
    } else if source.starts_with('/') {
        Some(PathBuf::from(source))
    } else {
        None
    };

    Ok(match expanded {
        Some(path) => VolumeMount::bind(path.display().to_string(), target, read_only),
        None => VolumeMount {
            kind: MountKind::Volume,
            source: source.to_owned(),
            target: target.to_owned(),
            read_only,
        },
    })
}

/// Host side of a port binding; `host_port: None` lets docker pick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub host_ip: Option<String>,
    pub host_port: Option<u16>,
}

impl PortBinding {
    pub fn dynamic() -> Self {
        Self {
            host_ip: None,
            host_port: None,
        }
    }

    pub fn same_port(port: u16) -> Self {
        Self {
            host_ip: None,
            host_port: Some(port),
        }
    }
}

/// Parses `[host_ip:]host_port:container_port[/proto]` or a bare container port.
pub fn parse_port_binding(spec: &str) -> Result<(PortKey, PortBinding), InspectorError> {
    let bad = |reason: &str| InspectorError::Launch(format!("port binding '{spec}': {reason}"));
    let parse_host_port = |s: &str| s.parse::<u16>().map_err(|_| bad("invalid host port"));

    let parts: Vec<&str> = spec.rsplitn(3, ':').collect();
    let (container, binding) = match parts.as_slice() {
        [container] => {
            let key = container.parse::<PortKey>().map_err(|e| bad(&e))?;
            let port = key.port;
            (key, PortBinding::same_port(port))
        }
        [container, host_port] => (
            container.parse::<PortKey>().map_err(|e| bad(&e))?,
            PortBinding {
                host_ip: None,
                host_port: Some(parse_host_port(host_port)?),
            },
        ),
        [container, host_port, host_ip] => (
            container.parse::<PortKey>().map_err(|e| bad(&e))?,
            PortBinding {
                host_ip: Some((*host_ip).to_owned()),
                host_port: if host_port.is_empty() {
                    None
                } else {
                    Some(parse_host_port(host_port)?)
                },
            },
        ),
        _ => return Err(bad("unrecognized form")),
    };
    Ok((container, binding))
}

/// Exposed ports and how they are published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortPlan {
    pub exposed: BTreeSet<PortKey>,
    pub bindings: BTreeMap<PortKey, Vec<PortBinding>>,
    pub publish_all: bool,
}

/// Merges the sensor IPC ports into the exposed set and decides publishing.
///
/// An explicit binding that targets an IPC port is fatal.
pub fn plan_ports(
    container: &ContainerConfig,
    image: &ImageInfo,
    cmd_port: u16,
    evt_port: u16,
) -> Result<PortPlan, InspectorError> {
    let cmd_key = PortKey::tcp(cmd_port);
    let evt_key = PortKey::tcp(evt_port);

    let mut exposed: BTreeSet<PortKey> = image.exposed_ports.iter().cloned().collect();
    for spec in &container.expose {
        let key = spec
            .parse::<PortKey>()
            .map_err(|e| InspectorError::Launch(format!("expose '{spec}': {e}")))?;
        if key == cmd_key || key == evt_key {
            warn!(port = %key, "exposed port collides with a sensor ipc port");
        }
        exposed.insert(key);
    }
    exposed.insert(cmd_key.clone());
    exposed.insert(evt_key.clone());

    let mut plan = PortPlan {
        exposed,
        ..PortPlan::default()
    };

    if !container.port_bindings.is_empty() {
        for spec in &container.port_bindings {
            let (key, binding) = parse_port_binding(spec)?;
            if key == cmd_key {
                return Err(FatalError::IpcPortConflict {
                    channel: IpcChannel::Command,
                    port: cmd_port,
                }
                .into());
            }
            if key == evt_key {
                return Err(FatalError::IpcPortConflict {
                    channel: IpcChannel::Event,
                    port: evt_port,
                }
                .into());
            }
            plan.exposed.insert(key.clone());
            plan.bindings.entry(key).or_default().push(binding);
        }
        plan.bindings.insert(cmd_key, vec![PortBinding::dynamic()]);
        plan.bindings.insert(evt_key, vec![PortBinding::dynamic()]);
    } else if container.publish_exposed_ports {
        for key in &plan.exposed {
            let binding = if *key == cmd_key || *key == evt_key {
                PortBinding::dynamic()
            } else {
                PortBinding::same_port(key.port)
            };
            plan.bindings.insert(key.clone(), vec![binding]);
        }
    } else {
        plan.publish_all = true;
    }

    Ok(plan)
}

/// Application command after entrypoint/cmd overrides.
///
/// An entrypoint override drops the image cmd unless a cmd override is
/// also given, matching how docker itself treats `--entrypoint`.
pub fn resolve_startup_command(
    container: &ContainerConfig,
    image: &ImageInfo,
) -> Result<Vec<String>, InspectorError> {
    let entrypoint_overridden = container.clear_entrypoint || !container.entrypoint.is_empty();

    let entrypoint = if container.clear_entrypoint {
        Vec::new()
    } else if !container.entrypoint.is_empty() {
        container.entrypoint.clone()
    } else {
        image.entrypoint.clone()
    };

    let cmd = if container.clear_cmd {
        Vec::new()
    } else if !container.cmd.is_empty() {
        container.cmd.clone()
    } else if entrypoint_overridden {
        Vec::new()
    } else {
        image.cmd.clone()
    };

    let argv: Vec<String> = entrypoint.into_iter().chain(cmd).collect();
    if argv.is_empty() {
        return Err(InspectorError::Launch(
            "image has no entrypoint or cmd and none was given".to_owned(),
        ));
    }
    Ok(argv)
}

/// `slimk_<pid>_<UTC yyyymmddHHMMSS>`
pub fn container_name(pid: u32, now: DateTime<Utc>) -> String {
    format!("slimk_{pid}_{}", now.format("%Y%m%d%H%M%S"))
}

/// Sensor command line flags.
pub fn sensor_args(sensor: &SensorConfig) -> Vec<String> {
    let mut args = Vec::new();
    if sensor.debug {
        args.push("-d".to_owned());
    }
    args.push("-l".to_owned());
    args.push(sensor.log_level.clone());
    args.push("-o".to_owned());
    args.push(sensor.log_format.clone());
    args
}

/// Ports named by `EXPOSE` instructions in image history.
///
/// `history` is newest first as returned by the image history API.
pub fn exposed_ports_from_history<S: AsRef<str>>(history: &[S]) -> Vec<PortKey> {
    let mut ports = Vec::new();
    for created_by in history.iter().rev() {
        let line = created_by.as_ref();
        let Some(idx) = line.find("EXPOSE") else {
            continue;
        };
        let rest = &line[idx + "EXPOSE".len()..];
        let rest = rest
            .trim()
            .trim_start_matches("map[")
            .trim_end_matches(']');
        for token in rest.split_whitespace() {
            let token = token.trim_end_matches(":{}");
            if let Ok(key) = token.parse::<PortKey>() {
                if !ports.contains(&key) {
                    ports.push(key);
                }
            }
        }
    }
    ports
}

/// Everything docker needs to create the instrumented container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub user: String,
    pub env: Vec<String>,
    pub workdir: Option<String>,
    pub hostname: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub ports: PortPlan,
    pub mounts: Vec<VolumeMount>,
    pub network_mode: Option<String>,
    pub links: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub userns_mode: Option<String>,
}

/// Launch spec plus what the sensor must be told to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub spec: LaunchSpec,
    pub app_argv: Vec<String>,
    pub app_user: String,
    pub workdir: String,
}

/// Inputs that come from the host environment rather than configuration.
#[derive(Debug, Clone)]
pub struct HostContext {
    pub pid: u32,
    pub now: DateTime<Utc>,
    pub home: Option<PathBuf>,
    pub cwd: PathBuf,
    /// Absolute host directory mounted as the artifact directory
    pub artifacts_dir: PathBuf,
}

pub fn build_launch_plan(
    container: &ContainerConfig,
    sensor: &SensorConfig,
    image: &ImageInfo,
    host: &HostContext,
) -> Result<LaunchPlan, InspectorError> {
    if container.image.is_empty() {
        return Err(InspectorError::Launch("no target image".to_owned()));
    }

    let app_argv = resolve_startup_command(container, image)?;
    let ports = plan_ports(container, image, sensor.cmd_port, sensor.evt_port)?;

    let mut mounts: Vec<VolumeMount> = vec![
        VolumeMount::bind(
            host.artifacts_dir.display().to_string(),
            ARTIFACTS_MOUNT_PATH,
            false,
        ),
        VolumeMount::bind(container.sensor_path.clone(), SENSOR_BIN_PATH, true),
    ];
    for spec in &container.volumes {
        let mount = parse_volume(spec, host.home.as_deref(), &host.cwd)?;
        let key = mount.key();
        match mounts.iter_mut().find(|m| m.key() == key) {
            Some(existing) => *existing = mount,
            None => mounts.push(mount),
        }
    }

    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_owned());

    let workdir = if container.workdir.is_empty() {
        image.workdir.clone()
    } else {
        container.workdir.clone()
    };
    let app_user = if container.user.is_empty() {
        image.user.clone()
    } else {
        container.user.clone()
    };

    let spec = LaunchSpec {
        name: container_name(host.pid, host.now),
        image: container.image.clone(),
        entrypoint: vec![SENSOR_BIN_PATH.to_owned()],
        cmd: sensor_args(sensor),
        user: SENSOR_USER.to_owned(),
        env: container.env.clone(),
        workdir: non_empty(&container.workdir),
        hostname: non_empty(&container.hostname),
        labels: BTreeMap::from([(
            CONTAINER_TYPE_LABEL.to_owned(),
            CONTAINER_TYPE_VALUE.to_owned(),
        )]),
        ports,
        mounts,
        network_mode: non_empty(&container.network),
        links: container.links.clone(),
        extra_hosts: container.extra_hosts.clone(),
        dns: container.dns.clone(),
        dns_search: container.dns_search.clone(),
        privileged: true,
        cap_add: vec![SENSOR_CAPABILITY.to_owned()],
        userns_mode: Some("host".to_owned()),
    };

    debug!(name = %spec.name, app = ?app_argv, "launch plan built");
    Ok(LaunchPlan {
        spec,
        app_argv,
        app_user,
        workdir,
    })
}
