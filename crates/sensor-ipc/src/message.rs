//! Command and event payloads carried in frame bodies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Host to sensor command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum Command {
    #[serde(rename = "cmd.monitor.start")]
    StartMonitor(StartMonitor),
    #[serde(rename = "cmd.monitor.stop")]
    StopMonitor,
    #[serde(rename = "cmd.sensor.shutdown")]
    ShutdownSensor,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartMonitor(_) => "cmd.monitor.start",
            Self::StopMonitor => "cmd.monitor.stop",
            Self::ShutdownSensor => "cmd.sensor.shutdown",
        }
    }
}

/// Ownership and mode hints for an explicitly included path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessInfo {
    #[serde(rename = "Flags")]
    pub flags: u32,
    #[serde(rename = "PermsOnly")]
    pub perms_only: bool,
    #[serde(rename = "UID")]
    pub uid: i32,
    #[serde(rename = "GID")]
    pub gid: i32,
}

/// Starts file access monitoring of the target application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartMonitor {
    pub app_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub app_args: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_user: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub includes: BTreeMap<String, Option<AccessInfo>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_bins: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_exes: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub include_shell: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub include_workdir: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub keep_perms: bool,
    #[serde(default)]
    pub obfuscate_metadata: bool,
    #[serde(default, rename = "rta_source_ptrace")]
    pub rta_source_ptrace: bool,
    #[serde(default)]
    pub report_on_main_pid_exit: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl StartMonitor {
    /// Includes without ownership hints, keyed by path.
    pub fn with_include_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for path in paths {
            self.includes.insert(path.into(), None);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Reply to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: ResponseStatus,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self {
            status: ResponseStatus::Ok,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

pub const EVENT_START_MONITOR_DONE: &str = "event.monitor.start.done";
pub const EVENT_START_MONITOR_FAILED: &str = "event.monitor.start.failed";
pub const EVENT_STOP_MONITOR_DONE: &str = "event.monitor.stop.done";
pub const EVENT_SHUTDOWN_SENSOR_DONE: &str = "event.sensor.shutdown.done";
pub const EVENT_ERROR: &str = "event.error";

/// Raw event body as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Sensor to host notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StartMonitorDone,
    /// Monitor could not start; treated like `Error`
    StartMonitorFailed { data: Option<serde_json::Value> },
    /// Sensor finished flushing collected data
    StopMonitorDone,
    ShutdownSensorDone,
    Error { data: Option<serde_json::Value> },
    /// Name this host does not know about
    Unknown { name: String },
}

impl Event {
    pub fn name(&self) -> &str {
        match self {
            Self::StartMonitorDone => EVENT_START_MONITOR_DONE,
            Self::StartMonitorFailed { .. } => EVENT_START_MONITOR_FAILED,
            Self::StopMonitorDone => EVENT_STOP_MONITOR_DONE,
            Self::ShutdownSensorDone => EVENT_SHUTDOWN_SENSOR_DONE,
            Self::Error { .. } => EVENT_ERROR,
            Self::Unknown { name } => name,
        }
    }

    /// Error payload rendered for logs, for events that carry one.
    pub fn error_data(&self) -> Option<String> {
        match self {
            Self::Error { data } | Self::StartMonitorFailed { data } => Some(
                data.as_ref()
                    .map(|d| match d {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default(),
            ),
            _ => None,
        }
    }
}

impl From<EventMessage> for Event {
    fn from(msg: EventMessage) -> Self {
        match msg.name.as_str() {
            EVENT_START_MONITOR_DONE => Self::StartMonitorDone,
            EVENT_START_MONITOR_FAILED => Self::StartMonitorFailed { data: msg.data },
            EVENT_STOP_MONITOR_DONE => Self::StopMonitorDone,
            EVENT_SHUTDOWN_SENSOR_DONE => Self::ShutdownSensorDone,
            EVENT_ERROR => Self::Error { data: msg.data },
            _ => Self::Unknown { name: msg.name },
        }
    }
}

impl From<Event> for EventMessage {
    fn from(event: Event) -> Self {
        let name = event.name().to_owned();
        let data = match event {
            Event::Error { data } | Event::StartMonitorFailed { data } => data,
            _ => None,
        };
        Self { name, data }
    }
}
