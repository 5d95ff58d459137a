//! Error types, one enum per domain plus the top-level [`SlimprobeError`].
//!
//! Library crates define their own error enums and convert into
//! [`SlimprobeError`] so that the CLI can map every failure to an exit code.

/// slimprobe top-level error
#[derive(Debug, thiserror::Error)]
pub enum SlimprobeError {
    /// Configuration problem
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Sensor IPC problem
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Container runtime problem
    #[error("container error: {0}")]
    Container(#[from] ContainerError),

    /// Probe setup problem (not per-attempt failures, those are counted)
    #[error("probe error: {0}")]
    Probe(#[from] ProbeError),

    /// Run-ending condition with a dedicated exit code
    #[error("fatal: {0}")]
    Fatal(#[from] FatalError),

    /// The continue-after exec command exited with a non-zero code
    #[error("exec command failed with exit code {exit_code}")]
    ExecFailed { exit_code: i64 },

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file does not exist
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// TOML could not be parsed
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// A value is out of range or not allowed
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Sensor IPC errors as seen by the rest of the workspace
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Bounded wait expired; callers may retry
    #[error("ipc timeout: {0}")]
    Timeout(String),

    /// Socket level failure
    #[error("ipc connection failed: {0}")]
    Connection(String),

    /// Peer sent something we did not expect
    #[error("ipc protocol error: {0}")]
    Protocol(String),

    /// Sensor replied with an error frame
    #[error("sensor error: {0}")]
    Remote(String),
}

/// Container runtime errors
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// Docker API call failed
    #[error("docker api error: {0}")]
    DockerApi(String),

    /// Container does not exist
    #[error("container not found: {0}")]
    NotFound(String),

    /// Launch options could not be built
    #[error("invalid launch options: {0}")]
    Launch(String),

    /// Exec inside the container failed to run
    #[error("exec failed: {0}")]
    Exec(String),

    /// Artifact handling failed
    #[error("artifact error: {0}")]
    Artifacts(String),

    /// Sensor never confirmed the monitor start handshake
    #[error("sensor did not confirm monitor start after {attempts} attempts")]
    StartMonitorTimeout { attempts: u32 },
}

/// Probe engine setup errors
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// Probe command could not be parsed
    #[error("invalid probe command: {0}")]
    InvalidCommand(String),

    /// HTTP client could not be built
    #[error("client setup failed: {0}")]
    Client(String),

    /// Body file could not be read
    #[error("failed to read body file '{path}': {reason}")]
    BodyFile { path: String, reason: String },
}

/// Conditions that end a profiling run immediately.
///
/// Library code returns these instead of terminating the process. The CLI
/// runner performs cleanup and then exits with [`FatalError::exit_code`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FatalError {
    /// The monitored container exited before monitoring was stopped
    #[error("container {container_id} crashed with exit code {exit_code}")]
    ContainerCrashed { container_id: String, exit_code: i64 },

    /// The sensor reported an error while starting the monitor
    #[error("sensor reported an error: {data}")]
    SensorError { data: String },

    /// Probing was attempted but no call succeeded
    #[error("http probe made {calls} calls and none succeeded")]
    ProbeFailed { calls: u64 },

    /// The container exposes no port that could be probed
    #[error("no exposed ports available for probing")]
    NoExposedPorts,

    /// The sensor did not leave a report behind
    #[error("no data collected from the container")]
    NoCollectedData,

    /// A user port binding collides with one of the sensor IPC ports
    #[error("port binding uses reserved sensor ipc {channel} port {port}")]
    IpcPortConflict { channel: IpcChannel, port: u16 },
}

/// Which of the two sensor channels a port belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcChannel {
    Command,
    Event,
}

impl std::fmt::Display for IpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command => f.write_str("command"),
            Self::Event => f.write_str("event"),
        }
    }
}

impl FatalError {
    /// Process exit code reported for this condition.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ContainerCrashed { .. } => -999,
            Self::SensorError { .. } => -124,
            Self::ProbeFailed { .. } | Self::NoExposedPorts | Self::NoCollectedData => -1,
            Self::IpcPortConflict {
                channel: IpcChannel::Command,
                ..
            } => -126,
            Self::IpcPortConflict {
                channel: IpcChannel::Event,
                ..
            } => -127,
        }
    }

    /// Whether container logs should be shown before exiting.
    pub fn wants_container_logs(&self) -> bool {
        matches!(
            self,
            Self::ContainerCrashed { .. } | Self::SensorError { .. } | Self::ProbeFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_exit_codes() {
        let crashed = FatalError::ContainerCrashed {
            container_id: "abc".to_owned(),
            exit_code: 2,
        };
        assert_eq!(crashed.exit_code(), -999);
        assert_eq!(
            FatalError::SensorError {
                data: "boom".to_owned()
            }
            .exit_code(),
            -124
        );
        assert_eq!(FatalError::ProbeFailed { calls: 3 }.exit_code(), -1);
        assert_eq!(FatalError::NoCollectedData.exit_code(), -1);
        assert_eq!(
            FatalError::IpcPortConflict {
                channel: IpcChannel::Command,
                port: 65501
            }
            .exit_code(),
            -126
        );
        assert_eq!(
            FatalError::IpcPortConflict {
                channel: IpcChannel::Event,
                port: 65502
            }
            .exit_code(),
            -127
        );
    }

    #[test]
    fn crash_message_names_container() {
        let err = FatalError::ContainerCrashed {
            container_id: "deadbeef".to_owned(),
            exit_code: 137,
        };
        let msg = err.to_string();
        assert!(msg.contains("deadbeef"));
        assert!(msg.contains("137"));
    }

    #[test]
    fn fatal_converts_to_top_level() {
        let err: SlimprobeError = FatalError::NoExposedPorts.into();
        assert!(matches!(
            err,
            SlimprobeError::Fatal(FatalError::NoExposedPorts)
        ));
    }

    #[test]
    fn logs_wanted_only_for_runtime_failures() {
        assert!(FatalError::ProbeFailed { calls: 1 }.wants_container_logs());
        assert!(!FatalError::NoExposedPorts.wants_container_logs());
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "http_probe.retry_count".to_owned(),
            reason: "must be at most 100".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("http_probe.retry_count"));
        assert!(msg.contains("at most 100"));
    }
}
