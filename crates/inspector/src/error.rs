//! Inspector error type.
//!
//! [`InspectorError`] converts into [`SlimprobeError`]; fatal conditions keep
//! their identity so the CLI can pick the exit code.

use slimprobe_core::error::{ContainerError, FatalError, SlimprobeError};
use slimprobe_sensor_ipc::IpcError;

#[derive(Debug, thiserror::Error)]
pub enum InspectorError {
    /// Docker API call failed
    #[error("docker api error: {0}")]
    DockerApi(String),

    /// Docker daemon unreachable
    #[error("docker connection error: {0}")]
    DockerConnection(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Launch options are inconsistent
    #[error("invalid launch options: {0}")]
    Launch(String),

    #[error("sensor ipc: {0}")]
    Ipc(#[from] IpcError),

    /// Run-ending condition
    #[error(transparent)]
    Fatal(#[from] FatalError),

    #[error("sensor did not confirm monitor start after {attempts} attempts")]
    StartMonitorTimeout { attempts: u32 },

    #[error("unexpected sensor event '{0}'")]
    UnexpectedEvent(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("artifact error: {0}")]
    Artifacts(String),

    /// Operation not allowed in the current lifecycle state
    #[error("cannot {op} while container is {state}")]
    InvalidState { op: &'static str, state: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl InspectorError {
    pub fn fatal(&self) -> Option<&FatalError> {
        match self {
            Self::Fatal(f) => Some(f),
            _ => None,
        }
    }
}

impl From<InspectorError> for SlimprobeError {
    fn from(err: InspectorError) -> Self {
        match err {
            InspectorError::Fatal(f) => SlimprobeError::Fatal(f),
            InspectorError::Ipc(e) => e.into(),
            InspectorError::Io(e) => SlimprobeError::Io(e),
            InspectorError::ContainerNotFound(id) => {
                SlimprobeError::Container(ContainerError::NotFound(id))
            }
            InspectorError::Launch(msg) => SlimprobeError::Container(ContainerError::Launch(msg)),
            InspectorError::Exec(msg) => SlimprobeError::Container(ContainerError::Exec(msg)),
            InspectorError::Artifacts(msg) => {
                SlimprobeError::Container(ContainerError::Artifacts(msg))
            }
            InspectorError::StartMonitorTimeout { attempts } => {
                SlimprobeError::Container(ContainerError::StartMonitorTimeout { attempts })
            }
            other @ (InspectorError::DockerApi(_)
            | InspectorError::DockerConnection(_)
            | InspectorError::ImageNotFound(_)
            | InspectorError::UnexpectedEvent(_)
            | InspectorError::InvalidState { .. }) => {
                SlimprobeError::Container(ContainerError::DockerApi(other.to_string()))
            }
        }
    }
}
