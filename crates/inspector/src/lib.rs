#![doc = include_str!("../README.md")]

pub mod artifacts;
pub mod console;
pub mod docker;
pub mod error;
pub mod exec;
pub mod inspector;
pub mod launch;
pub mod network;

pub use artifacts::{ProfileGenerator, REPORT_FILE_NAME, copy_meta_artifacts, has_collected_data};
pub use console::{Console, ConsoleBuffer};
pub use docker::{BollardDockerClient, DockerClient, docker_host_ip};
#[cfg(any(test, feature = "testing"))]
pub use docker::{MOCK_CONTAINER_ID, MockDockerClient};
pub use error::InspectorError;
pub use exec::ExecCommand;
pub use inspector::{ContainerInspector, ContainerInspectorBuilder, CrashSignal, SessionState};
pub use launch::{HostContext, ImageInfo, LaunchSpec};
