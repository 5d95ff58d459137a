#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use error::{
    ConfigError, ContainerError, FatalError, IpcChannel, ProbeError, SlimprobeError,
    TransportError,
};

pub use config::SlimprobeConfig;

pub use types::{
    AvailablePort, ContinueAfterMode, ContinueAfterSpec, IpcMode, PortKey, ProbeCommand,
    ProbeProtocol,
};
