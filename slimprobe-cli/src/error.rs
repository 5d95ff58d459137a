//! CLI error type and exit code mapping

use slimprobe_core::error::{ConfigError, SlimprobeError};

/// CLI error type.
///
/// `exit_code()` is the single table mapping failures to process exit codes.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Configuration loading, override or validation failure.
    #[error("configuration error: {0}")]
    Config(String),

    /// A subcommand-specific operation failed.
    #[error("{0}")]
    Command(String),

    /// JSON serialisation failed during output rendering.
    #[error("json output error: {0}")]
    JsonSerialize(#[from] serde_json::Error),

    /// IO error (stdout write, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapped domain error.
    #[error("{0}")]
    Core(#[from] SlimprobeError),
}

impl CliError {
    /// Map the error to a process exit code.
    ///
    /// | Code | Meaning                                       |
    /// |------|-----------------------------------------------|
    /// | 0    | Success                                       |
    /// | 1    | General / command error, exec command failed  |
    /// | 2    | Configuration error                           |
    /// | 10   | IO error                                      |
    /// | <0   | Fatal run condition (see `FatalError`)        |
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Core(SlimprobeError::Config(_)) => 2,
            Self::Io(_) | Self::Core(SlimprobeError::Io(_)) => 10,
            Self::Core(SlimprobeError::Fatal(fatal)) => fatal.exit_code(),
            Self::Core(SlimprobeError::ExecFailed { .. }) => 1,
            Self::JsonSerialize(_) | Self::Command(_) | Self::Core(_) => 1,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        Self::Core(SlimprobeError::Config(e))
    }
}

impl From<slimprobe_inspector::InspectorError> for CliError {
    fn from(e: slimprobe_inspector::InspectorError) -> Self {
        Self::Core(e.into())
    }
}

impl From<slimprobe_http_probe::HttpProbeError> for CliError {
    fn from(e: slimprobe_http_probe::HttpProbeError) -> Self {
        Self::Core(e.into())
    }
}
