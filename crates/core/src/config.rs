//! Configuration: `slimprobe.toml` parsing and runtime settings.
//!
//! [`SlimprobeConfig`] is built once per command invocation and passed by
//! reference to the inspector, the probe engine and the coordinator.
//!
//! # Precedence
//! 1. CLI flags (applied by the binary)
//! 2. Environment (`SLIMPROBE_HTTP_PROBE_RETRY_COUNT=3` form)
//! 3. Config file
//! 4. `Default` impls
//!
//! ```no_run
//! # async fn example() -> Result<(), slimprobe_core::error::SlimprobeError> {
//! use slimprobe_core::config::SlimprobeConfig;
//!
//! let config = SlimprobeConfig::load("slimprobe.toml").await?;
//! let config = SlimprobeConfig::parse("[general]\nlog_level = \"debug\"")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, SlimprobeError};
use crate::types::{ContinueAfterMode, ContinueAfterSpec, IpcMode, ProbeCommand};

/// Default sensor command channel port inside the container
pub const DEFAULT_SENSOR_CMD_PORT: u16 = 65501;
/// Default sensor event channel port inside the container
pub const DEFAULT_SENSOR_EVT_PORT: u16 = 65502;
/// How many events are read while waiting for the monitor to start
pub const DEFAULT_START_MONITOR_RETRIES: u32 = 3;
/// Upper bound for probe retries per (port, command, protocol)
pub const MAX_PROBE_RETRY_COUNT: u32 = 100;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlimprobeConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    /// Target container launch options
    #[serde(default)]
    pub container: ContainerConfig,

    /// Sensor IPC and monitor options
    #[serde(default)]
    pub sensor: SensorConfig,

    #[serde(default)]
    pub http_probe: HttpProbeConfig,

    #[serde(default)]
    pub continue_after: ContinueAfterConfig,
}

impl SlimprobeConfig {
    /// Reads the file, applies environment overrides and validates.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SlimprobeError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reads the file without environment overrides or validation.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, SlimprobeError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SlimprobeError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                SlimprobeError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    pub fn parse(toml_str: &str) -> Result<Self, SlimprobeError> {
        toml::from_str(toml_str).map_err(|e| {
            SlimprobeError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// Applies `SLIMPROBE_{SECTION}_{FIELD}` environment variables.
    pub fn apply_env_overrides(&mut self) {
        override_string(&mut self.general.log_level, "SLIMPROBE_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "SLIMPROBE_GENERAL_LOG_FORMAT");

        let c = &mut self.container;
        override_string(&mut c.docker_socket, "SLIMPROBE_CONTAINER_DOCKER_SOCKET");
        override_string(&mut c.image, "SLIMPROBE_CONTAINER_IMAGE");
        override_string(&mut c.network, "SLIMPROBE_CONTAINER_NETWORK");
        override_csv(&mut c.expose, "SLIMPROBE_CONTAINER_EXPOSE");
        override_csv(&mut c.volumes, "SLIMPROBE_CONTAINER_VOLUMES");
        override_string(&mut c.artifacts_dir, "SLIMPROBE_CONTAINER_ARTIFACTS_DIR");
        override_string(&mut c.sensor_path, "SLIMPROBE_CONTAINER_SENSOR_PATH");
        override_bool(
            &mut c.show_container_logs,
            "SLIMPROBE_CONTAINER_SHOW_CONTAINER_LOGS",
        );
        override_bool(
            &mut c.publish_exposed_ports,
            "SLIMPROBE_CONTAINER_PUBLISH_EXPOSED_PORTS",
        );

        let s = &mut self.sensor;
        override_parsed(&mut s.ipc_mode, "SLIMPROBE_SENSOR_IPC_MODE");
        override_string(&mut s.ipc_endpoint, "SLIMPROBE_SENSOR_IPC_ENDPOINT");
        override_parsed(&mut s.cmd_port, "SLIMPROBE_SENSOR_CMD_PORT");
        override_parsed(&mut s.evt_port, "SLIMPROBE_SENSOR_EVT_PORT");
        override_parsed(
            &mut s.connect_wait_secs,
            "SLIMPROBE_SENSOR_CONNECT_WAIT_SECS",
        );
        override_parsed(&mut s.io_timeout_secs, "SLIMPROBE_SENSOR_IO_TIMEOUT_SECS");
        override_parsed(
            &mut s.event_timeout_secs,
            "SLIMPROBE_SENSOR_EVENT_TIMEOUT_SECS",
        );
        override_parsed(
            &mut s.start_monitor_retries,
            "SLIMPROBE_SENSOR_START_MONITOR_RETRIES",
        );

        let p = &mut self.http_probe;
        override_bool(&mut p.enabled, "SLIMPROBE_HTTP_PROBE_ENABLED");
        override_bool(&mut p.full, "SLIMPROBE_HTTP_PROBE_FULL");
        override_bool(&mut p.exit_on_failure, "SLIMPROBE_HTTP_PROBE_EXIT_ON_FAILURE");
        override_parsed(&mut p.retry_count, "SLIMPROBE_HTTP_PROBE_RETRY_COUNT");
        override_parsed(&mut p.retry_wait_secs, "SLIMPROBE_HTTP_PROBE_RETRY_WAIT_SECS");
        override_parsed(&mut p.start_wait_secs, "SLIMPROBE_HTTP_PROBE_START_WAIT_SECS");
        override_parsed(&mut p.crawl_max_depth, "SLIMPROBE_HTTP_PROBE_CRAWL_MAX_DEPTH");
        override_parsed(
            &mut p.crawl_max_page_count,
            "SLIMPROBE_HTTP_PROBE_CRAWL_MAX_PAGE_COUNT",
        );
        override_parsed(
            &mut p.max_concurrent_crawlers,
            "SLIMPROBE_HTTP_PROBE_MAX_CONCURRENT_CRAWLERS",
        );

        override_string(
            &mut self.continue_after.mode,
            "SLIMPROBE_CONTINUE_AFTER_MODE",
        );
        override_parsed(
            &mut self.continue_after.timeout_secs,
            "SLIMPROBE_CONTINUE_AFTER_TIMEOUT_SECS",
        );
        override_string(
            &mut self.continue_after.exec_cmd,
            "SLIMPROBE_CONTINUE_AFTER_EXEC_CMD",
        );
    }

    /// Checks value ranges and cross-section consistency.
    pub fn validate(&self) -> Result<(), SlimprobeError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        if self.sensor.cmd_port == 0 || self.sensor.evt_port == 0 {
            return Err(invalid("sensor.cmd_port", "ipc ports must be non-zero"));
        }
        if self.sensor.cmd_port == self.sensor.evt_port {
            return Err(invalid(
                "sensor.evt_port",
                "command and event ports must differ",
            ));
        }
        if self.sensor.start_monitor_retries == 0 {
            return Err(invalid(
                "sensor.start_monitor_retries",
                "must be at least 1",
            ));
        }

        if self.http_probe.retry_count > MAX_PROBE_RETRY_COUNT {
            return Err(invalid(
                "http_probe.retry_count",
                format!("must be at most {MAX_PROBE_RETRY_COUNT}"),
            ));
        }
        if self.http_probe.crawl_concurrency == 0 {
            return Err(invalid("http_probe.crawl_concurrency", "must be at least 1"));
        }

        let spec = ContinueAfterSpec::parse(&self.continue_after.mode)
            .map_err(|reason| invalid("continue_after.mode", reason))?;
        if spec.contains(ContinueAfterMode::Probe) && !self.http_probe.enabled {
            return Err(invalid(
                "continue_after.mode",
                "probe mode requires http_probe.enabled",
            ));
        }
        if spec.contains(ContinueAfterMode::Exec)
            && self.continue_after.exec_cmd.is_empty()
            && self.continue_after.exec_file.is_empty()
        {
            return Err(invalid(
                "continue_after.exec_cmd",
                "exec mode requires exec_cmd or exec_file",
            ));
        }
        if spec.contains(ContinueAfterMode::HostExec) && self.http_probe.host_exec_probes.is_empty()
        {
            return Err(invalid(
                "http_probe.host_exec_probes",
                "host-exec mode requires at least one command",
            ));
        }

        Ok(())
    }

    /// Parsed continue-after modes, with the section timeout as fallback.
    pub fn continue_after_spec(&self) -> Result<ContinueAfterSpec, SlimprobeError> {
        let mut spec = ContinueAfterSpec::parse(&self.continue_after.mode)
            .map_err(|reason| invalid("continue_after.mode", reason))?;
        if spec.timeout_secs.is_none() {
            spec.timeout_secs = Some(self.continue_after.timeout_secs);
        }
        Ok(spec)
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> SlimprobeError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: reason.into(),
    }
    .into()
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// trace, debug, info, warn, error
    pub log_level: String,
    /// json, pretty
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "pretty".to_owned(),
        }
    }
}

/// Target container launch options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Docker socket path, empty for the platform default
    pub docker_socket: String,
    /// Image to instrument
    pub image: String,
    /// Replaces the image entrypoint when non-empty
    pub entrypoint: Vec<String>,
    /// Replaces the image cmd when non-empty
    pub cmd: Vec<String>,
    pub clear_entrypoint: bool,
    pub clear_cmd: bool,
    pub workdir: String,
    /// User the application runs as (the sensor itself runs as root)
    pub user: String,
    pub env: Vec<String>,
    pub hostname: String,
    /// Network mode override (`host`, `bridge`, a network name)
    pub network: String,
    /// Extra networks attached after create
    pub networks: Vec<String>,
    pub links: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    /// Additional exposed ports (`8080`, `8080/tcp`)
    pub expose: Vec<String>,
    /// Publish every exposed port on the same host port
    pub publish_exposed_ports: bool,
    /// Explicit bindings `[host_ip:]host_port:container_port[/proto]`
    pub port_bindings: Vec<String>,
    /// Volume binds `src:dst[:ro]`
    pub volumes: Vec<String>,
    /// Host directory receiving the sensor report
    pub artifacts_dir: String,
    /// Host path of the sensor binary
    pub sensor_path: String,
    pub show_container_logs: bool,
    /// Copy the report here after a successful run, empty to skip
    pub copy_meta_artifacts: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            docker_socket: String::new(),
            image: String::new(),
            entrypoint: Vec::new(),
            cmd: Vec::new(),
            clear_entrypoint: false,
            clear_cmd: false,
            workdir: String::new(),
            user: String::new(),
            env: Vec::new(),
            hostname: String::new(),
            network: String::new(),
            networks: Vec::new(),
            links: Vec::new(),
            extra_hosts: Vec::new(),
            dns: Vec::new(),
            dns_search: Vec::new(),
            expose: Vec::new(),
            publish_exposed_ports: false,
            port_bindings: Vec::new(),
            volumes: Vec::new(),
            artifacts_dir: "slimprobe-artifacts".to_owned(),
            sensor_path: "/usr/local/bin/slim-sensor".to_owned(),
            show_container_logs: false,
            copy_meta_artifacts: String::new(),
        }
    }
}

/// Sensor IPC and monitor options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub ipc_mode: IpcMode,
    /// Host override for the IPC address, empty to derive it
    pub ipc_endpoint: String,
    pub cmd_port: u16,
    pub evt_port: u16,
    /// How long to keep trying to reach the sensor after start
    pub connect_wait_secs: u64,
    /// Per read/write timeout on the command channel
    pub io_timeout_secs: u64,
    /// Per event wait
    pub event_timeout_secs: u64,
    pub start_monitor_retries: u32,
    /// Sensor log level passed on its command line
    pub log_level: String,
    /// Sensor log format (text, json)
    pub log_format: String,
    pub debug: bool,
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    pub include_bins: Vec<String>,
    pub include_exes: Vec<String>,
    pub include_shell: bool,
    pub include_workdir: bool,
    pub keep_perms: bool,
    pub obfuscate_metadata: bool,
    pub rta_source_ptrace: bool,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            ipc_mode: IpcMode::default(),
            ipc_endpoint: String::new(),
            cmd_port: DEFAULT_SENSOR_CMD_PORT,
            evt_port: DEFAULT_SENSOR_EVT_PORT,
            connect_wait_secs: 60,
            io_timeout_secs: 30,
            event_timeout_secs: 30,
            start_monitor_retries: DEFAULT_START_MONITOR_RETRIES,
            log_level: "info".to_owned(),
            log_format: "text".to_owned(),
            debug: false,
            includes: Vec::new(),
            excludes: Vec::new(),
            include_bins: Vec::new(),
            include_exes: Vec::new(),
            include_shell: false,
            include_workdir: false,
            keep_perms: true,
            obfuscate_metadata: false,
            rta_source_ptrace: true,
        }
    }
}

/// HTTP probe and crawler options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpProbeConfig {
    pub enabled: bool,
    /// Keep probing remaining ports after the first success
    pub full: bool,
    /// End the run when calls were made and none succeeded
    pub exit_on_failure: bool,
    /// Empty means a single `GET /`
    pub commands: Vec<ProbeCommand>,
    /// Explicit target ports, filtered to the published ones
    pub ports: Vec<u16>,
    /// Extra wait added to the initial delay
    pub start_wait_secs: u64,
    /// Base delay before the first probe
    pub initial_delay_secs: u64,
    /// 0 selects the built-in default
    pub retry_count: u32,
    /// 0 selects the classified default waits
    pub retry_wait_secs: u64,
    pub crawl_max_depth: u32,
    /// <= 0 is unbounded
    pub crawl_max_page_count: i64,
    /// Parallel requests inside one crawl
    pub crawl_concurrency: usize,
    /// <= 0 is unbounded
    pub max_concurrent_crawlers: i64,
    /// Host-side commands run after the port loop
    pub host_exec_probes: Vec<String>,
}

impl Default for HttpProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            full: false,
            exit_on_failure: true,
            commands: Vec::new(),
            ports: Vec::new(),
            start_wait_secs: 0,
            initial_delay_secs: 9,
            retry_count: 0,
            retry_wait_secs: 0,
            crawl_max_depth: 3,
            crawl_max_page_count: 1000,
            crawl_concurrency: 10,
            max_concurrent_crawlers: 1,
            host_exec_probes: Vec::new(),
        }
    }
}

/// Continue-after options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinueAfterConfig {
    /// `&`-joined modes, e.g. `exec&probe`
    pub mode: String,
    pub timeout_secs: u64,
    /// Shell command run with `sh -c`
    pub exec_cmd: String,
    /// Script fed to `sh -s`, used when `exec_cmd` is empty
    pub exec_file: String,
}

impl Default for ContinueAfterConfig {
    fn default() -> Self {
        Self {
            mode: "probe".to_owned(),
            timeout_secs: crate::types::DEFAULT_CONTINUE_AFTER_TIMEOUT_SECS,
            exec_cmd: String::new(),
            exec_file: String::new(),
        }
    }
}

// --- environment override helpers ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_parsed<T: FromStr>(target: &mut T, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                expected = std::any::type_name::<T>(),
                "failed to parse env var, ignoring"
            ),
        }
    }
}

fn override_csv(target: &mut Vec<String>, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();
    }
}
