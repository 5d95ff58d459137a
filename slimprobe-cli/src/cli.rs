//! CLI argument parsing using clap derive API
//!
//! Purely declarative; the only logic here copies flags onto a loaded
//! [`SlimprobeConfig`].

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use slimprobe_core::config::SlimprobeConfig;
use slimprobe_core::types::{IpcMode, ProbeCommand};

/// slimprobe -- run a container image under the sensor and exercise it.
///
/// Use `slimprobe <COMMAND> --help` for subcommand details.
#[derive(Parser, Debug)]
#[command(name = "slimprobe", version, about, long_about = None)]
pub struct Cli {
    /// Path to a slimprobe.toml configuration file (defaults when absent).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Output format.
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    Text,
    /// Machine-readable JSON.
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an image with the sensor attached and collect its usage report.
    Profile(Box<ProfileArgs>),

    /// Manage configuration.
    Config(ConfigArgs),
}

// ---- profile ----

#[derive(Args, Debug, Default)]
pub struct ProfileArgs {
    /// Target image reference.
    pub image: String,

    /// When to stop monitoring: enter, signal, timeout, probe, exec, host-exec or
    /// an `&`-joined combination (e.g. `exec&probe`).
    #[arg(long)]
    pub continue_after: Option<String>,

    /// Seconds to wait in `timeout` mode.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Shell command run in the container in `exec` mode.
    #[arg(long)]
    pub exec: Option<String>,

    /// Script run in the container in `exec` mode.
    #[arg(long)]
    pub exec_file: Option<String>,

    /// Disable the HTTP probe.
    #[arg(long)]
    pub no_http_probe: bool,

    /// Probe command in `[protocol:]METHOD:/resource` form (repeatable).
    #[arg(long = "http-probe-cmd")]
    pub http_probe_cmds: Vec<String>,

    /// Crawl from every successful probe command.
    #[arg(long)]
    pub http_probe_crawl: bool,

    /// Comma separated container ports to probe.
    #[arg(long, value_delimiter = ',')]
    pub http_probe_ports: Vec<u16>,

    /// Probe every port even after a success.
    #[arg(long)]
    pub http_probe_full: bool,

    /// Keep going when every probe call failed.
    #[arg(long)]
    pub http_probe_continue_on_failure: bool,

    /// Extra seconds to wait before probing.
    #[arg(long)]
    pub http_probe_start_wait: Option<u64>,

    /// Host-side probe command (repeatable).
    #[arg(long = "host-exec")]
    pub host_exec: Vec<String>,

    /// Override the image entrypoint (shell words).
    #[arg(long)]
    pub entrypoint: Option<String>,

    /// Override the image command (shell words).
    #[arg(long)]
    pub cmd: Option<String>,

    /// Environment variable `NAME=value` (repeatable).
    #[arg(short, long)]
    pub env: Vec<String>,

    /// Extra exposed port (repeatable).
    #[arg(long)]
    pub expose: Vec<String>,

    /// Publish exposed ports on the same host port.
    #[arg(long)]
    pub publish_exposed_ports: bool,

    /// Port binding `[ip:]host:container[/proto]` (repeatable).
    #[arg(short, long)]
    pub publish: Vec<String>,

    /// Volume `src:dst[:ro]` (repeatable).
    #[arg(short = 'v', long = "mount")]
    pub mounts: Vec<String>,

    /// Network mode.
    #[arg(long)]
    pub network: Option<String>,

    /// Print container logs at shutdown.
    #[arg(long)]
    pub show_clogs: bool,

    /// Host directory mounted as the artifact directory.
    #[arg(long)]
    pub artifacts_dir: Option<String>,

    /// Copy the report and generated profiles to this directory.
    #[arg(long)]
    pub copy_meta_artifacts: Option<String>,

    /// Host path of the sensor binary.
    #[arg(long)]
    pub sensor_path: Option<String>,

    /// How to reach the sensor ports.
    #[arg(long)]
    pub ipc_mode: Option<IpcMode>,
}

impl ProfileArgs {
    /// Copies set flags over the loaded configuration.
    pub fn apply(&self, config: &mut SlimprobeConfig) -> Result<(), String> {
        let c = &mut config.container;
        c.image = self.image.clone();
        if let Some(entrypoint) = &self.entrypoint {
            c.entrypoint = split_words("--entrypoint", entrypoint)?;
            c.clear_entrypoint = c.entrypoint.is_empty();
        }
        if let Some(cmd) = &self.cmd {
            c.cmd = split_words("--cmd", cmd)?;
            c.clear_cmd = c.cmd.is_empty();
        }
        c.env.extend(self.env.iter().cloned());
        c.expose.extend(self.expose.iter().cloned());
        c.port_bindings.extend(self.publish.iter().cloned());
        c.volumes.extend(self.mounts.iter().cloned());
        c.publish_exposed_ports |= self.publish_exposed_ports;
        c.show_container_logs |= self.show_clogs;
        set_string(&mut c.network, &self.network);
        set_string(&mut c.artifacts_dir, &self.artifacts_dir);
        set_string(&mut c.copy_meta_artifacts, &self.copy_meta_artifacts);
        set_string(&mut c.sensor_path, &self.sensor_path);

        if let Some(mode) = self.ipc_mode {
            config.sensor.ipc_mode = mode;
        }

        let p = &mut config.http_probe;
        if self.no_http_probe {
            p.enabled = false;
        }
        if !self.http_probe_cmds.is_empty() {
            p.commands = self
                .http_probe_cmds
                .iter()
                .map(|spec| {
                    ProbeCommand::parse_compact(spec).map(|cmd| ProbeCommand {
                        crawl: self.http_probe_crawl,
                        ..cmd
                    })
                })
                .collect::<Result<_, _>>()?;
        } else if self.http_probe_crawl {
            p.commands = vec![ProbeCommand {
                crawl: true,
                ..ProbeCommand::default()
            }];
        }
        if !self.http_probe_ports.is_empty() {
            p.ports = self.http_probe_ports.clone();
        }
        p.full |= self.http_probe_full;
        if self.http_probe_continue_on_failure {
            p.exit_on_failure = false;
        }
        if let Some(wait) = self.http_probe_start_wait {
            p.start_wait_secs = wait;
        }
        p.host_exec_probes.extend(self.host_exec.iter().cloned());

        let ca = &mut config.continue_after;
        set_string(&mut ca.mode, &self.continue_after);
        if let Some(timeout) = self.timeout {
            ca.timeout_secs = timeout;
        }
        set_string(&mut ca.exec_cmd, &self.exec);
        set_string(&mut ca.exec_file, &self.exec_file);
        Ok(())
    }
}

fn set_string(target: &mut String, value: &Option<String>) {
    if let Some(value) = value {
        *target = value.clone();
    }
}

fn split_words(flag: &str, value: &str) -> Result<Vec<String>, String> {
    shlex::split(value).ok_or_else(|| format!("{flag}: unbalanced quotes in '{value}'"))
}

// ---- config ----

/// Manage slimprobe configuration.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Validate the configuration and report errors.
    Validate,
    /// Show the effective configuration (file + env overrides + defaults).
    Show {
        /// Show only one section (general, container, sensor, http_probe, continue_after).
        #[arg(long)]
        section: Option<String>,
    },
}
