//! `slimprobe profile` command handler
//!
//! Launches the instrumented container, exercises it until the
//! continue-after condition holds, stops monitoring and collects artifacts.
//! Fatal conditions surface as errors only after the container is shut down.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{info, warn};

use slimprobe_core::config::SlimprobeConfig;
use slimprobe_core::error::{FatalError, SlimprobeError};
use slimprobe_core::types::{ContinueAfterMode, IpcMode};
use slimprobe_http_probe::{HttpProbe, ProbeHandle, ProbeSettings, ProbeTargets, derive_probe_ports};
use slimprobe_inspector::artifacts::process_collected_data;
use slimprobe_inspector::{
    BollardDockerClient, ContainerInspector, DockerClient, ExecCommand, HostContext,
    copy_meta_artifacts, docker_host_ip, has_collected_data,
};

use crate::continue_after::{ContinueOutcome, Coordinator};
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Execute the `profile` command against the local docker daemon.
pub async fn execute(config: SlimprobeConfig, writer: &OutputWriter) -> Result<(), CliError> {
    let docker = Arc::new(BollardDockerClient::connect(&config.container.docker_socket)?);
    let docker_host = std::env::var("DOCKER_HOST").ok();
    let inspector = ContainerInspector::builder(docker)
        .container_config(config.container.clone())
        .sensor_config(config.sensor.clone())
        .host_context(host_context(&config)?)
        .docker_host_ip(docker_host_ip(docker_host.as_deref()))
        .build()?;

    let coordinator = coordinator(&config, BufReader::new(tokio::io::stdin()))?;
    let report = run_profile(&config, inspector, coordinator).await?;
    writer.render(&report)
}

fn host_context(config: &SlimprobeConfig) -> Result<HostContext, CliError> {
    let cwd = std::env::current_dir()?;
    let artifacts_dir = PathBuf::from(&config.container.artifacts_dir);
    let artifacts_dir = if artifacts_dir.is_absolute() {
        artifacts_dir
    } else {
        cwd.join(artifacts_dir)
    };
    Ok(HostContext {
        pid: std::process::id(),
        now: chrono::Utc::now(),
        home: std::env::var_os("HOME").map(PathBuf::from),
        cwd,
        artifacts_dir,
    })
}

/// Coordinator for the configured continue-after modes.
pub fn coordinator<R: AsyncBufRead + Unpin>(
    config: &SlimprobeConfig,
    input: R,
) -> Result<Coordinator<R>, CliError> {
    let spec = config.continue_after_spec()?;
    let ca = &config.continue_after;
    Ok(Coordinator::new(spec, input)
        .exec_command(ExecCommand::from_config(&ca.exec_cmd, &ca.exec_file))
        .host_exec_probes(config.http_probe.host_exec_probes.clone())
        .exit_on_probe_failure(config.http_probe.exit_on_failure))
}

/// Result of a completed profiling run.
#[derive(Debug, Serialize)]
pub struct ProfileReport {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub artifacts_dir: PathBuf,
    pub continue_after: ContinueOutcome,
    /// Files produced by profile generators
    pub generated: Vec<String>,
    /// Meta artifacts copied out of the artifact directory
    pub copied: Vec<PathBuf>,
}

impl Render for ProfileReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "Profile: {}", self.image.bold())?;
        if let Some(id) = &self.container_id {
            writeln!(w, "  Container:  {id}")?;
        }
        writeln!(w, "  Artifacts:  {}", self.artifacts_dir.display())?;
        writeln!(w, "  Continued:  {}", self.continue_after.modes.join("&"))?;
        if let Some(probe) = &self.continue_after.probe {
            let line = format!(
                "{} calls, {} ok, {} failed",
                probe.total, probe.successful, probe.failures
            );
            match probe.warning() {
                Some(warning) => writeln!(w, "  HTTP probe: {} ({})", line, warning.yellow())?,
                None => writeln!(w, "  HTTP probe: {}", line.green())?,
            }
        }
        if let Some(host) = &self.continue_after.host_exec {
            writeln!(
                w,
                "  Host exec:  {} run, {} failed",
                host.total, host.failures
            )?;
        }
        if let Some(code) = self.continue_after.exec_exit_code {
            writeln!(w, "  Exec:       exit code {code}")?;
        }
        for file in &self.generated {
            writeln!(w, "  Generated:  {file}")?;
        }
        for path in &self.copied {
            writeln!(w, "  Copied:     {}", path.display())?;
        }
        Ok(())
    }
}

/// Drives one profiling session to completion.
///
/// The container is always shut down before an error is returned. Errors
/// raised after that are, in order: an exec command failure, a missing
/// sensor report, an artifact copy failure.
pub async fn run_profile<D, R>(
    config: &SlimprobeConfig,
    mut inspector: ContainerInspector<D>,
    mut coordinator: Coordinator<R>,
) -> Result<ProfileReport, SlimprobeError>
where
    D: DockerClient,
    R: AsyncBufRead + Unpin,
{
    let driven = drive(config, &mut inspector, &mut coordinator).await;

    let force_logs = match &driven {
        Ok(outcome) => outcome.force_logs,
        Err(SlimprobeError::Fatal(fatal)) => fatal.wants_container_logs(),
        Err(_) => false,
    };
    let shutdown = inspector.shutdown_container(force_logs).await;
    let outcome = match (driven, shutdown) {
        (Ok(outcome), Ok(())) => outcome,
        (Ok(_), Err(e)) => return Err(e.into()),
        (Err(e), shutdown) => {
            if let Err(shutdown_err) = shutdown {
                warn!(error = %shutdown_err, "container shutdown failed");
            }
            return Err(e);
        }
    };

    outcome.exec_result()?;

    let artifacts_dir = inspector.artifacts_dir().to_path_buf();
    if !has_collected_data(&artifacts_dir).await {
        return Err(FatalError::NoCollectedData.into());
    }
    let generated = process_collected_data(&artifacts_dir, &[]);

    let copied = match config.container.copy_meta_artifacts.as_str() {
        "" => Vec::new(),
        dest => copy_meta_artifacts(&artifacts_dir, &generated, Path::new(dest)).await?,
    };

    info!(state = "completed", image = %config.container.image, "profile done");
    Ok(ProfileReport {
        image: config.container.image.clone(),
        container_id: inspector.container_id().map(str::to_owned),
        artifacts_dir,
        continue_after: outcome,
        generated,
        copied,
    })
}

async fn drive<D, R>(
    config: &SlimprobeConfig,
    inspector: &mut ContainerInspector<D>,
    coordinator: &mut Coordinator<R>,
) -> Result<ContinueOutcome, SlimprobeError>
where
    D: DockerClient,
    R: AsyncBufRead + Unpin,
{
    coordinator.install_signal_handler()?;
    inspector.run_container().await?;

    let spec = config.continue_after_spec()?;
    let mut probe = start_probe(config, inspector, spec.contains(ContinueAfterMode::HostExec))?;
    if probe.is_none() && spec.contains(ContinueAfterMode::Probe) {
        return Err(FatalError::NoExposedPorts.into());
    }

    let result = coordinator.run(inspector, probe.as_mut()).await;

    if let Some(mut handle) = probe {
        if !handle.is_done() {
            handle.cancel();
            // let crawl workers wind down before monitoring stops
            if let Err(e) = handle.wait().await {
                warn!(error = %e, "http probe ended without a summary");
            }
        }
    }

    let outcome = result?;
    inspector.finish_monitoring().await?;
    Ok(outcome)
}

/// Starts the probe engine when enabled and there is something to call.
///
/// Host probe commands belong to `host-exec` mode when it is requested;
/// otherwise the engine runs them after the port probes.
fn start_probe<D: DockerClient>(
    config: &SlimprobeConfig,
    inspector: &ContainerInspector<D>,
    host_exec_mode: bool,
) -> Result<Option<ProbeHandle>, SlimprobeError> {
    if !config.http_probe.enabled {
        return Ok(None);
    }

    let direct = config.sensor.ipc_mode == IpcMode::Direct;
    let ports = derive_probe_ports(
        &config.http_probe.ports,
        inspector.image_exposed_ports(),
        &inspector.available_ports(),
        direct,
    );

    let mut settings = ProbeSettings::from_config(&config.http_probe);
    if host_exec_mode {
        settings.host_exec_probes.clear();
    }
    if ports.is_empty() && settings.host_exec_probes.is_empty() {
        warn!(state = "http.probe.error", "no exposed ports to probe");
        return Ok(None);
    }

    let targets = ProbeTargets {
        host: inspector.probe_host(),
        ports,
    };
    Ok(Some(HttpProbe::new(settings, targets).start()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use slimprobe_http_probe::ProbeSummary;

    #[test]
    fn report_text_shows_probe_warning() {
        let report = ProfileReport {
            image: "app:latest".to_owned(),
            container_id: Some("abc".to_owned()),
            artifacts_dir: PathBuf::from("/tmp/a"),
            continue_after: ContinueOutcome {
                modes: vec!["probe".to_owned()],
                probe: Some(ProbeSummary {
                    total: 2,
                    failures: 2,
                    successful: 0,
                }),
                ..ContinueOutcome::default()
            },
            generated: Vec::new(),
            copied: vec![PathBuf::from("/out/creport.json")],
        };
        let mut buffer = Vec::new();
        report.render_text(&mut buffer).unwrap();
        let output = String::from_utf8(buffer).unwrap();
        assert!(output.contains("app:latest"));
        assert!(output.contains("2 calls, 0 ok, 2 failed"));
        assert!(output.contains("no.successful.calls"));
        assert!(output.contains("/out/creport.json"));
    }

    #[test]
    fn coordinator_rejects_bad_mode() {
        let mut config = SlimprobeConfig::default();
        config.continue_after.mode = "later".to_owned();
        assert!(coordinator(&config, tokio::io::empty()).is_err());
    }

    #[test]
    fn host_context_makes_artifacts_dir_absolute() {
        let host = host_context(&SlimprobeConfig::default()).unwrap();
        assert!(host.artifacts_dir.is_absolute());
        assert!(host.artifacts_dir.ends_with("slimprobe-artifacts"));
        assert_eq!(host.pid, std::process::id());
    }
}
