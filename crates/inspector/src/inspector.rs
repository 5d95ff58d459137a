//! Instrumented container session.
//!
//! [`ContainerInspector`] owns one container and its sensor connection for
//! the duration of a profiling run.
//!
//! ```text
//! Created ──run_container──> Started ──StartMonitorDone──> Monitoring
//!                               │                              │
//!                               └──────── die event ───────────┴──> Crashed
//! Monitoring ──finish_monitoring──> Stopping ──shutdown_container──> Stopped
//! ```
//!
//! A `die` event from the runtime while the container is monitored is
//! published on a watch channel; every wait inside the inspector (and any
//! caller holding a [`CrashSignal`]) observes it and returns
//! [`FatalError::ContainerCrashed`].

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use slimprobe_core::config::{ContainerConfig, SensorConfig};
use slimprobe_core::error::FatalError;
use slimprobe_core::metrics::{
    INSPECTOR_CONTAINER_CRASHES_TOTAL, INSPECTOR_CONTAINERS_STARTED_TOTAL,
};
use slimprobe_core::types::{AvailablePort, PortKey};
use slimprobe_sensor_ipc::{ChannelOptions, Command, Event, IpcClient, IpcError, StartMonitor};

use crate::console::Console;
use crate::docker::{ContainerDetails, DockerClient, RuntimeEvent, StopOutcome};
use crate::error::InspectorError;
use crate::exec::{ExecCommand, PrefixWriter};
use crate::launch::{HostContext, ImageInfo, LaunchPlan, build_launch_plan};
use crate::network::{available_ports, probe_host, resolve_ipc_target};

/// Grace period before the runtime kills the container on stop.
pub const STOP_GRACE_SECS: i64 = 9;

/// Prefix for exec output lines on the console.
pub const EXEC_OUTPUT_PREFIX: &str = "slimprobe[profile][exec]: output: ";

/// Lifecycle state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Started,
    Monitoring,
    Stopping,
    Stopped,
    Crashed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Monitoring => "monitoring",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Observer of the container crash flag.
#[derive(Clone)]
pub struct CrashSignal {
    rx: watch::Receiver<Option<FatalError>>,
}

impl CrashSignal {
    pub fn current(&self) -> Option<FatalError> {
        self.rx.borrow().clone()
    }

    /// Resolves when a crash is published. Never resolves otherwise.
    pub async fn crashed(&mut self) -> FatalError {
        loop {
            if let Some(fatal) = self.rx.borrow_and_update().clone() {
                return fatal;
            }
            if self.rx.changed().await.is_err() {
                if let Some(fatal) = self.rx.borrow().clone() {
                    return fatal;
                }
                std::future::pending::<()>().await;
            }
        }
    }

    /// Runs `fut` unless the container crashes first.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, FatalError> {
        let mut signal = self.clone();
        tokio::select! {
            biased;
            fatal = signal.crashed() => Err(fatal),
            out = fut => Ok(out),
        }
    }
}

/// Builder for [`ContainerInspector`].
pub struct ContainerInspectorBuilder<D: DockerClient> {
    docker: Arc<D>,
    container: ContainerConfig,
    sensor: SensorConfig,
    host: Option<HostContext>,
    docker_host_ip: String,
    console: Console,
    channel: Option<ChannelOptions>,
}

impl<D: DockerClient> ContainerInspectorBuilder<D> {
    pub fn new(docker: Arc<D>) -> Self {
        Self {
            docker,
            container: ContainerConfig::default(),
            sensor: SensorConfig::default(),
            host: None,
            docker_host_ip: "127.0.0.1".to_owned(),
            console: Console::stdout(),
            channel: None,
        }
    }

    pub fn container_config(mut self, config: ContainerConfig) -> Self {
        self.container = config;
        self
    }

    pub fn sensor_config(mut self, config: SensorConfig) -> Self {
        self.sensor = config;
        self
    }

    pub fn host_context(mut self, host: HostContext) -> Self {
        self.host = Some(host);
        self
    }

    pub fn docker_host_ip(mut self, ip: impl Into<String>) -> Self {
        self.docker_host_ip = ip.into();
        self
    }

    pub fn console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }

    /// Overrides channel timeouts derived from the sensor config.
    pub fn channel_options(mut self, opts: ChannelOptions) -> Self {
        self.channel = Some(opts);
        self
    }

    pub fn build(self) -> Result<ContainerInspector<D>, InspectorError> {
        let host = self.host.ok_or_else(|| {
            InspectorError::Launch("host context is required to build an inspector".to_owned())
        })?;
        let channel = self.channel.unwrap_or_else(|| ChannelOptions {
            connect_wait: Duration::from_secs(self.sensor.connect_wait_secs),
            read_timeout: Duration::from_secs(self.sensor.io_timeout_secs),
            write_timeout: Duration::from_secs(self.sensor.io_timeout_secs),
            ..ChannelOptions::default()
        });
        let (crash_tx, crash_rx) = watch::channel(None);

        Ok(ContainerInspector {
            docker: self.docker,
            container: self.container,
            sensor: self.sensor,
            host,
            docker_host_ip: self.docker_host_ip,
            console: self.console,
            channel,
            state: SessionState::Created,
            container_id: None,
            image: None,
            plan: None,
            details: None,
            ipc: None,
            crash_tx: Some(crash_tx),
            crash: CrashSignal { rx: crash_rx },
            watcher: CancellationToken::new(),
            watcher_task: None,
            monitoring_finished: false,
            shutdown_done: false,
        })
    }
}

/// One instrumented container and its sensor connection.
pub struct ContainerInspector<D: DockerClient> {
    docker: Arc<D>,
    container: ContainerConfig,
    sensor: SensorConfig,
    host: HostContext,
    docker_host_ip: String,
    console: Console,
    channel: ChannelOptions,
    state: SessionState,
    container_id: Option<String>,
    image: Option<ImageInfo>,
    plan: Option<LaunchPlan>,
    details: Option<ContainerDetails>,
    ipc: Option<IpcClient>,
    /// Moved into the watcher task on start
    crash_tx: Option<watch::Sender<Option<FatalError>>>,
    crash: CrashSignal,
    watcher: CancellationToken,
    watcher_task: Option<JoinHandle<()>>,
    monitoring_finished: bool,
    shutdown_done: bool,
}

impl<D: DockerClient> ContainerInspector<D> {
    pub fn builder(docker: Arc<D>) -> ContainerInspectorBuilder<D> {
        ContainerInspectorBuilder::new(docker)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    pub fn crash_signal(&self) -> CrashSignal {
        self.crash.clone()
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.host.artifacts_dir
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    /// Ports named by `EXPOSE`, in declaration order.
    pub fn image_exposed_ports(&self) -> &[PortKey] {
        self.image
            .as_ref()
            .map(|i| i.exposed_ports.as_slice())
            .unwrap_or_default()
    }

    /// Non-IPC ports of the running container reachable from the host.
    pub fn available_ports(&self) -> Vec<AvailablePort> {
        match (&self.details, &self.plan) {
            (Some(details), Some(plan)) => available_ports(
                details,
                &plan.spec.ports,
                self.sensor.cmd_port,
                self.sensor.evt_port,
            ),
            _ => Vec::new(),
        }
    }

    /// Host the probe engine should target.
    pub fn probe_host(&self) -> String {
        match &self.details {
            Some(details) => probe_host(self.sensor.ipc_mode, details, &self.docker_host_ip),
            None => self.docker_host_ip.clone(),
        }
    }

    fn require_state(&self, op: &'static str, allowed: &[SessionState]) -> Result<(), InspectorError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(InspectorError::InvalidState {
                op,
                state: self.state.to_string(),
            })
        }
    }

    /// Runs `fut`, turning a published crash into an error.
    async fn guarded<F, T>(&mut self, fut: F) -> Result<T, InspectorError>
    where
        F: Future<Output = Result<T, InspectorError>>,
    {
        match self.crash.guard(fut).await {
            Ok(out) => out,
            Err(fatal) => {
                self.state = SessionState::Crashed;
                Err(fatal.into())
            }
        }
    }

    /// Creates and starts the container, then starts sensor monitoring.
    ///
    /// On success the container is left running in [`SessionState::Monitoring`].
    pub async fn run_container(&mut self) -> Result<(), InspectorError> {
        self.require_state("run container", &[SessionState::Created])?;

        let image = self.docker.image_info(&self.container.image).await?;
        tokio::fs::create_dir_all(&self.host.artifacts_dir).await?;
        let plan = build_launch_plan(&self.container, &self.sensor, &image, &self.host)?;
        self.image = Some(image);

        let id = self.docker.create_container(&plan.spec).await?;
        info!(state = "container.created", container_id = %id, name = %plan.spec.name, "container created");
        self.container_id = Some(id.clone());

        for network in &self.container.networks {
            self.docker.connect_network(&id, network).await?;
            debug!(container_id = %id, network = %network, "network connected");
        }

        let events = self.docker.container_events(&id).await?;
        self.spawn_watcher(id.clone(), events);

        self.docker.start_container(&id).await?;
        self.state = SessionState::Started;
        counter!(INSPECTOR_CONTAINERS_STARTED_TOTAL).increment(1);
        info!(state = "container.started", container_id = %id, "container started");

        let details = self.docker.inspect_container(&id).await?;
        if !details.running {
            if let Some(fatal) = self.crash.current() {
                self.state = SessionState::Crashed;
                return Err(fatal.into());
            }
            error!(container_id = %id, exit_code = details.exit_code, "container exited right after start");
            self.state = SessionState::Crashed;
            return Err(FatalError::ContainerCrashed {
                container_id: id,
                exit_code: details.exit_code,
            }
            .into());
        }

        let target = resolve_ipc_target(
            self.sensor.ipc_mode,
            &self.sensor.ipc_endpoint,
            &details,
            self.sensor.cmd_port,
            self.sensor.evt_port,
            &self.docker_host_ip,
        )?;
        info!(
            state = "container.inspection",
            container_id = %id,
            ip = %details.ip_address,
            ipc_host = %target.host,
            cmd_port = target.cmd_port,
            evt_port = target.evt_port,
            "container inspected"
        );
        self.details = Some(details);

        let opts = self.channel.clone();
        let ipc = self
            .guarded(async {
                IpcClient::connect(&target.host, target.cmd_port, target.evt_port, &opts)
                    .await
                    .map_err(InspectorError::from)
            })
            .await?;
        self.ipc = Some(ipc);

        let start = self.start_monitor_command(&plan);
        self.plan = Some(plan);
        self.start_monitoring(start).await
    }

    fn start_monitor_command(&self, plan: &LaunchPlan) -> Command {
        let (app_name, app_args) = match plan.app_argv.split_first() {
            Some((name, args)) => (name.clone(), args.to_vec()),
            None => (String::new(), Vec::new()),
        };
        let include_workdir = if self.sensor.include_workdir {
            plan.workdir.clone()
        } else {
            String::new()
        };
        Command::StartMonitor(
            StartMonitor {
                app_name,
                app_args,
                app_user: plan.app_user.clone(),
                excludes: self.sensor.excludes.clone(),
                include_bins: self.sensor.include_bins.clone(),
                include_exes: self.sensor.include_exes.clone(),
                include_shell: self.sensor.include_shell,
                include_workdir,
                keep_perms: self.sensor.keep_perms,
                obfuscate_metadata: self.sensor.obfuscate_metadata,
                rta_source_ptrace: self.sensor.rta_source_ptrace,
                ..StartMonitor::default()
            }
            .with_include_paths(self.sensor.includes.iter().cloned()),
        )
    }

    async fn start_monitoring(&mut self, start: Command) -> Result<(), InspectorError> {
        let mut ipc = self.ipc.take().ok_or(IpcError::Stopped)?;
        let result = self.start_monitoring_with(&mut ipc, start).await;
        self.ipc = Some(ipc);
        result
    }

    async fn start_monitoring_with(
        &mut self,
        ipc: &mut IpcClient,
        start: Command,
    ) -> Result<(), InspectorError> {
        let resp = self
            .guarded(async { ipc.send_command(&start).await.map_err(InspectorError::from) })
            .await?;
        if !resp.is_ok() {
            return Err(IpcError::Remote("sensor rejected start monitor".to_owned()).into());
        }

        let attempts = self.sensor.start_monitor_retries;
        let wait = Duration::from_secs(self.sensor.event_timeout_secs);
        for attempt in 1..=attempts {
            let event = self
                .guarded(async { Ok(ipc.receive_event(wait).await) })
                .await?;
            match event {
                Ok(Event::StartMonitorDone) => {
                    self.state = SessionState::Monitoring;
                    info!(state = "monitor.started", attempt, "sensor is monitoring the application");
                    return Ok(());
                }
                Ok(ref e @ (Event::Error { .. } | Event::StartMonitorFailed { .. })) => {
                    let data = e.error_data().unwrap_or_default();
                    error!(event = e.name(), data = %data, "sensor failed to start monitoring");
                    return Err(FatalError::SensorError { data }.into());
                }
                Ok(other) => {
                    return Err(InspectorError::UnexpectedEvent(other.name().to_owned()));
                }
                Err(e @ (IpcError::Timeout { .. } | IpcError::Malformed(_) | IpcError::NoData)) => {
                    warn!(attempt, attempts, error = %e, "no start monitor confirmation yet");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(InspectorError::StartMonitorTimeout { attempts })
    }

    fn spawn_watcher(&mut self, container_id: String, mut events: mpsc::Receiver<RuntimeEvent>) {
        let Some(crash_tx) = self.crash_tx.take() else {
            return;
        };
        let token = self.watcher.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else {
                            warn!(
                                container_id = %container_id,
                                "container event stream ended, crash detection is off"
                            );
                            break;
                        };
                        if !event.is_die() {
                            debug!(action = %event.action, "container runtime event");
                            continue;
                        }
                        let Some(exit_code) = event.exit_code.filter(|code| *code != 0) else {
                            info!(container_id = %container_id, exit_code = ?event.exit_code, "container exited without error");
                            continue;
                        };
                        error!(container_id = %container_id, exit_code, "monitored container crashed");
                        counter!(INSPECTOR_CONTAINER_CRASHES_TOTAL).increment(1);
                        crash_tx.send_replace(Some(FatalError::ContainerCrashed {
                            container_id: container_id.clone(),
                            exit_code,
                        }));
                        break;
                    }
                }
            }
            debug!("container event watcher stopped");
        });
        self.watcher_task = Some(task);
    }

    /// Stops monitoring and lets the sensor flush collected data.
    ///
    /// The stop confirmation wait and the sensor shutdown are best effort.
    pub async fn finish_monitoring(&mut self) -> Result<(), InspectorError> {
        if self.monitoring_finished {
            info!("monitoring already finished");
            return Ok(());
        }
        if let Some(fatal) = self.crash.current() {
            self.state = SessionState::Crashed;
            return Err(fatal.into());
        }
        self.require_state("finish monitoring", &[SessionState::Monitoring])?;

        self.watcher.cancel();
        self.state = SessionState::Stopping;
        self.monitoring_finished = true;

        let Some(ipc) = self.ipc.as_mut() else {
            return Err(IpcError::Stopped.into());
        };

        if let Err(e) = ipc.send_command(&Command::StopMonitor).await {
            warn!(error = %e, "stop monitor command failed");
        }

        let wait = Duration::from_secs(self.sensor.event_timeout_secs);
        match ipc.receive_event(wait).await {
            Ok(event) => info!(state = "monitor.stopped", event = event.name(), "sensor finished monitoring"),
            Err(e) if e.is_timeout() => warn!("no stop confirmation from sensor, continuing"),
            Err(e) => warn!(error = %e, "waiting for stop confirmation failed"),
        }

        if let Err(e) = ipc.send_command(&Command::ShutdownSensor).await {
            debug!(error = %e, "sensor shutdown command failed");
        }
        Ok(())
    }

    /// Tears down the IPC and removes the container.
    ///
    /// Runs once; later calls return immediately. Failures are logged and
    /// never prevent removal from being attempted.
    pub async fn shutdown_container(&mut self, force_logs: bool) -> Result<(), InspectorError> {
        if self.shutdown_done {
            debug!("container shutdown already done");
            return Ok(());
        }
        self.shutdown_done = true;

        self.watcher.cancel();
        if let Some(task) = self.watcher_task.take() {
            let _ = task.await;
        }
        if let Some(mut ipc) = self.ipc.take() {
            ipc.stop().await;
        }

        let Some(id) = self.container_id.clone() else {
            self.mark_stopped();
            return Ok(());
        };

        if self.container.show_container_logs || force_logs {
            if let Err(e) = self.show_container_logs().await {
                warn!(error = %e, "cannot show container logs");
            }
        }

        match self.docker.stop_container(&id, STOP_GRACE_SECS).await {
            Ok(StopOutcome::Stopped) => info!(container_id = %id, "container stopped"),
            Ok(StopOutcome::NotRunning) => info!(container_id = %id, "container was not running"),
            Err(e) => warn!(container_id = %id, error = %e, "container stop failed"),
        }

        if let Err(e) = self.docker.remove_container(&id).await {
            warn!(container_id = %id, error = %e, "container remove failed, killing");
            if let Err(e) = self.docker.kill_container(&id).await {
                warn!(container_id = %id, error = %e, "container kill failed");
            }
        } else {
            info!(state = "container.removed", container_id = %id, "container removed");
        }

        self.mark_stopped();
        Ok(())
    }

    fn mark_stopped(&mut self) {
        if self.state != SessionState::Crashed {
            self.state = SessionState::Stopped;
        }
    }

    /// Prints container stdout and stderr to the console.
    pub async fn show_container_logs(&self) -> Result<(), InspectorError> {
        let id = self.container_id.as_deref().ok_or(InspectorError::InvalidState {
            op: "show logs",
            state: self.state.to_string(),
        })?;
        let logs = self.docker.container_logs(id).await?;

        self.console.write_line("container stdout:")?;
        self.console.write_bytes(&logs.stdout)?;
        self.console.write_line("container stderr:")?;
        self.console.write_bytes(&logs.stderr)?;
        self.console.write_line("end of container logs")?;
        Ok(())
    }

    /// Runs a command in the monitored container and returns its exit code.
    pub async fn exec(&mut self, command: &ExecCommand) -> Result<i64, InspectorError> {
        self.require_state("exec", &[SessionState::Monitoring])?;
        let id = self.container_id.clone().ok_or(InspectorError::InvalidState {
            op: "exec",
            state: self.state.to_string(),
        })?;

        let (argv, stdin) = command.resolve().await?;
        info!(state = "exec.started", argv = ?argv, "running command in container");
        let docker = Arc::clone(&self.docker);
        let output = self
            .guarded(async move { docker.exec(&id, argv, stdin).await })
            .await?;

        let mut writer = PrefixWriter::new(self.console.clone(), EXEC_OUTPUT_PREFIX);
        writer.write(&output.output)?;
        writer.finish()?;

        info!(state = "exec.done", exit_code = output.exit_code, "container command finished");
        Ok(output.exit_code)
    }
}
