//! Continue-after coordinator.
//!
//! Blocks until the instrumented container has been exercised enough,
//! processing the requested modes one after another in declaration order.
//! Every wait is raced against the container crash signal.

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use slimprobe_core::error::{FatalError, SlimprobeError};
use slimprobe_core::types::{ContinueAfterMode, ContinueAfterSpec, DEFAULT_CONTINUE_AFTER_TIMEOUT_SECS};
use slimprobe_http_probe::ProbeHandle;
use slimprobe_http_probe::ProbeSummary;
use slimprobe_http_probe::host_exec::{HOST_EXEC_TIMEOUT, run_host_probe};
use slimprobe_inspector::{ContainerInspector, DockerClient, ExecCommand};

/// Where `signal` mode waits.
pub enum SignalSource {
    /// SIGUSR1 delivered to this process
    Process,
    /// Anything sent on the channel
    Channel(mpsc::Receiver<()>),
}

enum SignalWait {
    #[cfg(unix)]
    Process(tokio::signal::unix::Signal),
    Channel(mpsc::Receiver<()>),
}

impl SignalWait {
    fn install(source: SignalSource) -> Result<Self, SlimprobeError> {
        match source {
            #[cfg(unix)]
            SignalSource::Process => {
                use tokio::signal::unix::{SignalKind, signal};
                Ok(Self::Process(signal(SignalKind::user_defined1())?))
            }
            #[cfg(not(unix))]
            SignalSource::Process => Err(SlimprobeError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "signal mode needs SIGUSR1",
            ))),
            SignalSource::Channel(rx) => Ok(Self::Channel(rx)),
        }
    }

    async fn recv(&mut self) {
        let received = match self {
            #[cfg(unix)]
            Self::Process(sig) => sig.recv().await,
            Self::Channel(rx) => rx.recv().await,
        };
        if received.is_none() {
            // nothing can arrive any more; keep waiting like an unsignalled process
            std::future::pending::<()>().await;
        }
    }
}

/// What the coordinator observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContinueOutcome {
    pub modes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec_exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_exec: Option<ProbeSummary>,
    /// Probing ran and every call failed
    #[serde(skip)]
    pub force_logs: bool,
}

impl ContinueOutcome {
    /// A non-zero exec exit code as its own error.
    pub fn exec_result(&self) -> Result<(), SlimprobeError> {
        match self.exec_exit_code {
            Some(code) if code != 0 => Err(SlimprobeError::ExecFailed { exit_code: code }),
            _ => Ok(()),
        }
    }
}

pub struct Coordinator<R> {
    spec: ContinueAfterSpec,
    input: R,
    signal: Option<SignalSource>,
    signal_wait: Option<SignalWait>,
    exec: Option<ExecCommand>,
    host_exec_probes: Vec<String>,
    exit_on_probe_failure: bool,
}

impl<R: AsyncBufRead + Unpin> Coordinator<R> {
    /// `input` feeds `enter` mode; the process stdin in the binary.
    pub fn new(spec: ContinueAfterSpec, input: R) -> Self {
        Self {
            spec,
            input,
            signal: Some(SignalSource::Process),
            signal_wait: None,
            exec: None,
            host_exec_probes: Vec::new(),
            exit_on_probe_failure: true,
        }
    }

    pub fn signal_source(mut self, source: SignalSource) -> Self {
        self.signal = Some(source);
        self
    }

    pub fn exec_command(mut self, command: Option<ExecCommand>) -> Self {
        self.exec = command;
        self
    }

    pub fn host_exec_probes(mut self, probes: Vec<String>) -> Self {
        self.host_exec_probes = probes;
        self
    }

    pub fn exit_on_probe_failure(mut self, exit: bool) -> Self {
        self.exit_on_probe_failure = exit;
        self
    }

    /// Takes over SIGUSR1 when `signal` mode is requested.
    ///
    /// Call before the container starts: until the handler exists the signal
    /// still terminates the process. Later calls are no-ops.
    pub fn install_signal_handler(&mut self) -> Result<(), SlimprobeError> {
        if self.signal_wait.is_none() && self.spec.contains(ContinueAfterMode::Signal) {
            self.signal_wait = self.signal.take().map(SignalWait::install).transpose()?;
        }
        Ok(())
    }

    /// Processes every mode in order.
    ///
    /// A container crash ends the wait with [`FatalError::ContainerCrashed`];
    /// an all-failed probe with exit-on-failure set ends it with
    /// [`FatalError::ProbeFailed`]. A non-zero exec exit code does not stop
    /// later modes; see [`ContinueOutcome::exec_result`].
    pub async fn run<D: DockerClient>(
        &mut self,
        inspector: &mut ContainerInspector<D>,
        mut probe: Option<&mut ProbeHandle>,
    ) -> Result<ContinueOutcome, SlimprobeError> {
        let crash = inspector.crash_signal();
        let mut outcome = ContinueOutcome {
            modes: self.spec.modes.iter().map(|m| m.as_str().to_owned()).collect(),
            ..ContinueOutcome::default()
        };

        self.install_signal_handler()?;

        for mode in self.spec.modes.clone() {
            info!(state = "continue.after", mode = %mode, "waiting");
            match mode {
                ContinueAfterMode::Enter => {
                    info!("USER INPUT REQUIRED, PRESS <ENTER> WHEN YOU ARE DONE USING THE CONTAINER");
                    let mut line = String::new();
                    let read = crash.guard(self.input.read_line(&mut line)).await?;
                    if let Err(e) = read {
                        warn!(error = %e, "cannot read from input, continuing");
                    }
                }
                ContinueAfterMode::Signal => {
                    info!("send SIGUSR1 when you are done using the container");
                    match self.signal_wait.as_mut() {
                        Some(signal) => crash.guard(signal.recv()).await?,
                        None => {
                            return Err(SlimprobeError::Io(std::io::Error::other(
                                "signal source already consumed",
                            )));
                        }
                    }
                    info!(state = "continue.after", "got SIGUSR1");
                }
                ContinueAfterMode::Timeout => {
                    let secs = self.spec.timeout_secs.unwrap_or(DEFAULT_CONTINUE_AFTER_TIMEOUT_SECS);
                    info!(seconds = secs, "waiting for the target container");
                    crash
                        .guard(tokio::time::sleep(std::time::Duration::from_secs(secs)))
                        .await?;
                    info!(state = "continue.after", "done waiting for the target container");
                }
                ContinueAfterMode::Probe => {
                    let Some(handle) = probe.as_deref_mut() else {
                        return Err(FatalError::NoExposedPorts.into());
                    };
                    info!("waiting for the HTTP probe to finish");
                    let summary = crash.guard(handle.wait()).await??;
                    info!(state = "continue.after", "HTTP probe is done");
                    outcome.probe = Some(summary);
                    if summary.all_failed() {
                        outcome.force_logs = true;
                        if self.exit_on_probe_failure {
                            warn!(state = "probe.error", "no.successful.calls");
                            return Err(FatalError::ProbeFailed {
                                calls: summary.total,
                            }
                            .into());
                        }
                    }
                }
                ContinueAfterMode::Exec => {
                    let Some(command) = self.exec.as_ref() else {
                        return Err(SlimprobeError::ExecFailed { exit_code: -1 });
                    };
                    let code = crash.guard(inspector.exec(command)).await??;
                    info!(state = "continue.after", mode = "exec", exitcode = code, "exec finished");
                    outcome.exec_exit_code = Some(code);
                }
                ContinueAfterMode::HostExec => {
                    let mut summary = ProbeSummary::default();
                    for (idx, command) in self.host_exec_probes.iter().enumerate() {
                        info!(state = "host.exec", idx, app = %command, "running host command");
                        let result = crash.guard(run_host_probe(command, HOST_EXEC_TIMEOUT)).await?;
                        summary.total += 1;
                        match result {
                            Ok(()) => summary.successful += 1,
                            Err(e) => {
                                summary.failures += 1;
                                warn!(idx, error = %e, "host command failed");
                            }
                        }
                    }
                    outcome.host_exec = Some(summary);
                }
            }
        }
        Ok(outcome)
    }
}
