//! Probe engine driver.
//!
//! One background task walks ports, commands and protocol candidates,
//! runs host probe commands, waits for crawlers and then publishes a
//! [`ProbeSummary`] exactly once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use slimprobe_core::config::HttpProbeConfig;
use slimprobe_core::metrics::{
    LABEL_PROTOCOL, PROBE_CALLS_TOTAL, PROBE_ERRORS_TOTAL, PROBE_OK_TOTAL,
    PROBE_REQUEST_DURATION_SECONDS,
};
use slimprobe_core::types::{ProbeCommand, ProbeProtocol};

use crate::classify::{ErrorClass, RetryTuning, classify};
use crate::client::ProbeClients;
use crate::crawler::{CrawlLimits, CrawlerPool};
use crate::error::HttpProbeError;
use crate::host_exec::{HOST_EXEC_TIMEOUT, run_host_probe};
use crate::protocol::{base_url, infer_protocols};
use crate::request::ProbeRequest;
use crate::websocket::{WS_READ_TIMEOUT, send_probe};

/// Call counters for one probe session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProbeSummary {
    pub total: u64,
    pub failures: u64,
    pub successful: u64,
}

impl ProbeSummary {
    /// Calls were made and none succeeded.
    pub fn all_failed(&self) -> bool {
        self.total > 0 && self.successful == 0
    }

    pub fn warning(&self) -> Option<&'static str> {
        if self.total == 0 {
            Some("no.calls")
        } else if self.successful == 0 {
            Some("no.successful.calls")
        } else {
            None
        }
    }

    fn record(&mut self, protocol: &'static str, ok: bool) {
        self.total += 1;
        counter!(PROBE_CALLS_TOTAL, LABEL_PROTOCOL => protocol).increment(1);
        if ok {
            self.successful += 1;
            counter!(PROBE_OK_TOTAL, LABEL_PROTOCOL => protocol).increment(1);
        } else {
            self.failures += 1;
            counter!(PROBE_ERRORS_TOTAL, LABEL_PROTOCOL => protocol).increment(1);
        }
    }
}

/// Tuning for one probe session.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub commands: Vec<ProbeCommand>,
    /// Keep probing later ports after a success
    pub full: bool,
    pub initial_delay: Duration,
    pub retry: RetryTuning,
    pub crawl: CrawlLimits,
    pub max_concurrent_crawlers: i64,
    pub host_exec_probes: Vec<String>,
    pub host_exec_timeout: Duration,
    pub ws_read_timeout: Duration,
}

impl ProbeSettings {
    /// No configured commands means a single `GET /`.
    pub fn from_config(cfg: &HttpProbeConfig) -> Self {
        let commands = if cfg.commands.is_empty() {
            vec![ProbeCommand::default()]
        } else {
            cfg.commands.clone()
        };
        Self {
            commands,
            full: cfg.full,
            initial_delay: Duration::from_secs(cfg.initial_delay_secs + cfg.start_wait_secs),
            retry: RetryTuning::from_config(cfg.retry_count, cfg.retry_wait_secs),
            crawl: CrawlLimits::from_config(cfg),
            max_concurrent_crawlers: cfg.max_concurrent_crawlers,
            host_exec_probes: cfg.host_exec_probes.clone(),
            host_exec_timeout: HOST_EXEC_TIMEOUT,
            ws_read_timeout: WS_READ_TIMEOUT,
        }
    }
}

/// Where to send probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTargets {
    pub host: String,
    /// Already ordered, see [`crate::ports::derive_probe_ports`]
    pub ports: Vec<u16>,
}

/// Probes API specs after the first successful call.
pub trait ApiSpecProber: Send + Sync {
    fn probe<'a>(&'a self, protocol: ProbeProtocol, host: &'a str, port: u16) -> BoxFuture<'a, ()>;
}

/// Does nothing; used when no API specs are configured.
#[derive(Debug, Default)]
pub struct NoopApiSpecProber;

impl ApiSpecProber for NoopApiSpecProber {
    fn probe<'a>(&'a self, _: ProbeProtocol, _: &'a str, _: u16) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

pub struct HttpProbe {
    settings: ProbeSettings,
    targets: ProbeTargets,
    api_spec: Arc<dyn ApiSpecProber>,
    cancel: CancellationToken,
}

impl HttpProbe {
    pub fn new(settings: ProbeSettings, targets: ProbeTargets) -> Self {
        Self {
            settings,
            targets,
            api_spec: Arc::new(NoopApiSpecProber),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_api_spec_prober(mut self, prober: Arc<dyn ApiSpecProber>) -> Self {
        self.api_spec = prober;
        self
    }

    /// Ties the session to an outer token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Spawns the probe task.
    pub fn start(self) -> Result<ProbeHandle, HttpProbeError> {
        let clients = ProbeClients::new()?;
        let crawler = CrawlerPool::new(
            self.settings.crawl,
            self.settings.max_concurrent_crawlers,
            self.cancel.child_token(),
        );
        let (done_tx, done_rx) = watch::channel(None);
        let cancel = self.cancel.clone();

        let run = ProbeRun {
            settings: self.settings,
            targets: self.targets,
            api_spec: self.api_spec,
            cancel: self.cancel,
            clients,
            crawler,
            summary: ProbeSummary::default(),
            api_spec_probed: false,
        };
        let task = tokio::spawn(async move {
            let summary = run.run().await;
            done_tx.send_replace(Some(summary));
        });

        Ok(ProbeHandle {
            done: done_rx,
            task,
            cancel,
        })
    }
}

/// Handle to a running probe session.
pub struct ProbeHandle {
    done: watch::Receiver<Option<ProbeSummary>>,
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl ProbeHandle {
    /// Waits until probing and crawling are over.
    pub async fn wait(&mut self) -> Result<ProbeSummary, HttpProbeError> {
        let done = self
            .done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| HttpProbeError::Aborted)?;
        (*done).ok_or(HttpProbeError::Aborted)
    }

    /// Summary if the session has finished.
    pub fn summary(&self) -> Option<ProbeSummary> {
        *self.done.borrow()
    }

    pub fn is_done(&self) -> bool {
        self.summary().is_some()
    }

    /// A receiver that sees the summary once it is published.
    pub fn subscribe(&self) -> watch::Receiver<Option<ProbeSummary>> {
        self.done.clone()
    }

    /// Stops probing early; the summary is still published.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct ProbeRun {
    settings: ProbeSettings,
    targets: ProbeTargets,
    api_spec: Arc<dyn ApiSpecProber>,
    cancel: CancellationToken,
    clients: ProbeClients,
    crawler: CrawlerPool,
    summary: ProbeSummary,
    api_spec_probed: bool,
}

impl ProbeRun {
    async fn run(mut self) -> ProbeSummary {
        info!(
            state = "http.probe.starting",
            host = %self.targets.host,
            ports = ?self.targets.ports,
            commands = self.settings.commands.len(),
            "HTTP probe started"
        );

        if self.pause(self.settings.initial_delay).await {
            self.probe_ports().await;
            self.run_host_probes().await;
        }

        info!(
            state = "http.probe.summary",
            total = self.summary.total,
            failures = self.summary.failures,
            successful = self.summary.successful,
            "HTTP probe done"
        );
        match self.summary.warning() {
            Some(warning) => warn!(state = "http.probe.done", warning, "HTTP probe done"),
            None => info!(state = "http.probe.done", "HTTP probe done"),
        }

        self.crawler.wait().await;
        debug!(pages = self.crawler.pages_visited(), "crawlers drained");
        self.summary
    }

    async fn probe_ports(&mut self) {
        let ports = self.targets.ports.clone();
        let commands = self.settings.commands.clone();
        for port in ports {
            if self.summary.successful > 0 && !self.settings.full {
                break;
            }
            for cmd in &commands {
                let request = match ProbeRequest::from_command(cmd).await {
                    Ok(request) => request,
                    Err(e) => {
                        error!(error = %e, "HTTP probe - construct request error");
                        continue;
                    }
                };
                for protocol in infer_protocols(port, cmd.protocol) {
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    let ok = if protocol.is_websocket() {
                        self.call_websocket(protocol, port, &request).await
                    } else {
                        self.call_http(protocol, port, cmd, &request).await
                    };
                    if ok {
                        break;
                    }
                }
            }
        }
    }

    async fn call_http(
        &mut self,
        protocol: ProbeProtocol,
        port: u16,
        cmd: &ProbeCommand,
        request: &ProbeRequest,
    ) -> bool {
        let base = base_url(protocol, &self.targets.host, port);
        let target = format!("{base}{}", request.resource);
        let client = self.clients.for_protocol(protocol).clone();

        for attempt in 1..=self.settings.retry.attempts {
            let started = Instant::now();
            let result = match request.build(&client, &base).send().await {
                Ok(response) => {
                    let status = response.status();
                    if let Err(e) = response.bytes().await {
                        debug!(target = %target, error = %e, "response body not drained");
                    }
                    Ok(status)
                }
                Err(e) => Err(e),
            };
            histogram!(PROBE_REQUEST_DURATION_SECONDS, LABEL_PROTOCOL => protocol.as_str())
                .record(started.elapsed().as_secs_f64());

            match result {
                Ok(status) => {
                    self.summary.record(protocol.as_str(), true);
                    info!(
                        state = "http.probe.call",
                        status = status.as_u16(),
                        method = %request.method,
                        target = %target,
                        attempt,
                        "probe call"
                    );
                    if !self.api_spec_probed {
                        self.api_spec_probed = true;
                        self.api_spec.probe(protocol, &self.targets.host, port).await;
                    }
                    if cmd.crawl {
                        self.crawler.crawl(protocol, &self.targets.host, &target).await;
                    }
                    return true;
                }
                Err(e) => {
                    self.summary.record(protocol.as_str(), false);
                    let class = classify(&e);
                    info!(
                        state = "http.probe.call",
                        status = "error",
                        method = %request.method,
                        target = %target,
                        attempt,
                        error = %e,
                        class = class.as_str(),
                        "probe call"
                    );
                    if attempt < self.settings.retry.attempts
                        && !self.pause(self.settings.retry.wait_for(class)).await
                    {
                        return false;
                    }
                }
            }
        }
        false
    }

    async fn call_websocket(&mut self, protocol: ProbeProtocol, port: u16, request: &ProbeRequest) -> bool {
        let target = format!(
            "{}{}",
            base_url(protocol, &self.targets.host, port),
            request.resource
        );

        for attempt in 1..=self.settings.retry.attempts {
            match send_probe(&target, self.settings.ws_read_timeout).await {
                Ok(reply) => {
                    self.summary.record(protocol.as_str(), true);
                    info!(state = "http.probe.call.ws", status = "ok", target = %target, attempt, "probe call");
                    if let Some(reply) = reply {
                        debug!(target = %target, reply = %reply, "websocket reply");
                    }
                    return true;
                }
                Err(e) => {
                    self.summary.record(protocol.as_str(), false);
                    info!(
                        state = "http.probe.call.ws",
                        status = "error",
                        target = %target,
                        attempt,
                        error = %e,
                        "probe call"
                    );
                    if attempt < self.settings.retry.attempts
                        && !self.pause(self.settings.retry.wait_for(ErrorClass::NotReady)).await
                    {
                        return false;
                    }
                }
            }
        }
        false
    }

    async fn run_host_probes(&mut self) {
        if self.settings.host_exec_probes.is_empty() {
            return;
        }
        let probes = self.settings.host_exec_probes.clone();
        info!(state = "http.probe.apps", count = probes.len(), "running host probes");
        for (idx, command) in probes.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return;
            }
            let result = run_host_probe(command, self.settings.host_exec_timeout).await;
            self.summary.record("exec", result.is_ok());
            match result {
                Ok(()) => info!(state = "http.probe.app", idx, app = %command, status = "ok", "host probe"),
                Err(e) => info!(state = "http.probe.app", idx, app = %command, status = "error", error = %e, "host probe"),
            }
        }
    }

    /// Sleeps unless cancelled first. Returns false on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
