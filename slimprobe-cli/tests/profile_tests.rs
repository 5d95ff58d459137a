//! Whole profiling runs against the mock docker client, the fake sensor and
//! a local HTTP server standing in for the application.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use slimprobe_cli::commands::profile::{ProfileReport, coordinator, run_profile};
use slimprobe_cli::continue_after::{Coordinator, SignalSource};
use slimprobe_cli::error::CliError;
use slimprobe_core::config::SlimprobeConfig;
use slimprobe_core::error::{FatalError, SlimprobeError};
use slimprobe_core::types::PortKey;
use slimprobe_inspector::{
    Console, ContainerInspector, HostContext, MockDockerClient, REPORT_FILE_NAME,
};
use slimprobe_sensor_ipc::ChannelOptions;
use slimprobe_sensor_ipc::Command;
use slimprobe_sensor_ipc::testing::{FakeSensor, FakeSensorScript};

struct Harness {
    docker: Arc<MockDockerClient>,
    sensor: FakeSensor,
    config: SlimprobeConfig,
    dir: tempfile::TempDir,
}

impl Harness {
    fn artifacts_dir(&self) -> PathBuf {
        self.dir.path().join("artifacts")
    }

    fn write_report(&self) {
        std::fs::create_dir_all(self.artifacts_dir()).unwrap();
        std::fs::write(self.artifacts_dir().join(REPORT_FILE_NAME), "{}").unwrap();
    }

    fn inspector(&self) -> ContainerInspector<MockDockerClient> {
        let (console, _) = Console::buffer();
        ContainerInspector::builder(Arc::clone(&self.docker))
            .container_config(self.config.container.clone())
            .sensor_config(self.config.sensor.clone())
            .host_context(HostContext {
                pid: 42,
                now: Utc::now(),
                home: None,
                cwd: PathBuf::from("/"),
                artifacts_dir: self.artifacts_dir(),
            })
            .console(console)
            .channel_options(ChannelOptions {
                connect_wait: Duration::from_secs(2),
                connect_timeout: Duration::from_secs(1),
                read_timeout: Duration::from_secs(1),
                write_timeout: Duration::from_secs(1),
                dial_retry_pause: Duration::from_millis(20),
                verify_retry_pause: Duration::from_millis(20),
            })
            .build()
            .unwrap()
    }

    async fn run<R: AsyncBufRead + Unpin>(
        &self,
        coordinator: Coordinator<R>,
    ) -> Result<ProfileReport, SlimprobeError> {
        run_profile(&self.config, self.inspector(), coordinator).await
    }

    /// Runs with input that never delivers a line.
    async fn run_default(&self) -> Result<ProfileReport, SlimprobeError> {
        let coordinator = coordinator(&self.config, tokio::io::empty()).unwrap();
        self.run(coordinator).await
    }
}

/// Publishes the application port 8080 on `app_port` when given.
async fn harness(mock: MockDockerClient, app_port: Option<u16>) -> Harness {
    let mut config = SlimprobeConfig::default();
    config.container.image = "app:latest".to_owned();
    config.sensor.event_timeout_secs = 1;
    config.http_probe.initial_delay_secs = 0;
    config.http_probe.retry_count = 1;

    let sensor = FakeSensor::start(FakeSensorScript::well_behaved())
        .await
        .unwrap();
    let mut mock = mock
        .with_published_port(PortKey::tcp(config.sensor.cmd_port), sensor.cmd_port)
        .with_published_port(PortKey::tcp(config.sensor.evt_port), sensor.evt_port);
    if let Some(port) = app_port {
        mock = mock.with_published_port(PortKey::tcp(8080), port);
    }

    Harness {
        docker: Arc::new(mock),
        sensor,
        config,
        dir: tempfile::tempdir().unwrap(),
    }
}

/// Answers every request with an empty 200.
async fn serve_ok() -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
                let _ = stream.shutdown().await;
            });
        }
    });
    (port, hits)
}

async fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[tokio::test]
async fn probe_mode_collects_and_copies_the_report() {
    let (port, hits) = serve_ok().await;
    let mut h = harness(MockDockerClient::new(), Some(port)).await;
    let dest = h.dir.path().join("meta");
    h.config.container.copy_meta_artifacts = dest.display().to_string();
    h.write_report();

    let report = h.run_default().await.unwrap();
    assert_eq!(report.image, "app:latest");
    assert_eq!(report.continue_after.modes, vec!["probe"]);
    let probe = report.continue_after.probe.unwrap();
    assert_eq!(probe.successful, 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(report.copied, vec![dest.join(REPORT_FILE_NAME)]);
    assert!(dest.join(REPORT_FILE_NAME).is_file());

    let received = h.sensor.received();
    assert!(matches!(received[0], Command::StartMonitor(_)));
    assert_eq!(received[1], Command::StopMonitor);
    assert_eq!(received[2], Command::ShutdownSensor);
    assert_eq!(h.docker.call_count("remove_container"), 1);
    assert_eq!(h.docker.call_count("container_logs"), 0);
}

#[tokio::test]
async fn all_failed_probe_ends_the_run_after_shutdown() {
    let port = refused_port().await;
    let h = harness(MockDockerClient::new(), Some(port)).await;
    h.write_report();

    let err = h.run_default().await.unwrap_err();
    assert!(matches!(
        err,
        SlimprobeError::Fatal(FatalError::ProbeFailed { calls: 2 })
    ));
    assert_eq!(CliError::from(err).exit_code(), -1);

    // logs are shown once and the container is still cleaned up
    assert_eq!(h.docker.call_count("container_logs"), 1);
    assert_eq!(h.docker.call_count("remove_container"), 1);
}

#[tokio::test]
async fn continue_on_probe_failure_still_completes() {
    let port = refused_port().await;
    let mut h = harness(MockDockerClient::new(), Some(port)).await;
    h.config.http_probe.exit_on_failure = false;
    h.write_report();

    let report = h.run_default().await.unwrap();
    let probe = report.continue_after.probe.unwrap();
    assert!(probe.all_failed());
    assert_eq!(probe.warning(), Some("no.successful.calls"));
    assert_eq!(h.docker.call_count("container_logs"), 1);
}

#[tokio::test]
async fn probe_mode_without_ports_is_fatal() {
    let h = harness(MockDockerClient::new(), None).await;
    h.write_report();

    let err = h.run_default().await.unwrap_err();
    assert!(matches!(
        err,
        SlimprobeError::Fatal(FatalError::NoExposedPorts)
    ));
    assert_eq!(h.docker.call_count("remove_container"), 1);
}

#[tokio::test]
async fn host_network_probes_exposed_ports_on_loopback() {
    let (port, hits) = serve_ok().await;
    let mut h = harness(MockDockerClient::new().with_network_mode("host", ""), None).await;
    // nothing is published; the sensor and the app listen on the host directly
    h.config.sensor.cmd_port = h.sensor.cmd_port;
    h.config.sensor.evt_port = h.sensor.evt_port;
    h.config.container.expose = vec![port.to_string()];
    h.write_report();

    let report = h.run_default().await.unwrap();
    let probe = report.continue_after.probe.unwrap();
    assert_eq!(probe.total, 1);
    assert_eq!(probe.successful, 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(h.docker.call_count("remove_container"), 1);
}

#[tokio::test]
async fn failed_exec_is_reported_after_the_remaining_modes() {
    let (port, hits) = serve_ok().await;
    let mut h = harness(MockDockerClient::new().with_exec_result("", 3), Some(port)).await;
    h.config.continue_after.mode = "exec&probe".to_owned();
    h.config.continue_after.exec_cmd = "curl -s localhost:8080".to_owned();
    h.write_report();

    let err = h.run_default().await.unwrap_err();
    assert!(matches!(err, SlimprobeError::ExecFailed { exit_code: 3 }));
    assert_eq!(CliError::from(err).exit_code(), 1);

    // the probe mode still ran and monitoring was stopped cleanly
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    let (argv, _) = h.docker.exec_calls().remove(0);
    assert_eq!(argv, vec!["sh", "-c", "curl -s localhost:8080"]);
    assert!(h.sensor.received().contains(&Command::StopMonitor));
    assert_eq!(h.docker.call_count("remove_container"), 1);
}

#[tokio::test]
async fn enter_mode_waits_for_a_line() {
    let mut h = harness(MockDockerClient::new(), None).await;
    h.config.continue_after.mode = "enter".to_owned();
    h.config.http_probe.enabled = false;
    h.write_report();

    let (mut tx, rx) = tokio::io::duplex(64);
    let docker = Arc::clone(&h.docker);
    tokio::spawn(async move {
        while docker.call_count("start_container") == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.write_all(b"\n").await.unwrap();
    });

    let coordinator = coordinator(&h.config, BufReader::new(rx)).unwrap();
    let report = h.run(coordinator).await.unwrap();
    assert_eq!(report.continue_after.modes, vec!["enter"]);
    assert!(report.continue_after.probe.is_none());
}

#[tokio::test]
async fn signal_mode_waits_for_the_signal() {
    let mut h = harness(MockDockerClient::new(), None).await;
    h.config.continue_after.mode = "signal".to_owned();
    h.config.http_probe.enabled = false;
    h.write_report();

    let (tx, rx) = mpsc::channel(1);
    let coordinator = coordinator(&h.config, tokio::io::empty())
        .unwrap()
        .signal_source(SignalSource::Channel(rx));
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = tx.send(()).await;
    });

    let report = h.run(coordinator).await.unwrap();
    assert_eq!(report.continue_after.modes, vec!["signal"]);
}

#[tokio::test]
async fn bare_number_mode_is_a_timeout() {
    let mut h = harness(MockDockerClient::new(), None).await;
    h.config.continue_after.mode = "1".to_owned();
    h.config.http_probe.enabled = false;
    h.write_report();

    let started = std::time::Instant::now();
    let report = h.run_default().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(report.continue_after.modes, vec!["timeout"]);
}

#[tokio::test]
async fn host_exec_mode_runs_host_commands() {
    let mut h = harness(MockDockerClient::new(), None).await;
    h.config.continue_after.mode = "host-exec".to_owned();
    h.config.http_probe.enabled = false;
    h.config.http_probe.host_exec_probes = vec!["true".to_owned(), "false".to_owned()];
    h.write_report();

    let report = h.run_default().await.unwrap();
    let host = report.continue_after.host_exec.unwrap();
    assert_eq!(host.total, 2);
    assert_eq!(host.successful, 1);
    assert_eq!(host.failures, 1);
}

#[tokio::test]
async fn crash_while_waiting_ends_the_run() {
    let mut h = harness(MockDockerClient::new(), None).await;
    h.config.continue_after.mode = "enter".to_owned();
    h.config.http_probe.enabled = false;
    h.write_report();

    // keep the writer alive so the read never completes on its own
    let (_tx, rx) = tokio::io::duplex(64);
    let docker = Arc::clone(&h.docker);
    tokio::spawn(async move {
        while docker.call_count("start_container") == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        docker.emit_die(139).await;
    });

    let coordinator = coordinator(&h.config, BufReader::new(rx)).unwrap();
    let err = tokio::time::timeout(Duration::from_secs(10), h.run(coordinator))
        .await
        .expect("crash must end the wait")
        .unwrap_err();
    assert!(matches!(
        err,
        SlimprobeError::Fatal(FatalError::ContainerCrashed { exit_code: 139, .. })
    ));
    assert_eq!(CliError::from(err).exit_code(), -999);
    assert_eq!(h.docker.call_count("container_logs"), 1);
    assert_eq!(h.docker.call_count("remove_container"), 1);
}

#[tokio::test]
async fn missing_report_means_no_collected_data() {
    let mut h = harness(MockDockerClient::new(), None).await;
    h.config.continue_after.mode = "1".to_owned();
    h.config.http_probe.enabled = false;

    let err = h.run_default().await.unwrap_err();
    assert!(matches!(
        err,
        SlimprobeError::Fatal(FatalError::NoCollectedData)
    ));
}
