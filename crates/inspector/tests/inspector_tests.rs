//! ContainerInspector against the mock docker client and the fake sensor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use slimprobe_core::config::{ContainerConfig, SensorConfig};
use slimprobe_core::error::FatalError;
use slimprobe_core::types::PortKey;
use slimprobe_inspector::launch::SENSOR_BIN_PATH;
use slimprobe_inspector::{
    Console, ConsoleBuffer, ContainerInspector, ExecCommand, HostContext, InspectorError,
    MockDockerClient, SessionState,
};
use slimprobe_sensor_ipc::testing::{FakeSensor, FakeSensorScript};
use slimprobe_sensor_ipc::{ChannelOptions, Command, Event};

struct Harness {
    docker: Arc<MockDockerClient>,
    sensor: FakeSensor,
    inspector: ContainerInspector<MockDockerClient>,
    console: ConsoleBuffer,
    _dir: tempfile::TempDir,
}

fn channel_opts() -> ChannelOptions {
    ChannelOptions {
        connect_wait: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(1),
        read_timeout: Duration::from_secs(1),
        write_timeout: Duration::from_secs(1),
        dial_retry_pause: Duration::from_millis(20),
        verify_retry_pause: Duration::from_millis(20),
    }
}

async fn harness_with(
    script: FakeSensorScript,
    mock: MockDockerClient,
    sensor_cfg: SensorConfig,
    container_cfg: ContainerConfig,
) -> Harness {
    let sensor = FakeSensor::start(script).await.unwrap();
    let docker = Arc::new(
        mock.with_published_port(PortKey::tcp(sensor_cfg.cmd_port), sensor.cmd_port)
            .with_published_port(PortKey::tcp(sensor_cfg.evt_port), sensor.evt_port)
            .with_published_port(PortKey::tcp(8080), 38080),
    );
    let dir = tempfile::tempdir().unwrap();
    let (console, buffer) = Console::buffer();
    let host = HostContext {
        pid: 77,
        now: Utc::now(),
        home: None,
        cwd: PathBuf::from("/"),
        artifacts_dir: dir.path().join("artifacts"),
    };
    let inspector = ContainerInspector::builder(Arc::clone(&docker))
        .container_config(container_cfg)
        .sensor_config(sensor_cfg)
        .host_context(host)
        .console(console)
        .channel_options(channel_opts())
        .build()
        .unwrap();
    Harness {
        docker,
        sensor,
        inspector,
        console: buffer,
        _dir: dir,
    }
}

fn container_cfg() -> ContainerConfig {
    ContainerConfig {
        image: "app:latest".to_owned(),
        ..ContainerConfig::default()
    }
}

fn sensor_cfg() -> SensorConfig {
    SensorConfig {
        event_timeout_secs: 1,
        ..SensorConfig::default()
    }
}

async fn harness(script: FakeSensorScript) -> Harness {
    harness_with(script, MockDockerClient::new(), sensor_cfg(), container_cfg()).await
}

#[tokio::test]
async fn full_session_runs_monitor_and_cleans_up_once() {
    let mut h = harness(FakeSensorScript::well_behaved()).await;

    h.inspector.run_container().await.unwrap();
    assert_eq!(h.inspector.state(), SessionState::Monitoring);
    assert!(h.inspector.artifacts_dir().is_dir());

    let ports = h.inspector.available_ports();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].host_port, 38080);
    assert_eq!(h.inspector.probe_host(), "127.0.0.1");

    h.inspector.finish_monitoring().await.unwrap();
    h.inspector.finish_monitoring().await.unwrap();
    h.inspector.shutdown_container(false).await.unwrap();
    h.inspector.shutdown_container(true).await.unwrap();
    assert_eq!(h.inspector.state(), SessionState::Stopped);

    let received = h.sensor.received();
    assert_eq!(received.len(), 3);
    match &received[0] {
        Command::StartMonitor(start) => {
            assert_eq!(start.app_name, "/app/server");
            assert!(start.app_args.is_empty());
        }
        other => panic!("unexpected first command {other:?}"),
    }
    assert_eq!(received[1], Command::StopMonitor);
    assert_eq!(received[2], Command::ShutdownSensor);

    assert_eq!(h.docker.call_count("stop_container"), 1);
    assert_eq!(h.docker.call_count("remove_container"), 1);
    assert_eq!(h.docker.call_count("container_logs"), 0);
    let calls = h.docker.calls();
    let stop = calls.iter().position(|c| c == "stop_container").unwrap();
    let remove = calls.iter().position(|c| c == "remove_container").unwrap();
    assert!(stop < remove);
}

#[tokio::test]
async fn launch_spec_wraps_app_with_sensor() {
    let mut h = harness(FakeSensorScript::well_behaved()).await;
    h.inspector.run_container().await.unwrap();

    let spec = h.docker.created_spec().unwrap();
    assert!(spec.name.starts_with("slimk_77_"));
    assert_eq!(spec.entrypoint, vec![SENSOR_BIN_PATH]);
    assert!(spec.ports.exposed.contains(&PortKey::tcp(65501)));
    assert!(spec.ports.exposed.contains(&PortKey::tcp(65502)));
    assert!(spec.ports.publish_all);
    h.inspector.shutdown_container(false).await.unwrap();
}

#[tokio::test]
async fn sensor_error_event_is_fatal() {
    let script = FakeSensorScript {
        on_start: vec![Event::Error {
            data: Some(serde_json::json!("ptrace not permitted")),
        }],
        ..FakeSensorScript::default()
    };
    let mut h = harness(script).await;

    let err = h.inspector.run_container().await.unwrap_err();
    let fatal = err.fatal().cloned().unwrap();
    assert_eq!(
        fatal,
        FatalError::SensorError {
            data: "ptrace not permitted".to_owned()
        }
    );
    assert_eq!(fatal.exit_code(), -124);

    h.inspector
        .shutdown_container(fatal.wants_container_logs())
        .await
        .unwrap();
    let out = h.console.contents();
    assert!(out.contains("container stdout:"));
    assert!(out.contains("end of container logs"));
}

#[tokio::test]
async fn crash_while_waiting_for_monitor_start_short_circuits() {
    let sensor_cfg = SensorConfig {
        event_timeout_secs: 30,
        ..SensorConfig::default()
    };
    let mut h = harness_with(
        FakeSensorScript::default(),
        MockDockerClient::new(),
        sensor_cfg,
        container_cfg(),
    )
    .await;

    let docker = Arc::clone(&h.docker);
    tokio::spawn(async move {
        while docker.call_count("start_container") == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        docker.emit_die(139).await;
    });

    let started = std::time::Instant::now();
    let err = h.inspector.run_container().await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(matches!(
        err.fatal(),
        Some(FatalError::ContainerCrashed { exit_code: 139, .. })
    ));
    assert_eq!(h.inspector.state(), SessionState::Crashed);
    assert!(h.inspector.crash_signal().current().is_some());

    // nothing beyond the start request reached the sensor
    assert!(h.sensor.received().len() <= 1);
    assert!(matches!(
        h.inspector.finish_monitoring().await,
        Err(InspectorError::Fatal(_))
    ));

    h.inspector.shutdown_container(true).await.unwrap();
    assert_eq!(h.docker.call_count("remove_container"), 1);
    assert_eq!(h.inspector.state(), SessionState::Crashed);
}

#[tokio::test]
async fn container_dying_on_start_never_touches_ipc() {
    let mut h = harness_with(
        FakeSensorScript::well_behaved(),
        MockDockerClient::new().with_die_on_start(1),
        sensor_cfg(),
        container_cfg(),
    )
    .await;

    let err = h.inspector.run_container().await.unwrap_err();
    assert!(matches!(
        err.fatal(),
        Some(FatalError::ContainerCrashed { exit_code: 1, .. })
    ));
    assert!(h.sensor.received().is_empty());
    h.inspector.shutdown_container(false).await.unwrap();
}

#[tokio::test]
async fn clean_exit_is_not_a_crash() {
    let mut h = harness(FakeSensorScript::well_behaved()).await;
    h.inspector.run_container().await.unwrap();

    assert!(h.docker.emit_die(0).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.inspector.crash_signal().current().is_none());
    h.inspector.shutdown_container(false).await.unwrap();
}

#[tokio::test]
async fn die_without_exit_code_is_not_a_crash() {
    let mut h = harness(FakeSensorScript::well_behaved()).await;
    h.inspector.run_container().await.unwrap();

    assert!(h.docker.emit_die_without_code().await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.inspector.crash_signal().current().is_none());

    // the watcher is still listening
    assert!(h.docker.emit_die(2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(
        h.inspector.crash_signal().current(),
        Some(FatalError::ContainerCrashed { exit_code: 2, .. })
    ));
    h.inspector.shutdown_container(true).await.unwrap();
}

#[tokio::test]
async fn lost_event_stream_is_not_a_crash() {
    let mut h = harness(FakeSensorScript::well_behaved()).await;
    h.inspector.run_container().await.unwrap();

    h.docker.drop_event_stream();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h.docker.emit_die(9).await);
    assert!(h.inspector.crash_signal().current().is_none());

    h.inspector.finish_monitoring().await.unwrap();
    h.inspector.shutdown_container(false).await.unwrap();
    assert_eq!(h.inspector.state(), SessionState::Stopped);
}

#[tokio::test]
async fn missing_start_confirmation_exhausts_retries() {
    let sensor_cfg = SensorConfig {
        event_timeout_secs: 1,
        start_monitor_retries: 2,
        ..SensorConfig::default()
    };
    let mut h = harness_with(
        FakeSensorScript::default(),
        MockDockerClient::new(),
        sensor_cfg,
        container_cfg(),
    )
    .await;

    let err = h.inspector.run_container().await.unwrap_err();
    assert!(matches!(
        err,
        InspectorError::StartMonitorTimeout { attempts: 2 }
    ));
    assert_eq!(h.sensor.received().len(), 1);
    h.inspector.shutdown_container(false).await.unwrap();
}

#[tokio::test]
async fn missing_stop_confirmation_is_not_fatal() {
    let script = FakeSensorScript {
        on_start: vec![Event::StartMonitorDone],
        ..FakeSensorScript::default()
    };
    let mut h = harness(script).await;
    h.inspector.run_container().await.unwrap();
    h.inspector.finish_monitoring().await.unwrap();
    assert_eq!(h.inspector.state(), SessionState::Stopping);
    h.inspector.shutdown_container(false).await.unwrap();
    assert_eq!(h.docker.call_count("stop_container"), 1);
}

#[tokio::test]
async fn exec_prints_prefixed_output_and_returns_exit_code() {
    let mut h = harness_with(
        FakeSensorScript::well_behaved(),
        MockDockerClient::new().with_exec_result("hello\nworld", 3),
        sensor_cfg(),
        container_cfg(),
    )
    .await;

    let cmd = ExecCommand::Inline("curl -s localhost:8080".to_owned());
    assert!(matches!(
        h.inspector.exec(&cmd).await,
        Err(InspectorError::InvalidState { op: "exec", .. })
    ));

    h.inspector.run_container().await.unwrap();
    let code = h.inspector.exec(&cmd).await.unwrap();
    assert_eq!(code, 3);

    let (argv, stdin) = h.docker.exec_calls().remove(0);
    assert_eq!(argv, vec!["sh", "-c", "curl -s localhost:8080"]);
    assert!(stdin.is_none());

    let out = h.console.contents();
    assert!(out.contains("slimprobe[profile][exec]: output: hello\n"));
    assert!(out.contains("slimprobe[profile][exec]: output: world\n"));
    h.inspector.shutdown_container(false).await.unwrap();
}

#[tokio::test]
async fn missing_image_fails_before_create() {
    let mut h = harness_with(
        FakeSensorScript::well_behaved(),
        MockDockerClient::new().without_image(),
        sensor_cfg(),
        container_cfg(),
    )
    .await;

    let err = h.inspector.run_container().await.unwrap_err();
    assert!(matches!(err, InspectorError::ImageNotFound(_)));
    h.inspector.shutdown_container(false).await.unwrap();
    assert_eq!(h.docker.call_count("create_container"), 0);
    assert_eq!(h.docker.call_count("stop_container"), 0);
    assert_eq!(h.inspector.state(), SessionState::Stopped);
}

#[tokio::test]
async fn ipc_port_binding_conflict_is_fatal() {
    let container = ContainerConfig {
        port_bindings: vec!["65502".to_owned()],
        ..container_cfg()
    };
    let mut h = harness_with(
        FakeSensorScript::well_behaved(),
        MockDockerClient::new(),
        sensor_cfg(),
        container,
    )
    .await;

    let err = h.inspector.run_container().await.unwrap_err();
    assert_eq!(err.fatal().map(FatalError::exit_code), Some(-127));
    assert_eq!(h.docker.call_count("create_container"), 0);
}
