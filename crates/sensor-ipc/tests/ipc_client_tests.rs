//! IpcClient against the in-process fake sensor.

use std::time::Duration;

use slimprobe_sensor_ipc::testing::{FakeSensor, FakeSensorScript};
use slimprobe_sensor_ipc::{ChannelOptions, Command, Event, IpcClient, IpcError, StartMonitor};

fn opts() -> ChannelOptions {
    ChannelOptions {
        connect_wait: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(1),
        read_timeout: Duration::from_millis(500),
        write_timeout: Duration::from_secs(1),
        dial_retry_pause: Duration::from_millis(20),
        verify_retry_pause: Duration::from_millis(20),
    }
}

fn start_monitor() -> Command {
    Command::StartMonitor(StartMonitor {
        app_name: "/app/server".to_owned(),
        app_args: vec!["--port".to_owned(), "8080".to_owned()],
        ..StartMonitor::default()
    })
}

#[tokio::test]
async fn full_monitor_conversation() {
    let sensor = FakeSensor::start(FakeSensorScript::well_behaved())
        .await
        .unwrap();
    let mut client = IpcClient::connect("127.0.0.1", sensor.cmd_port, sensor.evt_port, &opts())
        .await
        .unwrap();

    let resp = client.send_command(&start_monitor()).await.unwrap();
    assert!(resp.is_ok());
    let event = client.receive_event(Duration::from_secs(2)).await.unwrap();
    assert_eq!(event, Event::StartMonitorDone);

    client.send_command(&Command::StopMonitor).await.unwrap();
    let event = client.receive_event(Duration::from_secs(2)).await.unwrap();
    assert_eq!(event, Event::StopMonitorDone);

    client.send_command(&Command::ShutdownSensor).await.unwrap();
    client.stop().await;
    assert!(client.is_stopped());

    let received = sensor.received();
    assert_eq!(received.len(), 3);
    assert!(matches!(received[0], Command::StartMonitor(ref s) if s.app_name == "/app/server"));
    assert_eq!(received[1], Command::StopMonitor);
    assert_eq!(received[2], Command::ShutdownSensor);
}

#[tokio::test]
async fn receive_event_times_out_with_typed_error() {
    let sensor = FakeSensor::start(FakeSensorScript::default()).await.unwrap();
    let mut client = IpcClient::connect("127.0.0.1", sensor.cmd_port, sensor.evt_port, &opts())
        .await
        .unwrap();

    let err = client
        .receive_event(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "got {err}");
}

#[tokio::test]
async fn error_frame_is_remote_error() {
    let script = FakeSensorScript {
        reject_commands: true,
        ..FakeSensorScript::default()
    };
    let sensor = FakeSensor::start(script).await.unwrap();
    let mut client = IpcClient::connect("127.0.0.1", sensor.cmd_port, sensor.evt_port, &opts())
        .await
        .unwrap();

    let err = client.send_command(&Command::StopMonitor).await.unwrap_err();
    assert!(matches!(err, IpcError::Remote(_)));
}

#[tokio::test]
async fn mismatched_tid_is_detected() {
    let script = FakeSensorScript {
        mismatch_tid: true,
        ..FakeSensorScript::default()
    };
    let sensor = FakeSensor::start(script).await.unwrap();
    let mut client = IpcClient::connect("127.0.0.1", sensor.cmd_port, sensor.evt_port, &opts())
        .await
        .unwrap();

    let err = client.send_command(&Command::StopMonitor).await.unwrap_err();
    assert!(matches!(err, IpcError::TidMismatch { .. }));
}

#[tokio::test]
async fn silent_sensor_yields_timeout_not_hang() {
    let script = FakeSensorScript {
        silent: true,
        ..FakeSensorScript::default()
    };
    let sensor = FakeSensor::start(script).await.unwrap();
    let mut client = IpcClient::connect("127.0.0.1", sensor.cmd_port, sensor.evt_port, &opts())
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let err = client.send_command(&Command::StopMonitor).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn stopped_client_refuses_commands() {
    let sensor = FakeSensor::start(FakeSensorScript::default()).await.unwrap();
    let mut client = IpcClient::connect("127.0.0.1", sensor.cmd_port, sensor.evt_port, &opts())
        .await
        .unwrap();
    client.stop().await;
    client.stop().await;

    let err = client.send_command(&Command::StopMonitor).await.unwrap_err();
    assert!(matches!(err, IpcError::Stopped));
    let err = client
        .receive_event(Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, IpcError::Stopped));
}

#[tokio::test]
async fn connect_to_missing_sensor_times_out() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let opts = ChannelOptions {
        connect_wait: Duration::from_millis(150),
        ..opts()
    };
    let err = IpcClient::connect("127.0.0.1", port, port, &opts)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, IpcError::WaitTimeout { .. }));
}
