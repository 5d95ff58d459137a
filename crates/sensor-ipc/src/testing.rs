//! In-process fake sensor for tests in this and dependent crates.
//!
//! Enabled with the `testing` feature.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::frame::{Frame, FrameType};
use crate::message::{Command, CommandResponse, Event, EventMessage};

/// Scripted sensor reactions.
#[derive(Debug, Clone, Default)]
pub struct FakeSensorScript {
    /// Published after `StartMonitor` is acknowledged
    pub on_start: Vec<Event>,
    /// Published after `StopMonitor` is acknowledged
    pub on_stop: Vec<Event>,
    /// Published after `ShutdownSensor` is acknowledged
    pub on_shutdown: Vec<Event>,
    /// Answer requests with an error frame
    pub reject_commands: bool,
    /// Answer requests with a fresh tid
    pub mismatch_tid: bool,
    /// Never answer requests
    pub silent: bool,
}

impl FakeSensorScript {
    /// A sensor that behaves: start done, stop done, shutdown done.
    pub fn well_behaved() -> Self {
        Self {
            on_start: vec![Event::StartMonitorDone],
            on_stop: vec![Event::StopMonitorDone],
            on_shutdown: vec![Event::ShutdownSensorDone],
            ..Self::default()
        }
    }
}

/// Fake sensor listening on two ephemeral localhost ports.
pub struct FakeSensor {
    pub cmd_port: u16,
    pub evt_port: u16,
    received: Arc<Mutex<Vec<Command>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl FakeSensor {
    pub async fn start(script: FakeSensorScript) -> std::io::Result<Self> {
        let cmd_listener = TcpListener::bind("127.0.0.1:0").await?;
        let evt_listener = TcpListener::bind("127.0.0.1:0").await?;
        let cmd_port = cmd_listener.local_addr()?.port();
        let evt_port = evt_listener.local_addr()?.port();

        let received = Arc::new(Mutex::new(Vec::new()));
        let (evt_tx, evt_rx) = mpsc::unbounded_channel::<Event>();

        let cmd_task = tokio::spawn(serve_commands(
            cmd_listener,
            script,
            Arc::clone(&received),
            evt_tx,
        ));
        let evt_task = tokio::spawn(serve_events(evt_listener, evt_rx));

        Ok(Self {
            cmd_port,
            evt_port,
            received,
            tasks: vec![cmd_task, evt_task],
        })
    }

    /// Commands received so far, in order.
    pub fn received(&self) -> Vec<Command> {
        self.received
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl Drop for FakeSensor {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn serve_commands(
    listener: TcpListener,
    script: FakeSensorScript,
    received: Arc<Mutex<Vec<Command>>>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        let script = script.clone();
        let received = Arc::clone(&received);
        let events = events.clone();
        tokio::spawn(async move {
            handle_command_conn(stream, script, received, events).await;
        });
    }
}

async fn handle_command_conn(
    stream: TcpStream,
    script: FakeSensorScript,
    received: Arc<Mutex<Vec<Command>>>,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let Ok(frame) = Frame::decode(&line) else {
            return;
        };

        let reply = match frame.frame_type {
            FrameType::Control => frame.reply(FrameType::Control, None),
            FrameType::Request => {
                let command = frame
                    .body
                    .clone()
                    .and_then(|b| serde_json::from_value::<Command>(b).ok());
                let Some(command) = command else {
                    let reply = frame.reply(FrameType::Error, None);
                    if write_frame(reader.get_mut(), &reply).await.is_err() {
                        return;
                    }
                    continue;
                };
                if let Ok(mut log) = received.lock() {
                    log.push(command.clone());
                }
                if script.silent {
                    continue;
                }
                if script.reject_commands {
                    frame.reply(FrameType::Error, None)
                } else {
                    let body = serde_json::to_value(CommandResponse::ok()).ok();
                    let mut reply = frame.reply(FrameType::Response, body);
                    if script.mismatch_tid {
                        reply.tid = format!("{}-other", reply.tid);
                    }
                    if write_frame(reader.get_mut(), &reply).await.is_err() {
                        return;
                    }
                    let scripted = match command {
                        Command::StartMonitor(_) => &script.on_start,
                        Command::StopMonitor => &script.on_stop,
                        Command::ShutdownSensor => &script.on_shutdown,
                    };
                    for event in scripted {
                        let _ = events.send(event.clone());
                    }
                    continue;
                }
            }
            _ => frame.reply(FrameType::Error, None),
        };

        if write_frame(reader.get_mut(), &reply).await.is_err() {
            return;
        }
    }
}

async fn serve_events(listener: TcpListener, mut events: mpsc::UnboundedReceiver<Event>) {
    let Ok((mut stream, _)) = listener.accept().await else {
        return;
    };
    while let Some(event) = events.recv().await {
        let body = serde_json::to_value(EventMessage::from(event)).ok();
        let frame = Frame::new(FrameType::Event, body);
        if write_frame(&mut stream, &frame).await.is_err() {
            return;
        }
    }
}

async fn write_frame(stream: &mut TcpStream, frame: &Frame) -> std::io::Result<()> {
    let bytes = frame
        .encode()
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    stream.write_all(&bytes).await?;
    stream.flush().await
}
