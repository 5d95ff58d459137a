//! Sensor IPC client owning both channels.

use std::time::Duration;

use metrics::counter;
use tracing::{debug, info, warn};

use slimprobe_core::metrics::{IPC_COMMANDS_TOTAL, LABEL_COMMAND, LABEL_RESULT};

use crate::channel::{ChannelOptions, CommandChannel, EventChannel, join_host_port};
use crate::error::IpcError;
use crate::message::{Command, CommandResponse, Event};

/// Host side of the sensor IPC.
///
/// Created once the container is running and its ports are known, and
/// stopped explicitly when monitoring ends. Commands are never resent.
pub struct IpcClient {
    target: String,
    cmd: Option<CommandChannel>,
    evt: Option<EventChannel>,
}

impl IpcClient {
    /// Connects the command channel (with verification), then the event channel.
    pub async fn connect(
        host: &str,
        cmd_port: u16,
        evt_port: u16,
        opts: &ChannelOptions,
    ) -> Result<Self, IpcError> {
        let cmd_addr = join_host_port(host, cmd_port);
        let evt_addr = join_host_port(host, evt_port);
        debug!(cmd = %cmd_addr, evt = %evt_addr, "connecting to sensor");

        let cmd = CommandChannel::connect(&cmd_addr, opts).await?;
        let evt = match EventChannel::connect(&evt_addr, opts).await {
            Ok(evt) => evt,
            Err(e) => {
                let mut cmd = cmd;
                cmd.close().await;
                return Err(e);
            }
        };

        info!(target = host, cmd_port, evt_port, "sensor ipc connected");
        Ok(Self {
            target: host.to_owned(),
            cmd: Some(cmd),
            evt: Some(evt),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_stopped(&self) -> bool {
        self.cmd.is_none() && self.evt.is_none()
    }

    /// Sends one command and decodes the sensor's response.
    pub async fn send_command(&mut self, cmd: &Command) -> Result<CommandResponse, IpcError> {
        let channel = self.cmd.as_mut().ok_or(IpcError::Stopped)?;
        let body = serde_json::to_value(cmd).map_err(|e| IpcError::Encode(e.to_string()))?;

        let result = channel.call(body).await.and_then(|reply| {
            serde_json::from_value::<CommandResponse>(reply)
                .map_err(|e| IpcError::Malformed(e.to_string()))
        });

        let outcome = if result.is_ok() { "ok" } else { "error" };
        counter!(IPC_COMMANDS_TOTAL, LABEL_COMMAND => cmd.name(), LABEL_RESULT => outcome)
            .increment(1);

        match &result {
            Ok(resp) => debug!(command = cmd.name(), status = ?resp.status, "sensor command sent"),
            Err(e) => warn!(command = cmd.name(), error = %e, "sensor command failed"),
        }
        result
    }

    /// Waits up to `wait` for the next event.
    ///
    /// An expired wait is [`IpcError::Timeout`]; the channel stays usable.
    pub async fn receive_event(&mut self, wait: Duration) -> Result<Event, IpcError> {
        let channel = self.evt.as_mut().ok_or(IpcError::Stopped)?;
        let event = channel.next_event(Some(wait)).await?;
        debug!(event = event.name(), "sensor event received");
        Ok(event)
    }

    /// Closes both channels. Safe to call more than once.
    pub async fn stop(&mut self) {
        if let Some(mut cmd) = self.cmd.take() {
            cmd.close().await;
        }
        if let Some(mut evt) = self.evt.take() {
            evt.close().await;
        }
        debug!(target = %self.target, "sensor ipc stopped");
    }
}
