//! Command and event channel connections.
//!
//! Both channels share [`FrameConn`]: a TCP stream split into a buffered
//! line reader and a writer. Reads keep partially received bytes in a
//! per-connection buffer, so a read that hits its timeout can be retried
//! without losing data.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

use crate::error::IpcError;
use crate::frame::{Frame, FrameType, MAX_FRAME_LEN};
use crate::message::{Event, EventMessage};

/// Timeouts and retry pacing for channel connections.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Total time to keep trying to connect, zero for a single attempt
    pub connect_wait: Duration,
    /// Per dial attempt
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Pause after a failed dial
    pub dial_retry_pause: Duration,
    /// Pause after a failed command channel verification
    pub verify_retry_pause: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            connect_wait: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            dial_retry_pause: Duration::from_secs(2),
            verify_retry_pause: Duration::from_secs(5),
        }
    }
}

struct FrameConn {
    addr: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    pending: Vec<u8>,
}

impl FrameConn {
    /// Dials until connected or until `deadline` passes.
    async fn dial(addr: &str, opts: &ChannelOptions, deadline: Instant) -> Result<Self, IpcError> {
        let started = Instant::now();
        loop {
            let reason = match timeout(opts.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    debug!(addr, waited = ?started.elapsed(), "ipc channel connected");
                    let (read, write) = stream.into_split();
                    return Ok(Self {
                        addr: addr.to_owned(),
                        reader: BufReader::new(read),
                        writer: write,
                        pending: Vec::new(),
                    });
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("dial timed out after {:?}", opts.connect_timeout),
            };

            debug!(addr, reason = %reason, "ipc dial failed");
            if opts.connect_wait.is_zero() {
                return Err(IpcError::Connect {
                    addr: addr.to_owned(),
                    reason,
                });
            }
            if Instant::now() + opts.dial_retry_pause >= deadline {
                return Err(IpcError::WaitTimeout {
                    addr: addr.to_owned(),
                    waited: started.elapsed(),
                });
            }
            sleep(opts.dial_retry_pause).await;
        }
    }

    async fn write_frame(&mut self, frame: &Frame, wait: Duration) -> Result<(), IpcError> {
        let bytes = frame.encode()?;
        let write = async {
            self.writer.write_all(&bytes).await?;
            self.writer.flush().await
        };
        timeout(wait, write)
            .await
            .map_err(|_| IpcError::Timeout {
                op: "write",
                after: wait,
            })??;
        debug!(addr = %self.addr, tid = %frame.tid, frame_type = %frame.frame_type, "frame sent");
        Ok(())
    }

    /// Reads the next frame; `None` waits without a deadline.
    async fn read_frame(&mut self, wait: Option<Duration>) -> Result<Frame, IpcError> {
        let read = self.reader.read_until(b'\n', &mut self.pending);
        let n = match wait {
            Some(after) => timeout(after, read)
                .await
                .map_err(|_| IpcError::Timeout { op: "read", after })??,
            None => read.await?,
        };

        if n == 0 || !self.pending.ends_with(b"\n") {
            self.pending.clear();
            return Err(IpcError::Closed);
        }
        let raw = std::mem::take(&mut self.pending);
        if raw.len() > MAX_FRAME_LEN {
            return Err(IpcError::Malformed(format!(
                "frame of {} bytes exceeds limit",
                raw.len()
            )));
        }
        let frame = Frame::decode(&raw)?;
        debug!(addr = %self.addr, tid = %frame.tid, frame_type = %frame.frame_type, "frame received");
        Ok(frame)
    }

    async fn close(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!(addr = %self.addr, error = %e, "ipc channel shutdown failed");
        }
    }
}

fn expect_reply(request: &Frame, reply: &Frame, expected: FrameType) -> Result<(), IpcError> {
    if reply.frame_type == FrameType::Error {
        let detail = reply
            .body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_else(|| "error frame".to_owned());
        return Err(IpcError::Remote(detail));
    }
    if reply.frame_type != expected {
        return Err(IpcError::UnexpectedFrame(reply.frame_type));
    }
    if reply.tid != request.tid {
        return Err(IpcError::TidMismatch {
            expected: request.tid.clone(),
            actual: reply.tid.clone(),
        });
    }
    Ok(())
}

/// Request/response channel.
pub struct CommandChannel {
    conn: FrameConn,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl CommandChannel {
    /// Connects and verifies the peer with a control frame round trip.
    ///
    /// Dial and verification failures are retried until
    /// `opts.connect_wait` runs out.
    pub async fn connect(addr: &str, opts: &ChannelOptions) -> Result<Self, IpcError> {
        let started = Instant::now();
        let deadline = started + opts.connect_wait;
        loop {
            let conn = FrameConn::dial(addr, opts, deadline).await?;
            let mut channel = Self {
                conn,
                read_timeout: opts.read_timeout,
                write_timeout: opts.write_timeout,
            };

            let err = match channel.verify().await {
                Ok(()) => return Ok(channel),
                Err(e) => e,
            };
            debug!(addr, error = %err, "command channel verification failed");
            channel.conn.close().await;

            if opts.connect_wait.is_zero() {
                return Err(err);
            }
            if Instant::now() + opts.verify_retry_pause >= deadline {
                return Err(IpcError::WaitTimeout {
                    addr: addr.to_owned(),
                    waited: started.elapsed(),
                });
            }
            sleep(opts.verify_retry_pause).await;
        }
    }

    async fn verify(&mut self) -> Result<(), IpcError> {
        let request = Frame::new(FrameType::Control, None);
        self.conn.write_frame(&request, self.write_timeout).await?;
        let reply = self.conn.read_frame(Some(self.read_timeout)).await?;
        expect_reply(&request, &reply, FrameType::Control)
    }

    /// Sends one request and waits for its correlated response body.
    pub async fn call(&mut self, body: serde_json::Value) -> Result<serde_json::Value, IpcError> {
        if body.is_null() {
            return Err(IpcError::NoData);
        }
        let request = Frame::new(FrameType::Request, Some(body));
        self.conn.write_frame(&request, self.write_timeout).await?;
        let reply = self.conn.read_frame(Some(self.read_timeout)).await?;
        expect_reply(&request, &reply, FrameType::Response)?;
        reply.body.ok_or(IpcError::NoData)
    }

    pub async fn close(&mut self) {
        self.conn.close().await;
    }
}

/// Sensor to host notification channel.
pub struct EventChannel {
    conn: FrameConn,
}

impl EventChannel {
    pub async fn connect(addr: &str, opts: &ChannelOptions) -> Result<Self, IpcError> {
        let deadline = Instant::now() + opts.connect_wait;
        let conn = FrameConn::dial(addr, opts, deadline).await?;
        Ok(Self { conn })
    }

    /// Waits for the next event; `None` waits indefinitely.
    pub async fn next_event(&mut self, wait: Option<Duration>) -> Result<Event, IpcError> {
        let frame = self.conn.read_frame(wait).await?;
        if frame.frame_type != FrameType::Event {
            return Err(IpcError::UnexpectedFrame(frame.frame_type));
        }
        let body = frame.body.ok_or(IpcError::NoData)?;
        let msg: EventMessage =
            serde_json::from_value(body).map_err(|e| IpcError::Malformed(e.to_string()))?;
        Ok(Event::from(msg))
    }

    pub async fn close(&mut self) {
        self.conn.close().await;
    }
}

/// `host:port`, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn fast_opts() -> ChannelOptions {
        ChannelOptions {
            connect_wait: Duration::ZERO,
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_millis(300),
            write_timeout: Duration::from_secs(2),
            dial_retry_pause: Duration::from_millis(20),
            verify_retry_pause: Duration::from_millis(20),
        }
    }

    #[test]
    fn join_host_port_brackets_ipv6() {
        assert_eq!(join_host_port("127.0.0.1", 65501), "127.0.0.1:65501");
        assert_eq!(join_host_port("::1", 65502), "[::1]:65502");
    }

    #[test]
    fn expect_reply_checks_type_then_tid() {
        let request = Frame::new(FrameType::Request, None);
        let wrong_type = request.reply(FrameType::Event, None);
        assert!(matches!(
            expect_reply(&request, &wrong_type, FrameType::Response),
            Err(IpcError::UnexpectedFrame(FrameType::Event))
        ));
        let error = request.reply(FrameType::Error, None);
        assert!(matches!(
            expect_reply(&request, &error, FrameType::Response),
            Err(IpcError::Remote(_))
        ));
        let other = Frame::new(FrameType::Response, None);
        assert!(matches!(
            expect_reply(&request, &other, FrameType::Response),
            Err(IpcError::TidMismatch { .. })
        ));
        let ok = request.reply(FrameType::Response, None);
        expect_reply(&request, &ok, FrameType::Response).unwrap();
    }

    #[tokio::test]
    async fn dial_without_wait_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = EventChannel::connect(&addr, &fast_opts()).await.err().unwrap();
        assert!(matches!(err, IpcError::Connect { .. }));
    }

    #[tokio::test]
    async fn dial_with_wait_gives_up_with_wait_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let opts = ChannelOptions {
            connect_wait: Duration::from_millis(100),
            ..fast_opts()
        };
        let err = EventChannel::connect(&addr, &opts).await.err().unwrap();
        assert!(matches!(err, IpcError::WaitTimeout { .. }));
    }

    #[tokio::test]
    async fn event_read_timeout_is_typed_and_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // half a frame, then the rest after the client timed out
            stream.write_all(b"[<|]{\"tid\":\"1.a\",").await.unwrap();
            sleep(Duration::from_millis(150)).await;
            stream
                .write_all(b"\"type\":\"ft.event\",\"body\":{\"name\":\"event.monitor.start.done\"}}[|>]\n")
                .await
                .unwrap();
            let mut buf = [0u8; 1];
            let _ = stream.read(&mut buf).await;
        });

        let mut channel = EventChannel::connect(&addr, &fast_opts()).await.unwrap();
        let err = channel
            .next_event(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let event = channel
            .next_event(Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(event, Event::StartMonitorDone);

        channel.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn event_channel_reports_closed_on_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut channel = EventChannel::connect(&addr, &fast_opts()).await.unwrap();
        server.await.unwrap();
        let err = channel
            .next_event(Some(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Closed));
    }

    #[tokio::test]
    async fn call_rejects_null_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = Vec::new();
            reader.read_until(b'\n', &mut line).await.unwrap();
            let request = Frame::decode(&line).unwrap();
            let reply = request.reply(FrameType::Control, None).encode().unwrap();
            reader.get_mut().write_all(&reply).await.unwrap();
            let mut rest = Vec::new();
            let _ = reader.read_to_end(&mut rest).await;
        });

        let mut channel = CommandChannel::connect(&addr, &fast_opts()).await.unwrap();
        let err = channel.call(serde_json::Value::Null).await.unwrap_err();
        assert!(matches!(err, IpcError::NoData));
        channel.close().await;
        server.await.unwrap();
    }
}
