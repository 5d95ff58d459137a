//! Host console sink for container logs and exec output.
//!
//! Container output goes to the user's terminal, not the tracing log, so
//! it is written through a [`Console`] that tests can capture.

use std::io::Write;
use std::sync::{Arc, Mutex};

/// Shared writer for user-facing container output.
#[derive(Clone)]
pub struct Console {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Console {
    pub fn stdout() -> Self {
        Self::from_writer(std::io::stdout())
    }

    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// An in-memory console and a handle to read what was written.
    pub fn buffer() -> (Self, ConsoleBuffer) {
        let buffer = ConsoleBuffer::default();
        (Self::from_writer(buffer.clone()), buffer)
    }

    pub fn write_bytes(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut sink = self
            .sink
            .lock()
            .map_err(|_| std::io::Error::other("console lock poisoned"))?;
        sink.write_all(bytes)?;
        sink.flush()
    }

    pub fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.write_bytes(&buf)
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::stdout()
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Console")
    }
}

/// Readable side of [`Console::buffer`].
#[derive(Clone, Default)]
pub struct ConsoleBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl ConsoleBuffer {
    pub fn contents(&self) -> String {
        self.inner
            .lock()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()
    }
}

impl Write for ConsoleBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| std::io::Error::other("console buffer poisoned"))?;
        inner.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_captures_lines() {
        let (console, buffer) = Console::buffer();
        console.write_line("one").unwrap();
        console.clone().write_bytes(b"two\n").unwrap();
        assert_eq!(buffer.contents(), "one\ntwo\n");
    }
}
