//! Commands run inside the monitored container.

use std::path::PathBuf;

use crate::console::Console;
use crate::error::InspectorError;

/// What to run in the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecCommand {
    /// Inline shell command, run with `sh -c`
    Inline(String),
    /// Host script fed to `sh -s` on stdin
    Script(PathBuf),
}

impl ExecCommand {
    /// Picks the inline command when both are configured.
    pub fn from_config(cmd: &str, file: &str) -> Option<Self> {
        if !cmd.is_empty() {
            Some(Self::Inline(cmd.to_owned()))
        } else if !file.is_empty() {
            Some(Self::Script(PathBuf::from(file)))
        } else {
            None
        }
    }

    /// argv and stdin for the exec call.
    pub async fn resolve(&self) -> Result<(Vec<String>, Option<Vec<u8>>), InspectorError> {
        match self {
            Self::Inline(cmd) => Ok((
                vec!["sh".to_owned(), "-c".to_owned(), cmd.clone()],
                None,
            )),
            Self::Script(path) => {
                let script = tokio::fs::read(path).await.map_err(|e| {
                    InspectorError::Exec(format!("cannot read {}: {e}", path.display()))
                })?;
                Ok((vec!["sh".to_owned(), "-s".to_owned()], Some(script)))
            }
        }
    }
}

/// Writes output line by line with a fixed prefix.
///
/// A trailing partial line is held until more output or [`finish`](Self::finish).
pub struct PrefixWriter {
    console: Console,
    prefix: String,
    pending: Vec<u8>,
}

impl PrefixWriter {
    pub fn new(console: Console, prefix: impl Into<String>) -> Self {
        Self {
            console,
            prefix: prefix.into(),
            pending: Vec::new(),
        }
    }

    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.pending.extend_from_slice(data);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            self.console.write_line(&format!("{}{}", self.prefix, text))?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> std::io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        self.console.write_line(&format!("{}{}", self.prefix, text))
    }
}
