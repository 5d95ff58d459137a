//! Retry tuning and failure classification.

use std::time::Duration;

/// Attempts per (port, command, protocol) when none is configured.
pub const DEFAULT_RETRY_COUNT: u32 = 5;

const DEFAULT_NOT_READY_WAIT: Duration = Duration::from_secs(16);
const DEFAULT_WEB_ERROR_WAIT: Duration = Duration::from_secs(8);
const DEFAULT_OTHER_ERROR_WAIT: Duration = Duration::from_secs(4);

/// Failure bucket; each has its own wait before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Nothing listening yet, or the connection closed before a response
    NotReady,
    /// Other transport level HTTP failures
    Web,
    Other,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotReady => "not_ready",
            Self::Web => "web",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTuning {
    pub attempts: u32,
    pub not_ready_wait: Duration,
    pub web_error_wait: Duration,
    pub other_error_wait: Duration,
}

impl RetryTuning {
    /// `retry_count == 0` and `retry_wait_secs == 0` select the defaults.
    ///
    /// A wait `w` maps to web `w`, not-ready `2w`, other `w/2`.
    pub fn from_config(retry_count: u32, retry_wait_secs: u64) -> Self {
        let attempts = if retry_count > 0 {
            retry_count
        } else {
            DEFAULT_RETRY_COUNT
        };
        if retry_wait_secs == 0 {
            return Self {
                attempts,
                not_ready_wait: DEFAULT_NOT_READY_WAIT,
                web_error_wait: DEFAULT_WEB_ERROR_WAIT,
                other_error_wait: DEFAULT_OTHER_ERROR_WAIT,
            };
        }
        let wait = Duration::from_secs(retry_wait_secs);
        Self {
            attempts,
            not_ready_wait: wait * 2,
            web_error_wait: wait,
            other_error_wait: wait / 2,
        }
    }

    pub fn wait_for(&self, class: ErrorClass) -> Duration {
        match class {
            ErrorClass::NotReady => self.not_ready_wait,
            ErrorClass::Web => self.web_error_wait,
            ErrorClass::Other => self.other_error_wait,
        }
    }
}

impl Default for RetryTuning {
    fn default() -> Self {
        Self::from_config(0, 0)
    }
}

/// Buckets a client error.
pub fn classify(err: &reqwest::Error) -> ErrorClass {
    if err.is_builder() {
        return ErrorClass::Other;
    }
    if err.is_connect() || is_early_eof(err) {
        return ErrorClass::NotReady;
    }
    ErrorClass::Web
}

/// Walks the source chain for a connection that closed mid-exchange.
fn is_early_eof(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ) {
                return true;
            }
        }
        if inner.to_string().contains("connection closed before message completed") {
            return true;
        }
        source = inner.source();
    }
    false
}
