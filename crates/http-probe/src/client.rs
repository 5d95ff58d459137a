//! HTTP clients used by the probe engine.

use std::time::Duration;

use slimprobe_core::types::ProbeProtocol;

use crate::error::HttpProbeError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_MAX_IDLE_PER_HOST: usize = 10;

/// One client for HTTP/1.1 (with TLS) and one speaking HTTP/2 directly.
///
/// Probed services usually run self-signed certificates, so certificate
/// checks are off for both.
#[derive(Debug, Clone)]
pub struct ProbeClients {
    http1: reqwest::Client,
    http2: reqwest::Client,
}

impl ProbeClients {
    pub fn new() -> Result<Self, HttpProbeError> {
        Ok(Self {
            http1: builder().build().map_err(client_error)?,
            http2: builder()
                .http2_prior_knowledge()
                .build()
                .map_err(client_error)?,
        })
    }

    /// Client for an HTTP protocol; websocket protocols use their own transport.
    pub fn for_protocol(&self, protocol: ProbeProtocol) -> &reqwest::Client {
        match protocol {
            ProbeProtocol::Http2 | ProbeProtocol::Http2c => &self.http2,
            _ => &self.http1,
        }
    }
}

fn builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .danger_accept_invalid_certs(true)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
}

fn client_error(err: reqwest::Error) -> HttpProbeError {
    HttpProbeError::Client(err.to_string())
}
