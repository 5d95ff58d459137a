#![doc = include_str!("../README.md")]

pub mod classify;
pub mod client;
pub mod crawler;
pub mod error;
pub mod host_exec;
pub mod ports;
pub mod probe;
pub mod protocol;
pub mod request;
pub mod websocket;

pub use classify::{ErrorClass, RetryTuning};
pub use crawler::{CrawlLimits, CrawlerPool};
pub use error::HttpProbeError;
pub use ports::derive_probe_ports;
pub use probe::{
    ApiSpecProber, HttpProbe, NoopApiSpecProber, ProbeHandle, ProbeSettings, ProbeSummary,
    ProbeTargets,
};
pub use protocol::infer_protocols;
